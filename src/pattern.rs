//! URL patterns: a path template plus an optional search template.
//!
//! Path templates name segments with `:name` (or `{name}`); a final `*`
//! segment matches the rest of the path. They are compiled into a one-route
//! [`matchit`] tree each, so matching a pattern is a radix lookup.
//!
//! Search templates are `&`-separated `key=value` terms:
//!
//! - `key=:name` captures the value as parameter `name`
//! - `key=*` requires the key with any value
//! - `key=literal` requires that exact value
//!
//! Every listed key must be present; extra query keys are ignored.

use std::collections::HashMap;

use matchit::Router as MatchitRouter;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
enum SearchValue {
    Capture(String),
    Any,
    Literal(String),
}

#[derive(Clone, Debug, PartialEq)]
struct SearchTerm {
    key: String,
    value: SearchValue,
}

pub struct UrlPattern {
    tree: MatchitRouter<()>,
    terms: Vec<SearchTerm>,
}

impl UrlPattern {
    pub fn new(pathname: &str, search: Option<&str>) -> Result<Self> {
        let mut tree = MatchitRouter::new();
        tree.insert(to_matchit(pathname), ())
            .map_err(|e| Error::Validation(format!("invalid path template `{pathname}`: {e}")))?;
        let terms = search.map(parse_search).transpose()?.unwrap_or_default();
        Ok(Self { tree, terms })
    }

    /// Captured parameters when `path` and `query` match, `None` otherwise.
    pub fn matches(&self, path: &str, query: Option<&str>) -> Option<HashMap<String, String>> {
        let matched = self.tree.at(path).ok()?;
        let mut params: HashMap<String, String> = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();

        if self.terms.is_empty() {
            return Some(params);
        }
        let pairs: Vec<(&str, &str)> = query
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .collect();

        for term in &self.terms {
            let (_, value) = pairs.iter().find(|(k, _)| *k == term.key)?;
            match &term.value {
                SearchValue::Capture(name) => {
                    params.insert(name.clone(), (*value).to_owned());
                }
                SearchValue::Any => {}
                SearchValue::Literal(expected) if expected == *value => {}
                SearchValue::Literal(_) => return None,
            }
        }
        Some(params)
    }
}

fn to_matchit(pathname: &str) -> String {
    pathname
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if segment == "*" {
                "{*rest}".to_owned()
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn parse_search(search: &str) -> Result<Vec<SearchTerm>> {
    search
        .trim_start_matches('?')
        .split('&')
        .filter(|term| !term.is_empty())
        .map(|term| {
            let (key, value) = term.split_once('=').unwrap_or((term, "*"));
            if key.is_empty() {
                return Err(Error::Validation(format!("invalid search template term `{term}`")));
            }
            let value = match value {
                "*" => SearchValue::Any,
                v => match v.strip_prefix(':') {
                    Some(name) if !name.is_empty() => SearchValue::Capture(name.to_owned()),
                    _ => SearchValue::Literal(v.to_owned()),
                },
            };
            Ok(SearchTerm { key: key.to_owned(), value })
        })
        .collect()
}
