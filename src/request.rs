//! Incoming HTTP request type.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::method::Method;

/// An incoming request, already read in full.
///
/// Built by the [`Server`](crate::Server) from the wire, or directly with
/// [`Request::new`] when a host platform hands the service its requests.
#[derive(Clone, Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: String,
    pub(crate) ip: String,
    pub(crate) params: HashMap<String, String>,
}

impl Request {
    /// `url` may be absolute (`https://svc/a?b=1`) or origin-form (`/a?b=1`).
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let uri: http::Uri = url
            .parse()
            .map_err(|e| Error::Validation(format!("invalid url `{url}`: {e}")))?;
        Ok(Self {
            method,
            url: url.to_owned(),
            path: uri.path().to_owned(),
            query: uri.query().map(str::to_owned),
            headers: Vec::new(),
            body: String::new(),
            ip: String::new(),
            params: HashMap::new(),
        })
    }

    /// Adds a header. A header named `ip` also becomes the client address.
    pub fn header_pair(mut self, name: &str, value: &str) -> Self {
        if name.eq_ignore_ascii_case("ip") && self.ip.is_empty() {
            self.ip = value.to_owned();
        }
        self.headers.push((name.to_ascii_lowercase(), value.to_owned()));
        self
    }

    pub fn body_text(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn client_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn method(&self) -> Method { self.method }
    pub fn url(&self) -> &str { &self.url }
    pub fn path(&self) -> &str { &self.path }
    pub fn query(&self) -> Option<&str> { self.query.as_deref() }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }
    pub fn body(&self) -> &str { &self.body }
    pub fn ip(&self) -> &str { &self.ip }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns a named parameter captured by the route's path or search template.
    ///
    /// For a route `/users/:id`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// First value of a query-string parameter, undecoded.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub(crate) fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_url() {
        let req = Request::new(Method::Get, "https://auth/login?code=1&state=x").unwrap();
        assert_eq!(req.path(), "/login");
        assert_eq!(req.query(), Some("code=1&state=x"));
        assert_eq!(req.query_param("state"), Some("x"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn ip_header_sets_client_address() {
        let req = Request::new(Method::Post, "/x").unwrap().header_pair("IP", "1.2.3.4");
        assert_eq!(req.ip(), "1.2.3.4");
        assert_eq!(req.header("ip"), Some("1.2.3.4"));
    }

    #[test]
    fn rejects_garbage_urls() {
        assert!(Request::new(Method::Get, "http://[::1").is_err());
    }
}
