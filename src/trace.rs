//! Trace records, correlation context and redaction.
//!
//! Every interesting event of an invocation becomes a JSON record tagged with
//! the service name, a record type, the correlation id, a timestamp and the
//! trace level in effect. Before a record leaves the process its serialized
//! message goes through the invocation's [`RedactionSet`]: a literal
//! substring replacement of every known secret with [`MASK`].
//!
//! The redaction set starts from the service's static secrets and grows while
//! the invocation runs: outbound response bodies are inspected at the paths
//! listed in [`SensitiveFields`], and whatever string sits there is masked in
//! every record emitted afterwards.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ExceptionPolicy, LogPolicy, ServiceConfig, TraceLevel};

pub const MASK: &str = "MASKED";

/// Upper bound on the serialized size of an exception report.
pub const EXCEPTION_LIMIT: usize = 5000;

/// Header carrying the correlation id between services.
pub const REQUEST_ID_HEADER: &str = "f2x_request_id";

/// Header carrying the caller's trace level.
pub const TRACE_HEADER: &str = "f2x_trace";

/// Who is handling the current invocation and how loudly.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceIdentity {
    pub id: String,
    pub trace: TraceLevel,
    pub log: LogPolicy,
    pub exception: ExceptionPolicy,
}

impl ServiceIdentity {
    /// A fresh identity with a random correlation id.
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trace: config.trace,
            log: config.log,
            exception: config.exception,
        }
    }

    /// Applies the context a caller propagated.
    ///
    /// A non-empty caller id replaces the local one; the trace level can only
    /// go up.
    pub fn propagated(self, id: Option<&str>, trace: Option<TraceLevel>) -> Self {
        let id = match id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => self.id,
        };
        Self { id, trace: self.trace.escalate(trace), ..self }
    }
}

/// JSON pointers into response bodies whose string values are secrets.
#[derive(Clone, Debug, PartialEq)]
pub struct SensitiveFields {
    pointers: Vec<String>,
}

impl Default for SensitiveFields {
    fn default() -> Self {
        Self::new([
            "/client_secret",
            "/secret",
            "/state",
            "/session",
            "/access_token",
            "/refresh_token",
            "/id_token",
        ])
    }
}

impl SensitiveFields {
    pub fn new<I, S>(pointers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { pointers: pointers.into_iter().map(Into::into).collect() }
    }

    pub fn none() -> Self {
        Self { pointers: Vec::new() }
    }

    /// Secret values found in `body`. Non-JSON bodies carry none.
    pub fn discover(&self, body: &str) -> Vec<String> {
        if self.pointers.is_empty() {
            return Vec::new();
        }
        let Ok(json) = serde_json::from_str::<Value>(body) else {
            return Vec::new();
        };
        self.pointers
            .iter()
            .filter_map(|pointer| json.pointer(pointer))
            .filter_map(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// The literal substrings masked out of every outgoing record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RedactionSet {
    secrets: Vec<String>,
}

impl RedactionSet {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        secrets.into_iter().fold(Self::default(), |set, secret| set.with(secret))
    }

    /// The set plus `secret`. Empty strings and duplicates are ignored.
    pub fn with(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() && !self.secrets.contains(&secret) {
            self.secrets.push(secret);
            // Longest first, so a secret containing another is masked whole.
            self.secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
        self
    }

    /// The set extended with every secret `fields` finds in `body`.
    pub fn extended_from(&self, fields: &SensitiveFields, body: &str) -> Self {
        fields.discover(body).into_iter().fold(self.clone(), Self::with)
    }

    pub fn contains(&self, secret: &str) -> bool {
        self.secrets.iter().any(|s| s == secret)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_owned(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }
}

/// Record on the trace channel.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub service_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub message: String,
    pub trace: TraceLevel,
}

/// Record on the exception channel.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionRecord {
    pub service_name: String,
    pub time: String,
    pub message: String,
}

/// Record on the access-log channel.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub service_name: String,
    pub time: String,
    pub request_url: String,
    pub request_method: String,
    pub status_code: u16,
    pub ip: String,
    pub is_error: &'static str,
}

/// Body of an exception report, before masking.
#[derive(Clone, Debug, Serialize)]
pub struct ExceptionReport {
    pub url: String,
    pub body: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExceptionReport {
    pub fn new(error: &crate::Error, url: &str, body: &str) -> Self {
        Self {
            url: url.to_owned(),
            body: body.to_owned(),
            code: error.code().to_owned(),
            message: error.to_string(),
            stack: None,
        }
    }

    pub fn with_stack(self, error: &dyn std::error::Error) -> Self {
        Self { stack: Some(error_chain(error)), ..self }
    }
}

/// The error and its `source()` chain, one cause per line.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = format!("{error}");
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str("\n  caused by: ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_owned(),
        None => text.to_owned(),
    }
}

pub(crate) fn pretty(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn headers_json(headers: &[(String, String)]) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect(),
    )
}

/// Trace message for an inbound or outbound request.
pub fn request_message(
    level: TraceLevel,
    url: &str,
    method: &str,
    headers: &[(String, String)],
    body: &str,
) -> String {
    let mut message = serde_json::Map::new();
    message.insert("requestURL".into(), url.into());
    message.insert("requestMethod".into(), method.to_ascii_lowercase().into());
    if level == TraceLevel::Verbose {
        message.insert("requestHeaders".into(), headers_json(headers));
    }
    message.insert("requestBody".into(), body.into());
    pretty(&message)
}

/// Trace message for a response, ours or a sub-request's.
pub fn response_message(
    level: TraceLevel,
    url: &str,
    status: u16,
    headers: &[(String, String)],
    body: &str,
) -> String {
    let mut message = serde_json::Map::new();
    message.insert("url".into(), url.into());
    message.insert("responseStatus".into(), status.into());
    if level == TraceLevel::Verbose {
        message.insert("responseHeaders".into(), headers_json(headers));
    }
    message.insert("responseBody".into(), body.into());
    pretty(&message)
}
