//! Handler outcomes, the uniform error envelope and the outgoing response.
//!
//! A handler answers with an [`Outcome`]: a result with a status, or a
//! failure with a status and an error shape. The router normalizes failures
//! into an [`ApiError`] and renders either side as pretty-printed JSON:
//!
//! ```text
//! Success → <status> <result>
//! Failure → <status> {"code": …, "message": …, "trace": …, "data"?: …}
//! ```

use bytes::Bytes;
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

// ── Error catalog ────────────────────────────────────────────────────────────

/// Language of catalog error messages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Lang {
    Ru,
    #[default]
    En,
}

impl Lang {
    /// Picks the language from a tag such as an `Accept-Language` value.
    /// Anything not starting with `ru` is English.
    pub fn from_tag(tag: &str) -> Self {
        let primary = tag.trim().get(..2).unwrap_or_default();
        if primary.eq_ignore_ascii_case("ru") { Self::Ru } else { Self::En }
    }
}

/// Sign-in failures every service answers with `401`: code, Russian and
/// English message.
const AUTH_CATALOG: [(&str, &str, &str); 5] = [
    ("CREDENTIALS_INVALID", "Неверный логин или пароль", "Login or password is invalid"),
    ("TWOFA_CODE_REQUIRED", "Введите 2FA код", "2FA code is required"),
    ("VERIFICATION_CODE_INVALID", "Неверный 2FA код", "2FA code is invalid"),
    ("IDENTITY_TYPE_REQUIRED", "Неверно введенные данные", "Data is invalid"),
    ("STATE_REQUIRED", "Сессия истекла, повторите попытку входа", "Session expired, please try to login again"),
];

// ── ApiError ─────────────────────────────────────────────────────────────────

/// The error envelope clients receive.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub trace: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), trace: None, data: None }
    }

    pub fn with_trace(self, trace: impl Into<Value>) -> Self {
        Self { trace: Some(trace.into()), ..self }
    }

    pub fn with_data(self, data: Value) -> Self {
        Self { data: Some(data), ..self }
    }

    pub fn not_found() -> Self {
        Self::new("NOT_FOUND", "Data not found")
    }

    pub fn state_invalid() -> Self {
        Self::new("STATE_INVALID", "State is not valid")
    }

    pub fn auth_failed() -> Self {
        Self::new("AUTHENTICATION_FAILED", "Request to the API could not be authenticated")
    }

    /// The catalog entry for `code` in `lang`, if `code` is a catalog code.
    pub fn from_catalog(code: &str, lang: Lang) -> Option<Self> {
        AUTH_CATALOG.iter().find(|(known, ..)| *known == code).map(|(code, ru, en)| {
            let message = match lang {
                Lang::Ru => ru,
                Lang::En => en,
            };
            Self::new(*code, *message)
        })
    }

    /// Normalizes whatever error shape a handler or upstream produced.
    ///
    /// Missing or non-string `code` / `message` fall back to `API_ERROR` and
    /// `Error on <url>`.
    pub fn from_shape(shape: &Value, url: &str) -> Self {
        let text = |field: &str| {
            shape
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        let present = |field: &str| shape.get(field).filter(|v| !v.is_null()).cloned();
        Self {
            code: text("code").unwrap_or_else(|| "API_ERROR".to_owned()),
            message: text("message").unwrap_or_else(|| format!("Error on {url}")),
            trace: present("trace"),
            data: present("data"),
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// What a handler produced.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success { status: u16, result: Value },
    /// `error` is normalized by [`ApiError::from_shape`] before rendering.
    Failure { status: u16, error: Value },
}

impl Outcome {
    /// `200` with `result`.
    pub fn ok(result: Value) -> Self {
        Self::Success { status: 200, result }
    }

    pub fn with_status(status: u16, result: Value) -> Self {
        Self::Success { status, result }
    }

    /// `200` with any serializable result.
    pub fn json<T: Serialize>(result: &T) -> Result<Self> {
        Ok(Self::ok(serde_json::to_value(result)?))
    }

    pub fn error(status: u16, error: ApiError) -> Self {
        let error = serde_json::to_value(error).unwrap_or(Value::Null);
        Self::Failure { status, error }
    }

    pub fn not_found() -> Self {
        Self::error(404, ApiError::not_found())
    }

    pub fn state_invalid() -> Self {
        Self::error(400, ApiError::state_invalid())
    }

    pub fn auth_failed() -> Self {
        Self::error(401, ApiError::auth_failed())
    }

    /// `401` with the catalog entry for `code`. Unknown codes fall back to
    /// [`Outcome::auth_failed`].
    pub fn auth_error(code: &str, lang: Lang) -> Self {
        match ApiError::from_catalog(code, lang) {
            Some(error) => Self::error(401, error),
            None => Self::auth_failed(),
        }
    }

    /// `400` with an explicit code, message and trace.
    pub fn bad_request(code: &str, message: &str, trace: Option<Value>) -> Self {
        Self::error(400, ApiError { trace, ..ApiError::new(code, message) })
    }

    /// Re-codes the answer of a sub-request.
    ///
    /// A non-2xx status or a body carrying an error shape becomes a failure
    /// that keeps the upstream code and message when present. Anything else
    /// passes through as the result.
    pub fn from_upstream(status: u16, body: Value) -> Self {
        let error = body.get("error").filter(|e| !is_empty_shape(e)).cloned();
        match error {
            Some(error) => Self::Failure { status: if status < 400 { 400 } else { status }, error },
            None if !(200..300).contains(&status) => Self::Failure { status, error: body },
            None => Self::Success { status, result: body },
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Success { status, .. } | Self::Failure { status, .. } => *status,
        }
    }
}

fn is_empty_shape(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

// ── IntoOutcome ──────────────────────────────────────────────────────────────

/// Conversion of a handler's return value into an [`Outcome`].
///
/// Handlers return `Outcome` when they cannot fail unexpectedly, or
/// `Result<Outcome>` to let `?` hand errors to the router, which reports them
/// as exceptions.
pub trait IntoOutcome {
    fn into_outcome(self) -> Result<Outcome>;
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> Result<Outcome> { Ok(self) }
}

impl IntoOutcome for Result<Outcome> {
    fn into_outcome(self) -> Result<Outcome> { self }
}

impl IntoOutcome for Value {
    fn into_outcome(self) -> Result<Outcome> { Ok(Outcome::ok(self)) }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// The rendered HTTP response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: String,
}

impl Response {
    /// `application/json` response; `body` is serialized pretty-printed.
    pub fn json(status: u16, body: &impl Serialize) -> Self {
        Self::builder().status(status).json(body)
    }

    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: Vec::new(), status: 200 }
    }

    pub fn status(&self) -> u16 { self.status }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }
    pub fn body(&self) -> &str { &self.body }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body back as JSON.
    pub fn body_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub(crate) fn into_http(self) -> http::Response<Full<Bytes>> {
        let mut builder = http::Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Full::new(Bytes::from(self.body)))
            .unwrap_or_else(|_| {
                let mut fallback = http::Response::new(Full::new(Bytes::new()));
                *fallback.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}

// ── ResponseBuilder ──────────────────────────────────────────────────────────

/// Fluent builder for [`Response`]. Defaults to `200`.
pub struct ResponseBuilder {
    headers: Vec<(String, String)>,
    status: u16,
}

impl ResponseBuilder {
    pub fn status(mut self, code: u16) -> Self {
        self.status = code;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Terminate with a pretty-printed JSON body.
    pub fn json(self, body: &impl Serialize) -> Response {
        let body = serde_json::to_string_pretty(body).unwrap_or_else(|_| "null".to_owned());
        let mut headers = vec![("content-type".to_owned(), "application/json".to_owned())];
        headers.extend(self.headers);
        Response { status: self.status, headers, body }
    }
}
