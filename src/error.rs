//! Unified error type.

use thiserror::Error as ThisError;

/// The error type returned by svcbase's fallible operations.
///
/// Handler-level failures that a client should see as a structured envelope
/// are expressed as [`Outcome::Failure`](crate::Outcome) values. This type
/// covers everything else: bad input detected deep inside a handler, store and
/// crypto failures, delivery channels, outbound fetches and binding a port.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    /// For handlers: nothing inside the crate raises it, absence reads as
    /// `None` instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// A callee answered [`Invocation::call_service`](crate::Invocation::call_service)
    /// with a non-2xx status.
    #[error("upstream error {code}: {message}")]
    Upstream { code: String, message: String },

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("store: {0}")]
    Store(String),

    #[error("channel `{channel}`: {reason}")]
    Channel { channel: String, reason: String },

    #[error("fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("config: {0}")]
    Config(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Envelope error code for this failure.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "VERIFICATION_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Upstream { code, .. } if !code.is_empty() => code,
            Self::Upstream { .. } => "API_ERROR",
            Self::Crypto(_) => "CRYPTO_FAILED",
            Self::Store(_) => "STORE_FAILED",
            Self::Channel { .. } => "CHANNEL_FAILED",
            Self::Fetch { .. } => "FETCH_FAILED",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Json(_) => "VERIFICATION_FAILED",
            Self::Io(_) => "IO_FAILED",
        }
    }

    pub(crate) fn fetch(url: &str, reason: impl ToString) -> Self {
        Self::Fetch { url: url.to_owned(), reason: reason.to_string() }
    }

    pub(crate) fn channel(channel: &str, reason: impl ToString) -> Self {
        Self::Channel { channel: channel.to_owned(), reason: reason.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_code_falls_back_to_api_error() {
        let coded = Error::Upstream { code: "STATE_REQUIRED".into(), message: "m".into() };
        let blank = Error::Upstream { code: String::new(), message: "m".into() };
        assert_eq!(coded.code(), "STATE_REQUIRED");
        assert_eq!(blank.code(), "API_ERROR");
    }

    #[test]
    fn json_errors_count_as_bad_input() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.code(), "VERIFICATION_FAILED");
    }
}
