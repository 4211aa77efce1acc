//! Error types for the fleet
//!
//! Every component speaks the same error vocabulary so that a failure
//! raised by a leaf can cross the wire, be decoded by the caller, and be
//! handled by the same `match` arms it would use for a local failure.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the fleet
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Request failed validation; never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Key is not owned by the contacted leaf
    #[error("wrong leaf (leaf snapshot version {snapshot_version})")]
    WrongLeaf {
        /// Assignment snapshot version the leaf was acting on
        snapshot_version: u64,
    },

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Deadline expired before the operation finished
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Callee is shedding load
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Callee or its dependency is temporarily unable to serve
    #[error("unavailable: {message}")]
    Unavailable {
        /// Human readable reason
        message: String,
        /// Hint for the caller's backoff
        retry_after_secs: u64,
    },

    /// Bad or missing configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a temporary failure with a one second retry hint
    pub fn unavailable(message: impl Into<String>) -> Self {
        Error::Unavailable {
            message: message.into(),
            retry_after_secs: 1,
        }
    }

    /// Stable wire code
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::WrongLeaf { .. } => "wrong_leaf",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::Overloaded(_) => "overloaded",
            Error::Unavailable { .. } => "unavailable",
            Error::Configuration(_) | Error::Internal(_) => "internal",
        }
    }

    /// HTTP status carrying this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::WrongLeaf { .. } => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Configuration(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the immediate caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Overloaded(_) | Error::Unavailable { .. } | Error::Internal(_)
        )
    }

    /// Rebuild an error received from a peer
    ///
    /// Falls back to the HTTP status when the body is not a recognizable
    /// error envelope.
    pub fn from_wire(status: u16, body: Option<ErrorBody>) -> Self {
        let Some(body) = body else {
            return Self::from_status(status, format!("peer answered HTTP {status}"));
        };
        let message = body.message;
        match body.code.as_str() {
            "invalid_input" => Error::InvalidInput(message),
            "wrong_leaf" => Error::WrongLeaf {
                snapshot_version: body.snapshot_version.unwrap_or_default(),
            },
            "not_found" => Error::NotFound(message),
            "timeout" => Error::Timeout(message),
            "overloaded" => Error::Overloaded(message),
            "unavailable" => Error::Unavailable {
                message,
                retry_after_secs: body.retry_after_secs.unwrap_or(1),
            },
            "internal" => Error::Internal(message),
            _ => Self::from_status(status, message),
        }
    }

    fn from_status(status: u16, message: String) -> Self {
        match status {
            400 | 422 => Error::InvalidInput(message),
            404 => Error::NotFound(message),
            409 => Error::WrongLeaf {
                snapshot_version: 0,
            },
            429 => Error::Overloaded(message),
            503 => Error::unavailable(message),
            504 => Error::Timeout(message),
            _ => Error::Internal(message),
        }
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            snapshot_version: match self {
                Error::WrongLeaf { snapshot_version } => Some(*snapshot_version),
                _ => None,
            },
            retry_after_secs: match self {
                Error::Unavailable {
                    retry_after_secs, ..
                } => Some(*retry_after_secs),
                _ => None,
            },
        }
    }
}

/// JSON error envelope used on every HTTP surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            Error::Unavailable {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };
        let mut response = (status, Json(self.body())).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(format!("malformed JSON: {err}"))
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Internal(format!("metrics: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_decode() {
            Error::Internal(format!("undecodable peer response: {err}"))
        } else {
            Error::unavailable(format!("peer unreachable: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip_keeps_variant() {
        let errors = vec![
            Error::InvalidInput("bad".into()),
            Error::WrongLeaf {
                snapshot_version: 7,
            },
            Error::NotFound("q".into()),
            Error::Timeout("slow".into()),
            Error::Overloaded("busy".into()),
            Error::Unavailable {
                message: "down".into(),
                retry_after_secs: 3,
            },
        ];
        for err in errors {
            let decoded = Error::from_wire(err.status().as_u16(), Some(err.body()));
            assert_eq!(decoded.code(), err.code());
            if let Error::WrongLeaf { snapshot_version } = decoded {
                assert_eq!(snapshot_version, 7);
            }
            if let Error::Unavailable {
                retry_after_secs, ..
            } = decoded
            {
                assert_eq!(retry_after_secs, 3);
            }
        }
    }

    #[test]
    fn test_status_fallback_without_body() {
        assert!(matches!(Error::from_wire(409, None), Error::WrongLeaf { .. }));
        assert!(matches!(Error::from_wire(503, None), Error::Unavailable { .. }));
        assert!(matches!(Error::from_wire(500, None), Error::Internal(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::unavailable("x").is_retryable());
        assert!(Error::Internal("x".into()).is_retryable());
        assert!(!Error::InvalidInput("x".into()).is_retryable());
        assert!(!Error::WrongLeaf { snapshot_version: 1 }.is_retryable());
        assert!(!Error::Timeout("x".into()).is_retryable());
    }

    #[test]
    fn test_unavailable_response_has_retry_after() {
        let response = Error::Unavailable {
            message: "recovering".into(),
            retry_after_secs: 2,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("2")
        );
    }
}
