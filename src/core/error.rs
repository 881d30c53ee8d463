//! Error types for Braid-HTTP server operations.
//!
//! The [`Result`] alias is used by every fallible function in the crate.
//!
//! # Error Categories
//!
//! | Category | Variants | HTTP status |
//! |----------|----------|-------------|
//! | Framing | `Protocol`, `HeaderParse`, `MissingContentLength`, `MultiplexVersion` | 400 |
//! | Usage | `Usage` | 500 |
//! | State conflict | `Conflict` | 409 |
//! | Not found | `NotFound`, `MultiplexerMissing` | 404 / 424 |
//! | Transport | `Io`, `BodyParse`, `ResponseClosed`, `BodyConsumed` | 500 |
//!
//! A stream that ends before every declared patch arrived is *not* an error:
//! see [`ParsedUpdate::incomplete`](crate::core::server::ParsedUpdate).
//!
//! # Examples
//!
//! ```
//! use braid_http::BraidError;
//!
//! let err = BraidError::Conflict("multiplexer m1 already exists".into());
//! assert_eq!(err.status_code().as_u16(), 409);
//! assert!(err.to_string().contains("m1"));
//! ```

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Result type for Braid HTTP operations.
pub type Result<T> = std::result::Result<T, BraidError>;

/// Errors that can occur while parsing, sending or multiplexing Braid traffic.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BraidError {
    /// Network I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed Braid header (`Version`, `Parents`, `Patches`, `Content-Range`, ...).
    #[error("Header parse error: {0}")]
    HeaderParse(String),

    /// The request body stream errored before it could be parsed.
    #[error("Body parse error: {0}")]
    BodyParse(String),

    /// Framing violation inside a patch block.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A patch header block arrived without `Content-Length`.
    #[error("No content-length in patch headers: {0}")]
    MissingContentLength(String),

    /// `Multiplex-Version` did not match the supported version. Holds the
    /// version the client sent, if any.
    #[error("Bad Multiplexer Version")]
    MultiplexVersion(Option<String>),

    /// The application called the API incorrectly (bad status, empty patches,
    /// headers after flush). Never caused by the peer.
    #[error("Invalid usage: {0}")]
    Usage(String),

    /// An identifier is already in use.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown multiplexer or request on a teardown.
    #[error("{0}")]
    NotFound(String),

    /// A `Multiplex-Through` request named a multiplexer that does not exist.
    #[error("multiplexer {0} does not exist")]
    MultiplexerMissing(String),

    /// Write attempted on a response that is closed or ended.
    #[error("Response closed")]
    ResponseClosed,

    /// The request body was consumed by an earlier parse that failed.
    #[error("Request body already consumed")]
    BodyConsumed,

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error in the library.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BraidError {
    /// The HTTP status a server answers with when this error ends a request.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            BraidError::HeaderParse(_)
            | BraidError::Protocol(_)
            | BraidError::MissingContentLength(_)
            | BraidError::MultiplexVersion(_)
            | BraidError::BodyParse(_)
            | BraidError::Json(_) => StatusCode::BAD_REQUEST,
            BraidError::Conflict(_) => StatusCode::CONFLICT,
            BraidError::NotFound(_) => StatusCode::NOT_FOUND,
            BraidError::MultiplexerMissing(_) => StatusCode::FAILED_DEPENDENCY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for errors caused by malformed bytes from the peer.
    #[inline]
    #[must_use]
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            BraidError::HeaderParse(_)
                | BraidError::Protocol(_)
                | BraidError::MissingContentLength(_)
                | BraidError::MultiplexVersion(_)
        )
    }
}

#[cfg(feature = "server")]
impl axum::response::IntoResponse for BraidError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_errors_are_bad_request() {
        let err = BraidError::MissingContentLength("content-range: json .a".into());
        assert!(err.is_framing());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            BraidError::MultiplexVersion(Some("0.9".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_state_errors_map_to_statuses() {
        assert_eq!(BraidError::Conflict("x".into()).status_code().as_u16(), 409);
        assert_eq!(BraidError::NotFound("x".into()).status_code().as_u16(), 404);
        assert_eq!(
            BraidError::MultiplexerMissing("m".into()).status_code().as_u16(),
            424
        );
    }

    #[test]
    fn test_usage_is_not_framing() {
        let err = BraidError::Usage("status must be between 100 and 600".into());
        assert!(!err.is_framing());
        assert!(err.status_code().is_server_error());
    }

    #[test]
    fn test_error_display() {
        let err = BraidError::MultiplexerMissing("abc".into());
        assert_eq!(err.to_string(), "multiplexer abc does not exist");
        assert_eq!(
            BraidError::MultiplexVersion(Some("0.9".into())).to_string(),
            "Bad Multiplexer Version"
        );
        assert_eq!(BraidError::ResponseClosed.to_string(), "Response closed");
    }
}
