//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility — these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to the generation backend.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the backend failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The backend did not respond (or stalled mid-stream) within the configured timeout.
    #[error("request timed out after {duration_ms}ms; the model might be busy")]
    Timeout { duration_ms: u64 },

    /// The backend returned 404 for a generation request.
    #[error("model '{model}' not found, please ensure it's downloaded")]
    ModelNotFound { model: String },

    /// Any other non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// Reading the response body failed, or the backend reported an error mid-stream.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// The caller signalled the cancellation token. Not a user-visible failure.
    #[error("generation cancelled")]
    Cancelled,

    /// Client construction or configuration problem.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether this is the distinguished user-initiated stop outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InferenceError::Cancelled)
    }

    /// HTTP status code carried by this error, when one is known.
    pub fn status(&self) -> Option<u16> {
        match self {
            InferenceError::HttpError { status, .. } => Some(*status),
            InferenceError::ModelNotFound { .. } => Some(404),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_cancelled() {
        assert!(InferenceError::Cancelled.is_cancelled());
        assert!(!InferenceError::Timeout { duration_ms: 10 }.is_cancelled());
    }

    #[test]
    fn test_status_http_error() {
        let err = InferenceError::HttpError {
            status: 503,
            body: "busy".to_string(),
        };
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_status_model_not_found() {
        let err = InferenceError::ModelNotFound {
            model: "llama3".to_string(),
        };
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("llama3"));
    }

    #[test]
    fn test_status_transport_error() {
        let err = InferenceError::ConnectionFailed {
            endpoint: "http://localhost:11434/api/generate".to_string(),
            reason: "refused".to_string(),
        };
        assert!(err.status().is_none());
    }
}
