//! Chat core error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors that can occur during session and generation operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// An operation needed a current session and there is none.
    #[error("no active session")]
    NoActiveSession,

    /// Session not found.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// Message not found in the session's context window.
    #[error("message not found: '{message_id}'")]
    MessageNotFound { message_id: String },

    /// A send is already streaming for this session.
    #[error("a generation is already in progress for session '{session_id}'")]
    GenerationInProgress { session_id: String },

    /// Backend failure (or cancellation) from the streaming client.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Durable store operation failed.
    #[error("storage error: {reason}")]
    StorageError { reason: String },
}

impl ChatError {
    /// Whether this wraps a user-initiated stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Inference(e) if e.is_cancelled())
    }

    /// The single string shown to the user for this error.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::NoActiveSession => {
                "No active session. Create a new session first.".to_string()
            }
            ChatError::Inference(InferenceError::ConnectionFailed { .. }) => {
                "Could not reach the model server. Is it running?".to_string()
            }
            ChatError::Inference(e) => capitalize(&e.to_string()),
            other => capitalize(&other.to_string()),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::StorageError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_cancelled_only_for_cancelled_inference() {
        assert!(ChatError::from(InferenceError::Cancelled).is_cancelled());
        assert!(!ChatError::from(InferenceError::Timeout { duration_ms: 5 }).is_cancelled());
        assert!(!ChatError::NoActiveSession.is_cancelled());
    }

    #[test]
    fn test_user_message_model_not_found() {
        let err = ChatError::from(InferenceError::ModelNotFound {
            model: "llama3".to_string(),
        });
        assert_eq!(
            err.user_message(),
            "Model 'llama3' not found, please ensure it's downloaded"
        );
    }

    #[test]
    fn test_user_message_connection_failed() {
        let err = ChatError::from(InferenceError::ConnectionFailed {
            endpoint: "http://localhost:11434/api/generate".to_string(),
            reason: "refused".to_string(),
        });
        assert!(err.user_message().contains("model server"));
    }

    #[test]
    fn test_from_rusqlite() {
        let err: ChatError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, ChatError::StorageError { .. }));
    }
}
