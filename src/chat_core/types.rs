//! Shared types for the chat core.
//!
//! Messages, sessions, context-window configuration, and the per-send
//! generation state used across the SessionManager and ChatService.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Messages ───────────────────────────────────────────────────────────────

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Label used when rendering the prompt transcript.
    pub fn prompt_label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// UUID v4.
    pub id: String,
    /// Which session this message belongs to.
    pub session_id: String,
    pub role: Role,
    /// Grows in place while an assistant reply streams.
    pub content: String,
    /// Creation time, never changes.
    pub timestamp: DateTime<Utc>,
    /// Derived from `content`. `None` until a ContextWindow has counted it.
    pub token_count: Option<u32>,
}

impl Message {
    /// A fresh message with a new id and the current timestamp.
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            token_count: None,
        }
    }

    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    /// An empty assistant placeholder, filled in as fragments arrive.
    pub fn assistant_placeholder(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, String::new())
    }

    /// Token count, treating an uncounted message as zero.
    pub fn tokens(&self) -> u32 {
        self.token_count.unwrap_or(0)
    }
}

// ─── Sessions ───────────────────────────────────────────────────────────────

/// One conversation: ordered messages plus the running token total.
///
/// `total_tokens` always equals the sum of `token_count` over `messages`.
/// Only `ContextWindow` mutates either field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Human label. Empty until derived from the first user message.
    pub name: String,
    /// Backend model used for generations in this session.
    pub model: String,
    pub messages: Vec<Message>,
    pub total_tokens: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A new empty session for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: String::new(),
            model: model.into(),
            messages: Vec::new(),
            total_tokens: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Session metadata without the message list (what `update_session` persists).
    pub fn metadata(&self) -> Session {
        Session {
            messages: Vec::new(),
            ..self.clone()
        }
    }
}

/// Derive a session name from the leading words of the first user message.
pub fn derive_session_name(text: &str) -> String {
    text.split_whitespace()
        .take(SESSION_NAME_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Number of leading words used for an auto-derived session name.
pub const SESSION_NAME_WORDS: usize = 6;

// ─── Context Window Configuration ───────────────────────────────────────────

/// Token budget for one session's context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextWindowConfig {
    /// Hard ceiling the backend can accept.
    pub max_tokens: u32,
    /// Total at which eviction of the oldest messages begins.
    pub trim_threshold: u32,
    /// Reserved for future history compaction. Not acted on.
    pub summarization_threshold: u32,
    /// How many recent messages are sent as conversation history.
    pub context_messages: usize,
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            trim_threshold: 7000,
            summarization_threshold: 6000,
            context_messages: 5,
        }
    }
}

impl ContextWindowConfig {
    /// Check the threshold ordering. Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.trim_threshold >= self.max_tokens {
            return Err(format!(
                "trim_threshold ({}) must be below max_tokens ({})",
                self.trim_threshold, self.max_tokens
            ));
        }
        if self.summarization_threshold > self.trim_threshold {
            return Err(format!(
                "summarization_threshold ({}) must not exceed trim_threshold ({})",
                self.summarization_threshold, self.trim_threshold
            ));
        }
        if self.context_messages == 0 {
            return Err("context_messages must be at least 1".to_string());
        }
        Ok(())
    }
}

// ─── Generation ─────────────────────────────────────────────────────────────

/// Per-session state of the send flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl GenerationState {
    /// Whether a send is in flight for the session.
    pub fn is_active(&self) -> bool {
        matches!(self, GenerationState::Sending | GenerationState::Streaming)
    }
}

/// Successful (non-error) end of a `send_message` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The backend signalled `done`. Carries the full reply.
    Completed { message_id: String, text: String },
    /// Stopped by the user. Carries whatever had streamed so far.
    Cancelled { message_id: String, partial: String },
}

impl GenerationOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            GenerationOutcome::Completed { message_id, .. }
            | GenerationOutcome::Cancelled { message_id, .. } => message_id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            GenerationOutcome::Completed { text, .. } => text,
            GenerationOutcome::Cancelled { partial, .. } => partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_str() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_derive_session_name_takes_six_words() {
        assert_eq!(
            derive_session_name("Hello there, how are you today my friend"),
            "Hello there, how are you today"
        );
        assert_eq!(derive_session_name("  short   one "), "short one");
        assert_eq!(derive_session_name(""), "");
    }

    #[test]
    fn test_session_metadata_drops_messages() {
        let mut session = Session::new("llama3");
        session.messages.push(Message::user(&session.id, "hi"));
        let meta = session.metadata();
        assert!(meta.messages.is_empty());
        assert_eq!(meta.id, session.id);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ContextWindowConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_trim_at_max() {
        let config = ContextWindowConfig {
            trim_threshold: 8192,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("max_tokens"));
    }

    #[test]
    fn test_config_rejects_zero_context_messages() {
        let config = ContextWindowConfig {
            context_messages: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generation_state_is_active() {
        assert!(GenerationState::Streaming.is_active());
        assert!(!GenerationState::Cancelled.is_active());
    }
}
