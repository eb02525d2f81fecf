//! Durable persistence interface for sessions and messages.
//!
//! The core assumes no transactional guarantees: writes are issued after the
//! in-memory mutation and may be repeated (at-least-once). Implementations
//! must therefore treat `add_message` for an existing id as an overwrite.

use async_trait::async_trait;

use super::errors::ChatError;
use super::types::{Message, Session};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session's metadata.
    async fn create_session(&self, session: &Session) -> Result<(), ChatError>;

    /// Re-persist mutable metadata (name, model, token total, `updated_at`).
    async fn update_session(&self, session: &Session) -> Result<(), ChatError>;

    /// Delete the session's messages, then the session record.
    async fn delete_session(&self, session_id: &str) -> Result<(), ChatError>;

    /// All persisted sessions, metadata only (`messages` left empty).
    async fn get_all_sessions(&self) -> Result<Vec<Session>, ChatError>;

    async fn add_message(&self, message: &Message) -> Result<(), ChatError>;

    /// Re-persist a message's content and token count.
    async fn update_message(&self, message: &Message) -> Result<(), ChatError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), ChatError>;

    /// A session's messages in conversation order.
    async fn get_session_messages(&self, session_id: &str) -> Result<Vec<Message>, ChatError>;
}
