//! Session lifecycle and persistence coordination.
//!
//! `SessionManager` owns every session through its `ContextWindow` and never
//! touches `messages` / `total_tokens` itself. Each mutating operation applies
//! the change in memory first, then writes through the `SessionStore`. A
//! failed write is surfaced to the caller but the in-memory change stays.

use std::collections::HashMap;
use std::sync::Arc;

use super::context::ContextWindow;
use super::errors::ChatError;
use super::store::SessionStore;
use super::tokens::TokenCounter;
use super::types::{ContextWindowConfig, Message, Session};

// ─── SessionManager ─────────────────────────────────────────────────────────

/// Owns the set of sessions and the notion of a current session.
pub struct SessionManager {
    sessions: HashMap<String, ContextWindow>,
    current_session_id: Option<String>,
    store: Arc<dyn SessionStore>,
    counter: Arc<dyn TokenCounter>,
    config: ContextWindowConfig,
    /// Model for sessions created without an explicit one.
    default_model: String,
}

impl SessionManager {
    /// Load all persisted sessions and rebuild one context window per session.
    ///
    /// The most recently updated session becomes current; with no sessions,
    /// current stays `None` until one is created.
    pub async fn load(
        store: Arc<dyn SessionStore>,
        counter: Arc<dyn TokenCounter>,
        config: ContextWindowConfig,
        default_model: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let mut sessions = HashMap::new();
        let mut current: Option<(String, chrono::DateTime<chrono::Utc>)> = None;

        for session in store.get_all_sessions().await? {
            let messages = store.get_session_messages(&session.id).await?;
            let persisted = messages.len();
            let (window, evicted) =
                ContextWindow::restore(session, messages, config.clone(), counter.clone());

            tracing::debug!(
                session_id = %window.id(),
                persisted,
                evicted,
                total_tokens = window.total_tokens(),
                "session restored"
            );

            let updated_at = window.session().updated_at;
            if current.as_ref().map_or(true, |(_, ts)| updated_at > *ts) {
                current = Some((window.id().to_string(), updated_at));
            }
            sessions.insert(window.id().to_string(), window);
        }

        tracing::info!(
            sessions = sessions.len(),
            current = ?current.as_ref().map(|(id, _)| id.as_str()),
            "session manager loaded"
        );

        Ok(Self {
            sessions,
            current_session_id: current.map(|(id, _)| id),
            store,
            counter,
            config,
            default_model: default_model.into(),
        })
    }

    // ─── Read-only state ────────────────────────────────────────────────

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_session_id
            .as_deref()
            .and_then(|id| self.session(id))
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id).map(|w| w.session())
    }

    pub fn window(&self, session_id: &str) -> Option<&ContextWindow> {
        self.sessions.get(session_id)
    }

    /// All sessions, most recently updated first.
    pub fn sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().map(|w| w.session()).collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Conversation history to send for the current session.
    pub fn relevant_context(&self) -> Result<Vec<&Message>, ChatError> {
        let id = self
            .current_session_id
            .as_deref()
            .ok_or(ChatError::NoActiveSession)?;
        self.relevant_context_for(id)
    }

    pub fn relevant_context_for(&self, session_id: &str) -> Result<Vec<&Message>, ChatError> {
        Ok(self.window_ref(session_id)?.relevant_context())
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    // ─── Session lifecycle ──────────────────────────────────────────────

    /// Create, persist, and select a new empty session.
    pub async fn create_session(&mut self, model: Option<&str>) -> Result<Session, ChatError> {
        let session = Session::new(model.unwrap_or(&self.default_model));
        self.store.create_session(&session).await?;

        let window = ContextWindow::new(session.clone(), self.config.clone(), self.counter.clone());
        self.sessions.insert(session.id.clone(), window);
        self.current_session_id = Some(session.id.clone());

        tracing::info!(session_id = %session.id, model = %session.model, "session created");
        Ok(session)
    }

    /// Make `session_id` current. Unknown ids are a no-op returning `None`.
    pub fn switch_session(&mut self, session_id: &str) -> Option<&Session> {
        if !self.sessions.contains_key(session_id) {
            tracing::debug!(session_id = %session_id, "switch to unknown session ignored");
            return None;
        }
        self.current_session_id = Some(session_id.to_string());
        tracing::info!(session_id = %session_id, "session switched");
        self.session(session_id)
    }

    /// Delete a session's persisted messages and record, then drop it locally.
    ///
    /// If it was current, the most recently updated remaining session (or
    /// none) becomes current.
    pub async fn delete_session(&mut self, session_id: &str) -> Result<(), ChatError> {
        if !self.sessions.contains_key(session_id) {
            return Err(ChatError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        self.store.delete_session(session_id).await?;
        self.sessions.remove(session_id);

        if self.current_session_id.as_deref() == Some(session_id) {
            self.current_session_id = self.sessions().first().map(|s| s.id.clone());
        }

        tracing::info!(
            session_id = %session_id,
            current = ?self.current_session_id,
            "session deleted"
        );
        Ok(())
    }

    /// Persist a new display name for a session.
    pub async fn rename_session(&mut self, session_id: &str, name: &str) -> Result<(), ChatError> {
        self.window_mut(session_id)?.rename(name);
        self.persist_session(session_id).await
    }

    /// Persist a new backend model for a session.
    pub async fn set_session_model(
        &mut self,
        session_id: &str,
        model: &str,
    ) -> Result<(), ChatError> {
        self.window_mut(session_id)?.set_model(model);
        self.persist_session(session_id).await
    }

    /// Re-persist a session's mutable metadata from a caller-edited copy.
    ///
    /// Only `name` and `model` are taken from `session`; messages and the
    /// token total stay owned by the context window.
    pub async fn update_session(&mut self, session: &Session) -> Result<(), ChatError> {
        let window = self.window_mut(&session.id)?;
        if window.session().name != session.name {
            window.rename(session.name.clone());
        }
        if window.session().model != session.model {
            window.set_model(session.model.clone());
        }
        self.persist_session(&session.id).await
    }

    // ─── Messages ───────────────────────────────────────────────────────

    /// Append a message to the current session.
    pub async fn add_message(&mut self, message: Message) -> Result<Message, ChatError> {
        let id = self
            .current_session_id
            .clone()
            .ok_or(ChatError::NoActiveSession)?;
        self.add_message_to(&id, message).await
    }

    /// Append a message to a specific session and persist it with the
    /// updated session metadata. Returns the stored copy (token count set).
    pub async fn add_message_to(
        &mut self,
        session_id: &str,
        message: Message,
    ) -> Result<Message, ChatError> {
        let window = self.window_mut(session_id)?;
        let message_id = message.id.clone();
        let evicted = window.add_message(message);
        let stored = window
            .message(&message_id)
            .cloned()
            .ok_or(ChatError::MessageNotFound { message_id })?;

        tracing::debug!(
            session_id = %session_id,
            message_id = %stored.id,
            role = %stored.role,
            tokens = stored.tokens(),
            evicted = evicted.len(),
            "message added"
        );

        self.store.add_message(&stored).await?;
        self.persist_session(session_id).await?;
        Ok(stored)
    }

    /// Append a streamed fragment to a message and write it through.
    ///
    /// This is the per-fragment path: a failed write is logged and the call
    /// still succeeds, since the next write repeats the full content. Only
    /// in-memory failures (unknown session or message) are returned.
    pub async fn append_fragment(
        &mut self,
        session_id: &str,
        message_id: &str,
        fragment: &str,
    ) -> Result<Message, ChatError> {
        let window = self.window_mut(session_id)?;
        window.append_to_message(message_id, fragment)?;
        let updated = window
            .message(message_id)
            .cloned()
            .ok_or_else(|| ChatError::MessageNotFound {
                message_id: message_id.to_string(),
            })?;

        if let Err(e) = self.store.update_message(&updated).await {
            tracing::warn!(
                session_id = %session_id,
                message_id = %message_id,
                error = %e,
                "fragment write failed, will retry at stream end"
            );
        }
        Ok(updated)
    }

    /// Apply a caller-edited message's content and re-persist it.
    pub async fn update_message(&mut self, message: &Message) -> Result<Message, ChatError> {
        let window = self.window_mut(&message.session_id)?;
        let current = window
            .message(&message.id)
            .ok_or_else(|| ChatError::MessageNotFound {
                message_id: message.id.clone(),
            })?;
        if current.content != message.content {
            window.update_content(&message.id, message.content.clone())?;
        }
        self.flush_message(&message.session_id, &message.id).await
    }

    /// Write the full message and session metadata again (at-least-once).
    pub async fn flush_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Message, ChatError> {
        let window = self.window_ref(session_id)?;
        let message = window
            .message(message_id)
            .cloned()
            .ok_or_else(|| ChatError::MessageNotFound {
                message_id: message_id.to_string(),
            })?;
        self.store.add_message(&message).await?;
        self.persist_session(session_id).await?;
        Ok(message)
    }

    /// Remove a message from the window and the store.
    pub async fn remove_message(
        &mut self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Message, ChatError> {
        let removed = self.window_mut(session_id)?.remove_message(message_id)?;
        self.store.delete_message(message_id).await?;
        self.persist_session(session_id).await?;
        tracing::debug!(session_id = %session_id, message_id = %message_id, "message removed");
        Ok(removed)
    }

    // ─── Internal ───────────────────────────────────────────────────────

    async fn persist_session(&self, session_id: &str) -> Result<(), ChatError> {
        let metadata = self.window_ref(session_id)?.session().metadata();
        self.store.update_session(&metadata).await
    }

    fn window_ref(&self, session_id: &str) -> Result<&ContextWindow, ChatError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| ChatError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    fn window_mut(&mut self, session_id: &str) -> Result<&mut ContextWindow, ChatError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| ChatError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
