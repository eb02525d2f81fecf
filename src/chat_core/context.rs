//! Context window management for one session.
//!
//! `ContextWindow` exclusively owns a session's `messages` / `total_tokens`
//! pair. Every mutation of either goes through a method here, which applies
//! the token delta in the same call, so `total_tokens` is always the sum of
//! the per-message counts.
//!
//! Eviction is oldest-first and never goes below the most recent two
//! messages. It only affects the in-memory window; durable history is kept.

use std::sync::Arc;

use chrono::Utc;

use super::errors::ChatError;
use super::tokens::TokenCounter;
use super::types::{ContextWindowConfig, Message, Session};

/// Fewest messages trimming will leave (the most recent exchange).
const MIN_RETAINED_MESSAGES: usize = 2;

// ─── Context selection ──────────────────────────────────────────────────────

/// Chooses which messages are sent to the backend as conversation history.
///
/// The default keeps the most recent N messages; a semantic-retrieval policy
/// can be plugged in behind the same contract.
pub trait ContextSelector: Send + Sync {
    fn select<'a>(&self, messages: &'a [Message]) -> Vec<&'a Message>;
}

/// The most recent `count` messages, in conversation order.
#[derive(Debug, Clone, Copy)]
pub struct RecentMessages {
    pub count: usize,
}

impl ContextSelector for RecentMessages {
    fn select<'a>(&self, messages: &'a [Message]) -> Vec<&'a Message> {
        let start = messages.len().saturating_sub(self.count);
        messages[start..].iter().collect()
    }
}

// ─── ContextWindow ──────────────────────────────────────────────────────────

/// Token-budgeted message history for one session.
pub struct ContextWindow {
    session: Session,
    config: ContextWindowConfig,
    counter: Arc<dyn TokenCounter>,
    selector: Arc<dyn ContextSelector>,
}

impl ContextWindow {
    /// Wrap a new, empty session.
    ///
    /// Any messages already on `session` are discarded; use [`restore`](Self::restore)
    /// to rebuild a window from persisted history.
    pub fn new(
        mut session: Session,
        config: ContextWindowConfig,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        session.messages.clear();
        session.total_tokens = 0;
        let selector = Arc::new(RecentMessages {
            count: config.context_messages,
        });
        Self {
            session,
            config,
            counter,
            selector,
        }
    }

    /// Rebuild a window from persisted session metadata and its messages.
    ///
    /// Token counts are recomputed with this window's counter and the total
    /// is rebuilt from them, then the usual trimming applies. Returns the
    /// window and how many messages were evicted.
    pub fn restore(
        session: Session,
        messages: Vec<Message>,
        config: ContextWindowConfig,
        counter: Arc<dyn TokenCounter>,
    ) -> (Self, usize) {
        let updated_at = session.updated_at;
        let mut window = Self::new(session, config, counter);
        for mut message in messages {
            let tokens = window.counter.count(&message.content);
            message.token_count = Some(tokens);
            window.session.total_tokens += tokens;
            window.session.messages.push(message);
        }
        let evicted = window.trim_history().len();
        // Replaying history is not a user mutation.
        window.session.updated_at = updated_at;
        (window, evicted)
    }

    /// Replace the context selection policy.
    pub fn with_selector(mut self, selector: Arc<dyn ContextSelector>) -> Self {
        self.selector = selector;
        self
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    pub fn total_tokens(&self) -> u32 {
        self.session.total_tokens
    }

    pub fn config(&self) -> &ContextWindowConfig {
        &self.config
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.session.messages.iter().find(|m| m.id == message_id)
    }

    /// Count `text` with the same scheme the window uses for its own accounting.
    pub fn count_tokens(&self, text: &str) -> u32 {
        self.counter.count(text)
    }

    /// Whether the total has reached the reserved compaction threshold.
    pub fn above_summarization_threshold(&self) -> bool {
        self.session.total_tokens >= self.config.summarization_threshold
    }

    /// Messages to send to the backend as conversation history.
    pub fn relevant_context(&self) -> Vec<&Message> {
        self.selector.select(&self.session.messages)
    }

    // ─── Mutations ──────────────────────────────────────────────────────

    /// Append a message, counting its tokens if not yet counted.
    ///
    /// Trims when the new total reaches the trim threshold. Returns the
    /// evicted messages, oldest first.
    pub fn add_message(&mut self, mut message: Message) -> Vec<Message> {
        let tokens = match message.token_count {
            Some(tokens) => tokens,
            None => self.counter.count(&message.content),
        };
        message.token_count = Some(tokens);
        message.session_id.clone_from(&self.session.id);

        self.session.messages.push(message);
        self.session.total_tokens += tokens;
        self.touch();

        if self.session.total_tokens >= self.config.trim_threshold {
            self.trim_history()
        } else {
            Vec::new()
        }
    }

    /// Evict oldest messages while over the trim threshold, keeping at least two.
    ///
    /// Each evicted message's count is subtracted exactly once.
    pub fn trim_history(&mut self) -> Vec<Message> {
        let mut evicted = Vec::new();
        while self.session.total_tokens > self.config.trim_threshold
            && self.session.messages.len() > MIN_RETAINED_MESSAGES
        {
            let oldest = self.session.messages.remove(0);
            self.session.total_tokens -= oldest.tokens();
            evicted.push(oldest);
        }

        if !evicted.is_empty() {
            self.touch();
            tracing::info!(
                session_id = %self.session.id,
                evicted = evicted.len(),
                remaining = self.session.messages.len(),
                total_tokens = self.session.total_tokens,
                threshold = self.config.trim_threshold,
                "trimmed context window"
            );
        }
        evicted
    }

    /// Append a streamed fragment to a message in place.
    ///
    /// The message is recounted and the total adjusted by the delta only.
    pub fn append_to_message(
        &mut self,
        message_id: &str,
        fragment: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let index = self.index_of(message_id)?;
        let mut content = std::mem::take(&mut self.session.messages[index].content);
        content.push_str(fragment);
        Ok(self.apply_content(index, content))
    }

    /// Replace a message's content, recounting and adjusting the total.
    pub fn update_content(
        &mut self,
        message_id: &str,
        content: impl Into<String>,
    ) -> Result<Vec<Message>, ChatError> {
        let index = self.index_of(message_id)?;
        Ok(self.apply_content(index, content.into()))
    }

    /// Remove a message, subtracting its count.
    pub fn remove_message(&mut self, message_id: &str) -> Result<Message, ChatError> {
        let index = self.index_of(message_id)?;
        let removed = self.session.messages.remove(index);
        self.session.total_tokens -= removed.tokens();
        self.touch();
        Ok(removed)
    }

    /// Set the session's display name.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.session.name = name.into();
        self.touch();
    }

    /// Set the backend model used for this session.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.session.model = model.into();
        self.touch();
    }

    fn apply_content(&mut self, index: usize, content: String) -> Vec<Message> {
        let new_tokens = self.counter.count(&content);
        let message = &mut self.session.messages[index];
        let old_tokens = message.tokens();
        message.content = content;
        message.token_count = Some(new_tokens);

        self.session.total_tokens = self.session.total_tokens - old_tokens + new_tokens;
        self.touch();

        if self.session.total_tokens >= self.config.trim_threshold {
            self.trim_history()
        } else {
            Vec::new()
        }
    }

    fn index_of(&self, message_id: &str) -> Result<usize, ChatError> {
        self.session
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| ChatError::MessageNotFound {
                message_id: message_id.to_string(),
            })
    }

    fn touch(&mut self) {
        self.session.updated_at = Utc::now();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
