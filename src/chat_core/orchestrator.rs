//! Generation orchestrator: the send / stop flow.
//!
//! One send moves a session through
//! `Idle → Sending → Streaming → {Completed | Cancelled | Failed}`.
//!
//! The `SessionManager` lock is held per operation or per fragment, never
//! across a network read, so `stop_generation` can run while a reply streams.
//! Each in-flight send owns exactly one cancellation token, registered under
//! its session id and removed by a drop guard on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::errors::ChatError;
use super::manager::SessionManager;
use super::types::{derive_session_name, GenerationOutcome, GenerationState, Message, Session};
use crate::inference::client::GenerationBackend;
use crate::inference::types::{GenerateRequest, StreamEvent};

// ─── Per-session generation slots ───────────────────────────────────────────

#[derive(Debug, Default)]
struct GenerationSlot {
    state: Option<GenerationState>,
    cancel: Option<CancellationToken>,
    /// Start order of the latest send, for `stop_generation`.
    started: u64,
}

/// Removes the session's cancellation token when the send ends.
struct ActiveGeneration<'a> {
    slots: &'a Mutex<HashMap<String, GenerationSlot>>,
    session_id: String,
}

impl Drop for ActiveGeneration<'_> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(&self.session_id) {
            slot.cancel = None;
            // The send future was dropped mid-flight.
            if slot.state.is_some_and(|s| s.is_active()) {
                slot.state = Some(GenerationState::Cancelled);
            }
        }
    }
}

/// How a stream ended, before final persistence.
enum StreamEnd {
    Completed,
    Cancelled,
    Failed(ChatError),
}

// ─── ChatService ────────────────────────────────────────────────────────────

/// Entry point for the UI layer: send, stop, and session lifecycle.
pub struct ChatService {
    manager: tokio::sync::Mutex<SessionManager>,
    backend: Arc<dyn GenerationBackend>,
    slots: Mutex<HashMap<String, GenerationSlot>>,
    next_start: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ChatService {
    pub fn new(manager: SessionManager, backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            manager: tokio::sync::Mutex::new(manager),
            backend,
            slots: Mutex::new(HashMap::new()),
            next_start: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Lock the session manager for reading state.
    ///
    /// Do not hold the guard across an await on this service.
    pub async fn manager(&self) -> tokio::sync::MutexGuard<'_, SessionManager> {
        self.manager.lock().await
    }

    /// State of the latest send for a session (`Idle` if none yet).
    pub fn generation_state(&self, session_id: &str) -> GenerationState {
        self.slots()
            .get(session_id)
            .and_then(|slot| slot.state)
            .unwrap_or(GenerationState::Idle)
    }

    /// The user-visible message from the most recent failed send.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ─── Session lifecycle ──────────────────────────────────────────────

    pub async fn create_session(&self, model: Option<&str>) -> Result<Session, ChatError> {
        self.manager.lock().await.create_session(model).await
    }

    pub async fn switch_session(&self, session_id: &str) -> Option<Session> {
        self.manager
            .lock()
            .await
            .switch_session(session_id)
            .cloned()
    }

    /// Delete a session, stopping its generation first if one is running.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ChatError> {
        self.cancel_session(session_id);
        self.manager.lock().await.delete_session(session_id).await?;
        self.slots().remove(session_id);
        Ok(())
    }

    // ─── Generation ─────────────────────────────────────────────────────

    /// Send `text` to the current session and stream the reply into it.
    pub async fn send_message(
        &self,
        text: &str,
        model: Option<&str>,
    ) -> Result<GenerationOutcome, ChatError> {
        self.send_message_with(text, model, |_| {}).await
    }

    /// Like [`send_message`](Self::send_message), also handing every fragment
    /// to `on_fragment` after it has been applied to the session.
    ///
    /// Cancellation is reported as `Ok(GenerationOutcome::Cancelled)`; only
    /// real failures are errors, and their user-facing text is kept in
    /// [`last_error`](Self::last_error).
    pub async fn send_message_with<F>(
        &self,
        text: &str,
        model: Option<&str>,
        mut on_fragment: F,
    ) -> Result<GenerationOutcome, ChatError>
    where
        F: FnMut(&str) + Send,
    {
        // Idle → Sending
        let mut manager = self.manager.lock().await;
        let Some(session_id) = manager.current_session_id().map(str::to_string) else {
            let err = ChatError::NoActiveSession;
            self.record_error(&err);
            return Err(err);
        };
        let (cancel, _active) = match self.begin(&session_id) {
            Ok(reserved) => reserved,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };
        self.clear_error();

        let prepared = self.prepare(&mut manager, &session_id, text, model).await;
        drop(manager);
        let (request, reply_id) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.set_state(&session_id, GenerationState::Failed);
                self.record_error(&e);
                return Err(e);
            }
        };

        // Sending → Streaming
        self.set_state(&session_id, GenerationState::Streaming);
        tracing::info!(
            session_id = %session_id,
            message_id = %reply_id,
            model = %request.model,
            "generation started"
        );

        let mut reply = String::new();
        let end = self
            .stream_reply(request, &cancel, &session_id, &reply_id, &mut reply, &mut on_fragment)
            .await;

        self.finish(&session_id, &reply_id, reply, end).await
    }

    /// Stop a running send. Returns whether one was running.
    ///
    /// Prefers the current session's send. If the user has switched away
    /// from a streaming session, the most recently started send is stopped.
    pub async fn stop_generation(&self) -> bool {
        let current = self
            .manager
            .lock()
            .await
            .current_session_id()
            .map(str::to_string);
        if current.is_some_and(|id| self.cancel_session(&id)) {
            return true;
        }

        let latest = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.cancel.is_some())
            .max_by_key(|(_, slot)| slot.started)
            .map(|(id, _)| id.clone());
        match latest {
            Some(id) => self.cancel_session(&id),
            None => false,
        }
    }

    /// Cancel a session's in-flight send, if any.
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let slots = self.slots();
        match slots.get(session_id).and_then(|s| s.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                tracing::info!(session_id = %session_id, "generation stop requested");
                true
            }
            None => false,
        }
    }

    // ─── Send phases ────────────────────────────────────────────────────

    /// Reserve the session's slot and allocate its cancellation token.
    fn begin(
        &self,
        session_id: &str,
    ) -> Result<(CancellationToken, ActiveGeneration<'_>), ChatError> {
        let mut slots = self.slots();
        let slot = slots.entry(session_id.to_string()).or_default();
        if slot.cancel.is_some() {
            return Err(ChatError::GenerationInProgress {
                session_id: session_id.to_string(),
            });
        }

        let token = CancellationToken::new();
        slot.cancel = Some(token.clone());
        slot.state = Some(GenerationState::Sending);
        slot.started = self.next_start.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGeneration {
            slots: &self.slots,
            session_id: session_id.to_string(),
        };
        Ok((token, guard))
    }

    /// Name the session on first send, append the user message, build the
    /// prompt, then append the empty assistant placeholder.
    async fn prepare(
        &self,
        manager: &mut SessionManager,
        session_id: &str,
        text: &str,
        model: Option<&str>,
    ) -> Result<(GenerateRequest, String), ChatError> {
        let session = manager
            .session(session_id)
            .ok_or_else(|| ChatError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let first_message = session.messages.is_empty() && session.name.is_empty();
        let current_model = session.model.clone();

        if let Some(model) = model.filter(|m| *m != current_model) {
            manager.set_session_model(session_id, model).await?;
        }
        if first_message {
            let name = derive_session_name(text);
            manager.rename_session(session_id, &name).await?;
            tracing::info!(session_id = %session_id, name = %name, "session named");
        }

        manager
            .add_message_to(session_id, Message::user(session_id, text))
            .await?;
        let prompt = render_prompt(&manager.relevant_context_for(session_id)?);
        let model = manager
            .session(session_id)
            .map(|s| s.model.clone())
            .unwrap_or(current_model);

        let placeholder = Message::assistant_placeholder(session_id);
        let placeholder_id = placeholder.id.clone();
        if let Err(e) = manager.add_message_to(session_id, placeholder).await {
            discard_placeholder(manager, session_id, &placeholder_id).await;
            return Err(e);
        }

        Ok((GenerateRequest::streaming(model, prompt), placeholder_id))
    }

    /// Consume the backend stream, applying each fragment to the reply.
    async fn stream_reply<F>(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
        session_id: &str,
        reply_id: &str,
        reply: &mut String,
        on_fragment: &mut F,
    ) -> StreamEnd
    where
        F: FnMut(&str) + Send,
    {
        let mut stream = match self.backend.stream_generate(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) if e.is_cancelled() => return StreamEnd::Cancelled,
            Err(e) => return StreamEnd::Failed(e.into()),
        };

        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::Fragment(fragment)) => {
                    let applied = self
                        .manager
                        .lock()
                        .await
                        .append_fragment(session_id, reply_id, &fragment)
                        .await;
                    if let Err(e) = applied {
                        return StreamEnd::Failed(e);
                    }
                    reply.push_str(&fragment);
                    on_fragment(&fragment);
                }
                Ok(StreamEvent::Done) => return StreamEnd::Completed,
                Err(e) if e.is_cancelled() => return StreamEnd::Cancelled,
                Err(e) => return StreamEnd::Failed(e.into()),
            }
        }
        StreamEnd::Completed
    }

    /// Final persistence and state transition for one send.
    async fn finish(
        &self,
        session_id: &str,
        reply_id: &str,
        reply: String,
        end: StreamEnd,
    ) -> Result<GenerationOutcome, ChatError> {
        let mut manager = self.manager.lock().await;
        if manager.session(session_id).is_none() {
            drop(manager);
            tracing::info!(session_id = %session_id, "session deleted during generation");
            return match end {
                StreamEnd::Failed(e) => Err(e),
                _ => Err(ChatError::SessionNotFound {
                    session_id: session_id.to_string(),
                }),
            };
        }
        match end {
            StreamEnd::Completed => {
                let flushed = manager.flush_message(session_id, reply_id).await;
                drop(manager);
                if let Err(e) = flushed {
                    self.set_state(session_id, GenerationState::Failed);
                    self.record_error(&e);
                    return Err(e);
                }
                self.set_state(session_id, GenerationState::Completed);
                tracing::info!(
                    session_id = %session_id,
                    message_id = %reply_id,
                    chars = reply.len(),
                    "generation completed"
                );
                Ok(GenerationOutcome::Completed {
                    message_id: reply_id.to_string(),
                    text: reply,
                })
            }
            StreamEnd::Cancelled => {
                // Partial content is kept as-is.
                let flushed = manager.flush_message(session_id, reply_id).await;
                drop(manager);
                self.set_state(session_id, GenerationState::Cancelled);
                if let Err(e) = flushed {
                    self.record_error(&e);
                    return Err(e);
                }
                tracing::info!(
                    session_id = %session_id,
                    message_id = %reply_id,
                    chars = reply.len(),
                    "generation cancelled"
                );
                Ok(GenerationOutcome::Cancelled {
                    message_id: reply_id.to_string(),
                    partial: reply,
                })
            }
            StreamEnd::Failed(e) => {
                let cleanup = if reply.is_empty() {
                    manager.remove_message(session_id, reply_id).await.map(|_| ())
                } else {
                    manager.flush_message(session_id, reply_id).await.map(|_| ())
                };
                drop(manager);
                if let Err(cleanup_err) = cleanup {
                    tracing::warn!(
                        session_id = %session_id,
                        message_id = %reply_id,
                        error = %cleanup_err,
                        "cleanup after failed generation did not complete"
                    );
                }
                self.set_state(session_id, GenerationState::Failed);
                self.record_error(&e);
                tracing::error!(
                    session_id = %session_id,
                    message_id = %reply_id,
                    error = %e,
                    kept_partial = !reply.is_empty(),
                    "generation failed"
                );
                Err(e)
            }
        }
    }

    // ─── Internal ───────────────────────────────────────────────────────

    fn slots(&self) -> MutexGuard<'_, HashMap<String, GenerationSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, session_id: &str, state: GenerationState) {
        self.slots()
            .entry(session_id.to_string())
            .or_default()
            .state = Some(state);
    }

    fn record_error(&self, err: &ChatError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(err.user_message());
    }

    fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Drop an empty placeholder whose write failed, if it reached the window.
///
/// The window removal happens before the store delete, so in-memory state
/// is clean even when the store is still failing.
async fn discard_placeholder(manager: &mut SessionManager, session_id: &str, message_id: &str) {
    let in_window = manager
        .window(session_id)
        .is_some_and(|w| w.message(message_id).is_some());
    if !in_window {
        return;
    }
    if let Err(e) = manager.remove_message(session_id, message_id).await {
        tracing::warn!(
            session_id = %session_id,
            message_id = %message_id,
            error = %e,
            "failed to delete placeholder from store"
        );
    }
}

/// Render conversation history as the backend prompt.
fn render_prompt(context: &[&Message]) -> String {
    let mut prompt = String::new();
    for message in context {
        prompt.push_str(message.role.prompt_label());
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

// ─── Tests ──────────────────────────────────────────────────────────────────
