//! Newline-delimited JSON stream decoder for `/generate` responses.
//!
//! Reads a response body as a byte stream, splits on `\n` boundaries, parses
//! each complete line as a `GenerateResponse`, and yields text fragments in
//! arrival order. Chunks are not aligned to JSON objects, so an incomplete
//! trailing line is held over until the next chunk arrives.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::errors::InferenceError;
use super::types::{GenerateResponse, StreamEvent};
use crate::chat_core::tokens::truncate_utf8;

/// Boxed stream of decoded generation events.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, InferenceError>> + Send>>;

// ─── Line decoder ───────────────────────────────────────────────────────────

/// Incremental NDJSON decoder.
///
/// Buffers raw bytes rather than text so that a multi-byte UTF-8 character
/// split across two chunks decodes exactly as it would from one read.
/// Decoding halts at the `done` object or at a backend `error` object;
/// fragments decoded before the error are still returned.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    done: bool,
    error: Option<InferenceError>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `done: true` object has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn halted(&self) -> bool {
        self.done || self.error.is_some()
    }

    /// Take the error reported by the backend mid-stream, if any.
    pub fn take_error(&mut self) -> Option<InferenceError> {
        self.error.take()
    }

    /// Feed a chunk of body bytes and return the events of every line it completes.
    ///
    /// Malformed lines are logged and skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.halted() {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while !self.halted() {
            let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.decode_line(&line[..newline], &mut events);
        }

        if self.halted() {
            self.buffer.clear();
        }
        events
    }

    /// Flush a final line that arrived without a trailing newline.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.halted() && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut events);
        }
        events
    }

    fn decode_line(&mut self, line: &[u8], events: &mut Vec<StreamEvent>) {
        let text = match std::str::from_utf8(line) {
            Ok(t) => t.trim(),
            Err(e) => {
                tracing::warn!(error = %e, len = line.len(), "skipping non-UTF-8 stream line");
                return;
            }
        };
        if text.is_empty() {
            return;
        }

        let object: GenerateResponse = match serde_json::from_str(text) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    line = %truncate_utf8(text, 120),
                    "skipping malformed stream line"
                );
                return;
            }
        };

        if let Some(reason) = object.error {
            self.error = Some(InferenceError::StreamError { reason });
            return;
        }
        if !object.response.is_empty() {
            events.push(StreamEvent::Fragment(object.response));
        }
        if object.done {
            self.done = true;
            events.push(StreamEvent::Done);
        }
    }
}

// ─── Cancellable stream ─────────────────────────────────────────────────────

struct StreamState<S> {
    body: Pin<Box<S>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<StreamEvent>,
    deferred_error: Option<InferenceError>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    finished: bool,
}

/// Outcome of one guarded body read.
enum Read<B, E> {
    Cancelled,
    TimedOut,
    Chunk(B),
    Failed(E),
    Eof,
}

/// Decode a streamed NDJSON body into `StreamEvent`s.
///
/// The token is checked before every event is handed out and raced against
/// every body read, so a stop request takes effect within one chunk. Waiting
/// longer than `idle_timeout` for the next chunk yields `Timeout`. The stream
/// ends after `Done`, after end-of-body, or after the first error.
pub fn decode_ndjson_stream<S, B, E>(
    body: S,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = StreamState {
        body: Box::pin(body),
        decoder: NdjsonDecoder::new(),
        pending: VecDeque::new(),
        deferred_error: None,
        cancel,
        idle_timeout,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() && !(state.finished && state.pending.is_empty()) {
                state.pending.clear();
                state.finished = true;
                return Some((Err(InferenceError::Cancelled), state));
            }
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if let Some(err) = state.deferred_error.take() {
                return Some((Err(err), state));
            }
            if state.finished {
                return None;
            }

            let read = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => Read::Cancelled,
                next = tokio::time::timeout(state.idle_timeout, state.body.next()) => match next {
                    Err(_) => Read::TimedOut,
                    Ok(Some(Ok(bytes))) => Read::Chunk(bytes),
                    Ok(Some(Err(e))) => Read::Failed(e),
                    Ok(None) => Read::Eof,
                },
            };

            let events = match read {
                Read::Cancelled => continue,
                Read::TimedOut => {
                    state.finished = true;
                    let duration_ms = state.idle_timeout.as_millis() as u64;
                    return Some((Err(InferenceError::Timeout { duration_ms }), state));
                }
                Read::Failed(e) => {
                    state.finished = true;
                    let err = InferenceError::StreamError {
                        reason: format!("stream read error: {e}"),
                    };
                    return Some((Err(err), state));
                }
                Read::Chunk(bytes) => state.decoder.push(bytes.as_ref()),
                Read::Eof => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };

            state.pending.extend(events);
            if let Some(err) = state.decoder.take_error() {
                state.deferred_error = Some(err);
                state.finished = true;
            }
            if state.decoder.is_done() {
                state.finished = true;
            }
        }
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
