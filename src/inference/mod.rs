//! Inference client for a local Ollama-compatible generation backend.
//!
//! This module handles all communication with the model endpoint:
//! - Streaming `/generate` requests with cooperative cancellation
//! - Incremental NDJSON decoding into text fragments
//! - Model listing and backend liveness checks via `/tags`
//!
//! The chat core depends only on the `GenerationBackend` trait, so the HTTP
//! client can be swapped for a scripted backend in tests.

pub mod client;
pub mod errors;
pub mod streaming;
pub mod types;

pub use client::{GenerationBackend, InferenceClient};
pub use errors::InferenceError;
pub use streaming::FragmentStream;
pub use types::{GenerateRequest, ModelInfo, StreamEvent};
