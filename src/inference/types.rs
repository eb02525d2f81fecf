//! Wire types for the generation backend (Ollama-style `/generate` and `/tags`).

use serde::{Deserialize, Serialize};

// ─── Generation ─────────────────────────────────────────────────────────────

/// Body of `POST /generate`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
}

impl GenerateRequest {
    /// A streaming request for `model` with the given prompt.
    pub fn streaming(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            stream: true,
        }
    }
}

/// One newline-delimited JSON object from the streamed `/generate` body.
///
/// The final object has `done: true` and may carry an empty `response`.
/// Backends report late failures as `{"error": "..."}` on their own line.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GenerateResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Decoded unit of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A non-empty text fragment, in arrival order.
    Fragment(String),
    /// The backend flagged `done: true`. No further events follow.
    Done,
}

// ─── Model listing ──────────────────────────────────────────────────────────

/// Raw `GET /tags` response shape.
#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// A model installed on the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub modified_at: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

/// Optional model metadata reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDetails {
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
    pub context_length: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_serializes_stream_flag() {
        let req = GenerateRequest::streaming("llama3", "hi");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "llama3");
        assert_eq!(json["prompt"], "hi");
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_generate_response_final_object_without_response() {
        let line = r#"{"model":"llama3","done":true,"total_duration":123}"#;
        let resp: GenerateResponse = serde_json::from_str(line).unwrap();
        assert!(resp.done);
        assert!(resp.response.is_empty());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_tags_response_parses_details() {
        let body = r#"{"models":[{"name":"deepseek-r1:14b","size":9000000000,
            "digest":"abc","modified_at":"2025-01-01T00:00:00Z",
            "details":{"parameter_size":"14B","quantization_level":"Q4_K_M"}}]}"#;
        let tags: TagsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(tags.models.len(), 1);
        let details = tags.models[0].details.as_ref().unwrap();
        assert_eq!(details.parameter_size.as_deref(), Some("14B"));
        assert!(details.context_length.is_none());
    }
}
