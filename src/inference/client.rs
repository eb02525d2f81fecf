//! Streaming client for the local generation backend.
//!
//! Sends `POST {base_url}/generate` with `stream: true` and decodes the
//! newline-delimited JSON body as it arrives. Cancellation is cooperative via
//! a `CancellationToken` that is observed while waiting for the response
//! headers and between every body read.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use super::errors::InferenceError;
use super::streaming::{decode_ndjson_stream, FragmentStream};
use super::types::{GenerateRequest, ModelInfo, StreamEvent, TagsResponse};
use crate::config::BackendConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the lightweight `/tags` status and listing calls.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

// ─── GenerationBackend ───────────────────────────────────────────────────────

/// Anything that can turn a generation request into a fragment stream.
///
/// `InferenceClient` is the production implementation; the orchestrator only
/// depends on this trait.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Open a streaming generation. The returned stream ends with `Done`, an
    /// error, or `InferenceError::Cancelled` once `cancel` fires.
    async fn stream_generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// HTTP client for an Ollama-compatible backend.
pub struct InferenceClient {
    http: HttpClient,
    base_url: String,
    default_model: String,
    /// Bounds the wait for response headers and each idle gap between chunks.
    timeout: Duration,
}

impl InferenceClient {
    /// Build a client from the backend configuration.
    ///
    /// Does NOT check connectivity — that happens on the first request.
    pub fn new(config: &BackendConfig) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_model: config.default_model.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Model used when a request does not name one.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    // ─── Generation ──────────────────────────────────────────────────────

    /// Generate a completion, handing every fragment to `on_fragment` in
    /// arrival order, and return the concatenated text.
    ///
    /// Returns `InferenceError::Cancelled` when `cancel` fires; fragments
    /// delivered before that point have already reached the sink.
    pub async fn generate<F>(
        &self,
        prompt: &str,
        model: Option<&str>,
        mut on_fragment: F,
        cancel: &CancellationToken,
    ) -> Result<String, InferenceError>
    where
        F: FnMut(&str),
    {
        let model = model.unwrap_or(&self.default_model);
        let request = GenerateRequest::streaming(model, prompt);
        let mut stream = self.open_stream(&request, cancel.clone()).await?;

        let mut full = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Fragment(fragment) => {
                    on_fragment(&fragment);
                    full.push_str(&fragment);
                }
                StreamEvent::Done => break,
            }
        }

        tracing::info!(model = %model, chars = full.len(), "generation complete");
        Ok(full)
    }

    /// Send the request and return the decoded body stream once headers arrive.
    async fn open_stream(
        &self,
        request: &GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, InferenceError> {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }

        let url = format!("{}/generate", self.base_url);
        tracing::info!(
            url = %url,
            model = %request.model,
            prompt_chars = request.prompt.len(),
            "=== GENERATE REQUEST ==="
        );

        let send = self.http.post(&url).json(request).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            result = tokio::time::timeout(self.timeout, send) => match result {
                Err(_) => return Err(self.timeout_error()),
                Ok(Err(e)) => return Err(self.transport_error(&url, e)),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::warn!(model = %request.model, "backend reports model not found");
            return Err(InferenceError::ModelNotFound {
                model: request.model.clone(),
            });
        }
        if !status.is_success() {
            // The error body is bounded like any other read.
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
                result = tokio::time::timeout(self.timeout, response.text()) => match result {
                    Err(_) => return Err(self.timeout_error()),
                    Ok(body) => body.unwrap_or_default(),
                },
            };
            tracing::warn!(status = status.as_u16(), body = %body, "generate request failed");
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        Ok(decode_ndjson_stream(
            response.bytes_stream(),
            cancel,
            self.timeout,
        ))
    }

    // ─── Model listing ───────────────────────────────────────────────────

    /// List the models installed on the backend (`GET {base_url}/tags`).
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = format!("{}/tags", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        let tags: TagsResponse = response.json().await.map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse model list: {e}"),
        })?;
        Ok(tags.models)
    }

    /// Check whether the backend answers at all.
    pub async fn is_responding(&self) -> bool {
        let url = format!("{}/tags", self.base_url);
        match self.http.get(&url).timeout(STATUS_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    // ─── Error mapping ───────────────────────────────────────────────────

    fn timeout_error(&self) -> InferenceError {
        InferenceError::Timeout {
            duration_ms: self.timeout.as_millis() as u64,
        }
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            self.timeout_error()
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for InferenceClient {
    async fn stream_generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, InferenceError> {
        self.open_stream(&request, cancel).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    const CHUNKED_OK: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n";

    fn chunk(data: &str) -> String {
        format!("{:x}\r\n{data}\r\n", data.len())
    }

    fn test_config(addr: SocketAddr, timeout_ms: u64) -> BackendConfig {
        BackendConfig {
            base_url: format!("http://{addr}/api/"),
            default_model: "test-model".to_string(),
            timeout_ms,
            connect_timeout_ms: 1_000,
        }
    }

    /// Read one HTTP request (headers plus `content-length` body).
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serve a single connection: write `parts` in order, then optionally hold
    /// the socket open. Returns the bound address and the captured request.
    async fn serve_once(
        parts: Vec<String>,
        hold_open: bool,
    ) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let _ = tx.send(request);
            for part in parts {
                if socket.write_all(part.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if hold_open {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        (addr, rx)
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let addr: SocketAddr = "127.0.0.1:11434".parse().unwrap();
        let client = InferenceClient::new(&test_config(addr, 1_000)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:11434/api");
        assert_eq!(client.default_model(), "test-model");
    }

    #[tokio::test]
    async fn test_generate_streams_fragments_in_order() {
        let parts = vec![
            CHUNKED_OK.to_string(),
            chunk("{\"model\":\"test-model\",\"response\":\"Hel\",\"done\":false}\n{\"model\":\"test-"),
            chunk("model\",\"response\":\"lo\",\"done\":false}\n"),
            chunk("{bad json\n"),
            chunk("{\"model\":\"test-model\",\"response\":\"\",\"done\":true}\n"),
            "0\r\n\r\n".to_string(),
        ];
        let (addr, request_rx) = serve_once(parts, false).await;
        let client = InferenceClient::new(&test_config(addr, 2_000)).unwrap();

        let mut seen = Vec::new();
        let text = client
            .generate("Say hello", None, |f| seen.push(f.to_string()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(text, "Hello");
        assert_eq!(seen, vec!["Hel", "lo"]);

        let request = request_rx.await.unwrap();
        assert!(request.starts_with("POST /api/generate "));
        assert!(request.contains("\"stream\":true"));
        assert!(request.contains("\"model\":\"test-model\""));
    }

    #[tokio::test]
    async fn test_generate_404_is_model_not_found() {
        let parts = vec![
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
        ];
        let (addr, _rx) = serve_once(parts, false).await;
        let client = InferenceClient::new(&test_config(addr, 2_000)).unwrap();

        let err = client
            .generate("hi", Some("missing:latest"), |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            InferenceError::ModelNotFound { model } => assert_eq!(model, "missing:latest"),
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_500_carries_status() {
        let body = "{\"error\":\"boom\"}";
        let parts = vec![format!(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )];
        let (addr, _rx) = serve_once(parts, false).await;
        let client = InferenceClient::new(&test_config(addr, 2_000)).unwrap();

        let err = client
            .generate("hi", None, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("boom"));
    }

    fn stalled_error_response() -> Vec<String> {
        vec!["HTTP/1.1 500 Internal Server Error\r\ncontent-length: 100\r\n\r\n{\"err".to_string()]
    }

    #[tokio::test]
    async fn test_generate_stalled_error_body_times_out() {
        let (addr, _rx) = serve_once(stalled_error_response(), true).await;
        let client = InferenceClient::new(&test_config(addr, 200)).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            client.generate("hi", None, |_| {}, &CancellationToken::new()),
        )
        .await
        .expect("generate should return once the body read times out");

        match result.unwrap_err() {
            InferenceError::Timeout { duration_ms } => assert_eq!(duration_ms, 200),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_stalled_error_body_cancels() {
        let (addr, _rx) = serve_once(stalled_error_response(), true).await;
        let client = InferenceClient::new(&test_config(addr, 5_000)).unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            client.generate("hi", None, |_| {}, &cancel),
        )
        .await
        .expect("generate should return once cancelled");
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_generate_cancel_after_first_fragment() {
        let parts = vec![
            CHUNKED_OK.to_string(),
            chunk("{\"response\":\"Hel\",\"done\":false}\n"),
        ];
        let (addr, _rx) = serve_once(parts, true).await;
        let client = InferenceClient::new(&test_config(addr, 5_000)).unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let mut seen = Vec::new();
        let err = client
            .generate(
                "hi",
                None,
                |f| {
                    seen.push(f.to_string());
                    stopper.cancel();
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(seen, vec!["Hel"]);
    }

    #[tokio::test]
    async fn test_generate_idle_timeout() {
        let parts = vec![CHUNKED_OK.to_string()];
        let (addr, _rx) = serve_once(parts, true).await;
        let client = InferenceClient::new(&test_config(addr, 150)).unwrap();

        let err = client
            .generate("hi", None, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Timeout { duration_ms: 150 }));
    }

    #[tokio::test]
    async fn test_generate_already_cancelled_issues_no_request() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let client = InferenceClient::new(&test_config(addr, 1_000)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.generate("hi", None, |_| {}, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_generate_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = InferenceClient::new(&test_config(addr, 1_000)).unwrap();
        let err = client
            .generate("hi", None, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_models() {
        let body = r#"{"models":[{"name":"llama3:8b","size":1},{"name":"deepseek-r1:14b","size":2}]}"#;
        let parts = vec![format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )];
        let (addr, request_rx) = serve_once(parts, false).await;
        let client = InferenceClient::new(&test_config(addr, 1_000)).unwrap();

        let models = client.list_models().await.unwrap();
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["llama3:8b", "deepseek-r1:14b"]);
        assert!(request_rx.await.unwrap().starts_with("GET /api/tags "));
    }
}
