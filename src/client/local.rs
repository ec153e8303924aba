//! Local inference daemon client (Ollama).
//!
//! A deliberately thin HTTP client for the on-host daemon at a loopback URL.
//! Uses Ollama's native `/api/chat` endpoint, whose responses carry
//! `prompt_eval_count` / `eval_count` for token accounting. Streaming is
//! newline-delimited JSON rather than SSE.
//!
//! The base URL passes through the security kernel's URL validator with the
//! current offline flag — a loopback daemon passes either way, which is the
//! point: local inference works identically online and offline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CoreError;
use crate::security::validate_url;

use super::{ChatMessage, Role};

/// Default daemon endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
/// Default request timeout for unary local calls. Local models can be slow
/// to first token on cold load, so this is generous.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Request body for `/api/chat`.
#[derive(Debug, Serialize)]
struct LocalChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// One `/api/chat` response object (final object of a stream, or the whole
/// unary response).
#[derive(Debug, Clone, Deserialize)]
pub struct LocalChatResponse {
    #[serde(default = "default_message")]
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    /// Prompt tokens evaluated.
    #[serde(default)]
    pub prompt_eval_count: u32,
    /// Completion tokens generated.
    #[serde(default)]
    pub eval_count: u32,
}

fn default_message() -> ChatMessage {
    ChatMessage { role: Role::Assistant, content: String::new() }
}

/// Client for a locally-running inference daemon.
pub struct OllamaClient {
    /// Buffered requests — has the configured request timeout.
    http: reqwest::Client,
    /// Streaming requests — no request-level timeout.
    stream_http: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    /// Build a client, validating the base URL against the scheme filter
    /// and (when offline) the loopback requirement.
    pub fn new(base_url: &str) -> Result<Self, CoreError> {
        let url = validate_url(base_url, crate::offline::is_offline())?;
        let base_url = url.as_str().trim_end_matches('/').to_string();

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        let stream_http = reqwest::Client::builder()
            .build()
            .expect("failed to build streaming reqwest client");

        Ok(Self { http, stream_http, base_url })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One-shot chat against the daemon.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<LocalChatResponse, CoreError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = LocalChatRequest { model, messages, stream: false };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            sent = self.http.post(&url).json(&body).send() => {
                sent.map_err(|e| CoreError::Transport(e.to_string()))?
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::UnknownModel(model.to_string()));
        }
        if !status.is_success() {
            return Err(CoreError::UpstreamStatus { status: status.as_u16() });
        }

        response
            .json::<LocalChatResponse>()
            .await
            .map_err(|e| CoreError::Transport(format!("decoding daemon response: {e}")))
    }

    /// Streamed chat. `on_delta` fires per content fragment in arrival
    /// order; the returned response carries the accumulated content and the
    /// final token counts.
    pub async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        model: &str,
        messages: &[ChatMessage],
        mut on_delta: impl FnMut(&str),
    ) -> Result<LocalChatResponse, CoreError> {
        use futures_util::StreamExt;

        let url = format!("{}/api/chat", self.base_url);
        let body = LocalChatRequest { model, messages, stream: true };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            sent = self.stream_http.post(&url).json(&body).send() => {
                sent.map_err(|e| CoreError::Transport(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::UpstreamStatus { status: status.as_u16() });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut last: Option<LocalChatResponse> = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                next = stream.next() => next,
            };
            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(CoreError::Transport(e.to_string())),
                None => break,
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // The daemon streams one JSON object per line.
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LocalChatResponse>(line) {
                    Ok(piece) => {
                        if !piece.message.content.is_empty() {
                            on_delta(&piece.message.content);
                            content.push_str(&piece.message.content);
                        }
                        let done = piece.done;
                        last = Some(piece);
                        if done {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "skipping undecodable daemon frame"),
                }
            }

            if last.as_ref().is_some_and(|p| p.done) {
                break;
            }
        }

        let mut result = last.ok_or_else(|| {
            CoreError::Transport("daemon stream ended without any frames".into())
        })?;
        result.message.content = content;
        Ok(result)
    }

    /// Probe daemon liveness (`GET /`).
    pub async fn check_running(&self, cancel: &CancellationToken) -> bool {
        let url = format!("{}/", self.base_url);
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.http.get(&url).send() => {
                sent.map(|r| r.status().is_success()).unwrap_or(false)
            }
        }
    }

    /// Models the daemon has pulled (`GET /api/tags`).
    pub async fn list_models(&self) -> Result<Vec<String>, CoreError> {
        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            models: Vec<TagEntry>,
        }
        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
        }

        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::UpstreamStatus { status: response.status().as_u16() });
        }
        let tags: Tags = response
            .json()
            .await
            .map_err(|e| CoreError::Transport(format!("decoding tags: {e}")))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OllamaClient {
        OllamaClient::new(&server.uri()).unwrap()
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(OllamaClient::new("file:///etc/passwd").is_err());
        assert!(OllamaClient::new("gopher://localhost:11434").is_err());
    }

    #[tokio::test]
    async fn chat_returns_message_and_token_counts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "qwen2.5:1.5b",
                "message": {"role": "assistant", "content": "local answer"},
                "done": true,
                "prompt_eval_count": 12,
                "eval_count": 34
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let resp = client
            .chat(&cancel, "qwen2.5:1.5b", &[ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(resp.message.content, "local answer");
        assert_eq!(resp.prompt_eval_count, 12);
        assert_eq!(resp.eval_count, 34);
    }

    #[tokio::test]
    async fn chat_maps_404_to_unknown_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let err = client
            .chat(&cancel, "missing:model", &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_model");
    }

    #[tokio::test]
    async fn chat_stream_accumulates_ndjson_deltas_in_order() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo \"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"world\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\
             \"prompt_eval_count\":5,\"eval_count\":3}\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let mut deltas = Vec::new();
        let resp = client
            .chat_stream(&cancel, "m", &[ChatMessage::user("hi")], |d| {
                deltas.push(d.to_string());
            })
            .await
            .unwrap();

        assert_eq!(deltas, vec!["Hel", "lo ", "world"]);
        assert_eq!(resp.message.content, "Hello world");
        assert_eq!(resp.prompt_eval_count, 5);
        assert_eq!(resp.eval_count, 3);
        assert!(resp.done);
    }

    #[tokio::test]
    async fn check_running_reflects_daemon_liveness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ollama is running"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        assert!(client.check_running(&cancel).await);

        // A refused connection reads as not running.
        let dead = OllamaClient::new("http://127.0.0.1:9").unwrap();
        assert!(!dead.check_running(&cancel).await);
    }

    #[tokio::test]
    async fn list_models_reads_the_tags_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [
                    {"name": "qwen2.5:1.5b", "size": 1},
                    {"name": "llama3.2:3b", "size": 2}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["qwen2.5:1.5b", "llama3.2:3b"]);
    }
}
