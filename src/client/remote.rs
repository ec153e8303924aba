//! Remote inference gateway client (OpenRouter wire dialect).
//!
//! One configured connection to the remote chat-completions gateway. Unary
//! calls go through a pooled client with a per-request timeout; streaming
//! calls go through a second pooled client with *no* request timeout —
//! stream lifetime is governed solely by the caller's cancellation token.
//!
//! Credential hygiene: the API key is stored once (trimmed), attached as a
//! bearer header per request (never installed as a client-wide default, so
//! connection-pool diagnostics and logs cannot see it), and rendered
//! everywhere else as `[REDACTED, length=N, fingerprint=XXXXXXXX]`. Every
//! authentication attempt is recorded in the process-wide lockout table
//! under the key's fingerprint.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::{header, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoreError;

use super::lockout::{self, fingerprint};
use super::sse::{pump_stream, StreamOutcome, STREAM_CHANNEL_CAPACITY};
use super::{ChatMessage, ChatRequest, ChatResponse, StreamChunk};

/// Default remote gateway endpoint.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
/// Default model: the gateway's auto-router picks the concrete model.
pub const DEFAULT_MODEL: &str = "openrouter/auto";
/// Default unary request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default retry budget for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Unary response bodies larger than this abort the call.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

const API_KEY_PREFIX: &str = "sk-or-";
const MIN_KEY_LENGTH: usize = 38;
const MIN_DISTINCT_CHARS: usize = 10;
const USER_AGENT: &str = concat!("tierguard/", env!("CARGO_PKG_VERSION"));

/// Shared pooled client for unary calls. Read-only after construction.
static SHARED_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| build_client(true, true));
/// Shared pooled client for streaming calls — no request-level timeout.
static SHARED_STREAM_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| build_client(true, true));

fn build_client(verify_certs: bool, _unary: bool) -> reqwest::Client {
    // Cipher policy is delegated to the platform TLS stack; the floor is
    // TLS 1.2 and server certificate verification is ON unless explicitly
    // disabled for a test endpoint.
    reqwest::Client::builder()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .danger_accept_invalid_certs(!verify_certs)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client")
}

/// Validate an API key's shape before it is ever sent anywhere.
///
/// Enforces the vendor prefix, a minimum length, and a minimum number of
/// distinct characters past the prefix — low-entropy placeholder keys
/// (`sk-or-aaaa…`) are refused up front.
pub fn validate_api_key(key: &str) -> Result<(), CoreError> {
    let key = key.trim();
    if !key.starts_with(API_KEY_PREFIX) {
        return Err(CoreError::NotConfigured(format!(
            "API key must start with {API_KEY_PREFIX:?}"
        )));
    }
    if key.len() < MIN_KEY_LENGTH {
        return Err(CoreError::NotConfigured(format!(
            "API key must be at least {MIN_KEY_LENGTH} characters"
        )));
    }
    let distinct = {
        let mut chars: Vec<char> = key[API_KEY_PREFIX.len()..].chars().collect();
        chars.sort_unstable();
        chars.dedup();
        chars.len()
    };
    if distinct < MIN_DISTINCT_CHARS {
        return Err(CoreError::NotConfigured(
            "API key entropy too low (test key?)".into(),
        ));
    }
    Ok(())
}

/// Client for the remote inference gateway.
pub struct OpenRouterClient {
    api_key: String,
    key_fingerprint: String,
    base_url: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
    site_url: Option<String>,
    site_name: Option<String>,
    max_response_bytes: usize,
    http: reqwest::Client,
    stream_http: reqwest::Client,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("api_key", &self.redacted_key())
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl OpenRouterClient {
    /// Build a client around a credential. The key is trimmed and stored
    /// once; its fingerprint is precomputed for lockout accounting.
    pub fn new(api_key: impl Into<String>) -> Self {
        let api_key = api_key.into().trim().to_string();
        let key_fingerprint = fingerprint(&api_key);
        Self {
            api_key,
            key_fingerprint,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            site_url: None,
            site_name: None,
            max_response_bytes: MAX_RESPONSE_BYTES,
            http: SHARED_CLIENT.clone(),
            stream_http: SHARED_STREAM_CLIENT.clone(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Attribution header `HTTP-Referer`, recommended by the gateway.
    pub fn with_site_url(mut self, url: impl Into<String>) -> Self {
        self.site_url = Some(url.into());
        self
    }

    /// Attribution header `X-Title`.
    pub fn with_site_name(mut self, name: impl Into<String>) -> Self {
        self.site_name = Some(name.into());
        self
    }

    /// Toggle server-certificate verification. Disabling rebuilds both
    /// pooled clients; only intended for pinned test endpoints.
    pub fn with_cert_validation(mut self, verify: bool) -> Self {
        if !verify {
            warn!("server certificate verification DISABLED");
        }
        self.http = build_client(verify, true);
        self.stream_http = build_client(verify, false);
        self
    }

    #[cfg(test)]
    fn with_response_cap(mut self, cap: usize) -> Self {
        self.max_response_bytes = cap;
        self
    }

    /// Whether a credential is present.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Default model this client dispatches to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The only loggable rendering of the credential.
    pub fn redacted_key(&self) -> String {
        format!(
            "[REDACTED, length={}, fingerprint={}]",
            self.api_key.len(),
            self.key_fingerprint
        )
    }

    /// One-shot chat completion against the client's default model.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, CoreError> {
        let model = self.model.clone();
        self.chat_with_model(cancel, &model, messages).await
    }

    /// One-shot chat completion with a per-call model override.
    ///
    /// The receiver is not mutated — the model travels in the request plan,
    /// so concurrent calls with different models never race on shared state.
    pub async fn chat_with_model(
        &self,
        cancel: &CancellationToken,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, CoreError> {
        self.ensure_ready()?;

        let body = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            stream: false,
            temperature: None,
            max_tokens: None,
        };

        let mut last_err = CoreError::Transport("no attempt made".into());
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                self.backoff(cancel, attempt, &last_err).await?;
            }

            match self.send_unary(&body).await {
                Ok(response) => {
                    lockout::global().record_success(&self.key_fingerprint);
                    return Ok(response);
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(CoreError::Cancelled);
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "retryable chat failure");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn send_unary(&self, body: &ChatRequest) -> Result<ChatResponse, CoreError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .request(self.http.post(&url))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.classify_status(status, &response));
        }

        let bytes = read_bounded(response, self.max_response_bytes).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::Transport(format!("decoding response JSON: {e}")))
    }

    /// Attach the per-request headers. The bearer header lives only on this
    /// outbound request — it is never stored in client defaults, so nothing
    /// that inspects the client (logs, pool state) can observe it.
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, USER_AGENT);
        if let Some(url) = &self.site_url {
            builder = builder.header("HTTP-Referer", url.as_str());
        }
        if let Some(name) = &self.site_name {
            builder = builder.header("X-Title", name.as_str());
        }
        builder
    }

    fn classify_status(&self, status: StatusCode, response: &reqwest::Response) -> CoreError {
        match status {
            StatusCode::UNAUTHORIZED => {
                lockout::global().record_failure(&self.key_fingerprint);
                CoreError::AuthFailed
            }
            StatusCode::PAYMENT_REQUIRED => CoreError::InsufficientCredits,
            StatusCode::NOT_FOUND => CoreError::ModelNotFound,
            StatusCode::TOO_MANY_REQUESTS => CoreError::RateLimited {
                retry_after_secs: parse_retry_after(response).unwrap_or(1),
            },
            s => CoreError::UpstreamStatus { status: s.as_u16() },
        }
    }

    fn ensure_ready(&self) -> Result<(), CoreError> {
        if !self.is_configured() {
            return Err(CoreError::NotConfigured("no API key set".into()));
        }
        // Offline enforcement happens at routing time (the enforcer pins
        // offline sessions to Local) and through the explicit feature gates;
        // by the time a remote call is issued the policy has already spoken.
        lockout::global().check(&self.key_fingerprint)
    }

    /// Sleep out the backoff for `attempt`, honouring cancellation and any
    /// server-provided `Retry-After` delay.
    async fn backoff(
        &self,
        cancel: &CancellationToken,
        attempt: u32,
        last_err: &CoreError,
    ) -> Result<(), CoreError> {
        let exp = Duration::from_millis(500).saturating_mul(1u32 << (attempt - 1).min(16));
        let mut delay = exp.min(Duration::from_secs(10));
        if let CoreError::RateLimited { retry_after_secs } = last_err {
            delay = delay.max(Duration::from_secs(*retry_after_secs));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Streamed chat completion. Returns a bounded receiver of decoded
    /// chunks; the final item is an `Err` when the stream ultimately failed
    /// (carrying accumulated partial content) and the channel then closes.
    ///
    /// Mid-stream transport failures are retried from the beginning up to
    /// the retry budget, passing the captured `Last-Event-ID` so a
    /// resume-capable server can continue where it left off. Cancellation is
    /// reported immediately and never retried.
    pub async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<StreamChunk, CoreError>>, CoreError> {
        self.ensure_ready()?;

        let body = ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: true,
            temperature: None,
            max_tokens: None,
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let plan = StreamPlan {
            url: format!("{}/chat/completions", self.base_url),
            body,
            max_retries: self.max_retries,
            fingerprint: self.key_fingerprint.clone(),
        };
        let client = self.stream_http.clone();
        let headers_from = self.clone_request_state();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            run_stream(plan, client, headers_from, tx, cancel).await;
        });

        Ok(rx)
    }

    /// Streamed completion, accumulated to a full string. `on_delta` fires
    /// for each content delta in arrival order.
    pub async fn stream_completion(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        mut on_delta: impl FnMut(&str),
    ) -> Result<String, CoreError> {
        let mut rx = self.chat_stream(cancel, messages).await?;
        let mut full = String::new();
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    let content = chunk.content();
                    if !content.is_empty() {
                        on_delta(&content);
                        full.push_str(&content);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(full)
    }

    /// Clone of the request-building state shared with the stream driver
    /// task (the credential itself, attribution headers).
    fn clone_request_state(&self) -> RequestState {
        RequestState {
            api_key: self.api_key.clone(),
            site_url: self.site_url.clone(),
            site_name: self.site_name.clone(),
        }
    }
}

#[derive(Clone)]
struct RequestState {
    api_key: String,
    site_url: Option<String>,
    site_name: Option<String>,
}

struct StreamPlan {
    url: String,
    body: ChatRequest,
    max_retries: u32,
    fingerprint: String,
}

async fn run_stream(
    plan: StreamPlan,
    client: reqwest::Client,
    state: RequestState,
    tx: mpsc::Sender<Result<StreamChunk, CoreError>>,
    cancel: CancellationToken,
) {
    let mut accumulated = StreamOutcome::default();
    let mut last_err: Option<CoreError> = None;

    for attempt in 0..=plan.max_retries {
        if attempt > 0 {
            let delay =
                Duration::from_millis(500).saturating_mul(1u32 << (attempt - 1).min(16));
            let delay = delay.min(Duration::from_secs(10));
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(CoreError::Cancelled)).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut builder = client
            .post(&plan.url)
            .header(header::AUTHORIZATION, format!("Bearer {}", state.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .json(&plan.body);
        if let Some(url) = &state.site_url {
            builder = builder.header("HTTP-Referer", url.as_str());
        }
        if let Some(name) = &state.site_name {
            builder = builder.header("X-Title", name.as_str());
        }
        if let Some(id) = &accumulated.last_event_id {
            // Resume hint; the server may or may not honour it.
            builder = builder.header("Last-Event-ID", id.as_str());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Err(CoreError::Cancelled)).await;
                return;
            }
            sent = builder.send() => sent,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                last_err = Some(CoreError::Transport(e.to_string()));
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = match status {
                StatusCode::UNAUTHORIZED => {
                    lockout::global().record_failure(&plan.fingerprint);
                    CoreError::AuthFailed
                }
                StatusCode::TOO_MANY_REQUESTS => CoreError::RateLimited {
                    retry_after_secs: parse_retry_after(&response).unwrap_or(1),
                },
                s => CoreError::UpstreamStatus { status: s.as_u16() },
            };
            if err.is_retryable() && attempt < plan.max_retries {
                last_err = Some(err);
                continue;
            }
            let _ = tx.send(Err(err)).await;
            return;
        }

        lockout::global().record_success(&plan.fingerprint);

        match pump_stream(response.bytes_stream(), &tx, &cancel).await {
            Ok(_outcome) => return,
            Err((partial, err)) => {
                accumulated.content.push_str(&partial.content);
                accumulated.delivered += partial.delivered;
                if partial.last_event_id.is_some() {
                    accumulated.last_event_id = partial.last_event_id;
                }
                match err {
                    CoreError::Cancelled => {
                        let _ = tx.send(Err(CoreError::Cancelled)).await;
                        return;
                    }
                    CoreError::ChunkTooLarge { limit } => {
                        let _ = tx.send(Err(CoreError::ChunkTooLarge { limit })).await;
                        return;
                    }
                    e => {
                        last_err = Some(e);
                        // retry, preserving the partial
                    }
                }
            }
        }
    }

    let underlying = last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "exhausted retries".into());
    let _ = tx
        .send(Err(CoreError::StreamError {
            partial: accumulated.content,
            delivered: accumulated.delivered,
            underlying,
        }))
        .await;
}

/// Read a response body through a hard byte cap.
async fn read_bounded(response: reqwest::Response, cap: usize) -> Result<Vec<u8>, CoreError> {
    use futures_util::StreamExt;
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CoreError::Transport(e.to_string()))?;
        if buf.len() + chunk.len() > cap {
            return Err(CoreError::ResponseTooLarge { limit: cap });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// `Retry-After` as delay seconds: integer seconds first, HTTP-date second.
fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(secs);
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.num_seconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn test_key(tag: &str) -> String {
        // Unique per test so the process-global lockout table cannot couple
        // tests together.
        format!("sk-or-v1-{tag}-0123456789abcdefghijklmnopqrstuvwxyz")
    }

    fn client_for(server: &MockServer, tag: &str) -> OpenRouterClient {
        OpenRouterClient::new(test_key(tag))
            .with_base_url(server.uri())
            .with_max_retries(0)
    }

    fn ok_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "gen-1",
            "model": "openrouter/auto",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}
        })
    }

    // -----------------------------------------------------------------------
    // Key validation & redaction
    // -----------------------------------------------------------------------

    #[test]
    fn validate_api_key_accepts_a_realistic_key() {
        assert!(validate_api_key(&test_key("ok")).is_ok());
    }

    #[test]
    fn validate_api_key_rejects_wrong_prefix_short_and_low_entropy() {
        assert!(validate_api_key("sk-ant-REDACTED").is_err());
        assert!(validate_api_key("sk-or-short").is_err());
        assert!(validate_api_key(&format!("sk-or-{}", "a".repeat(40))).is_err());
    }

    #[test]
    fn debug_output_redacts_the_credential() {
        let key = test_key("redact");
        let client = OpenRouterClient::new(key.clone());
        let debug = format!("{client:?}");
        assert!(!debug.contains(&key), "raw key must never render");
        assert!(debug.contains("[REDACTED, length="));
        assert!(client.redacted_key().contains("fingerprint="));
    }

    #[test]
    fn unconfigured_client_reports_not_configured() {
        let client = OpenRouterClient::new("");
        assert!(!client.is_configured());
    }

    // -----------------------------------------------------------------------
    // Unary chat
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn chat_returns_parsed_response_and_sends_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header_exists("authorization"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("pong")))
            .mount(&server)
            .await;

        let client = client_for(&server, "unary");
        let cancel = CancellationToken::new();
        let resp = client
            .chat(&cancel, &[ChatMessage::user("ping")])
            .await
            .unwrap();
        assert_eq!(resp.content(), "pong");
        assert_eq!(resp.usage.unwrap().total_tokens, 12);
    }

    #[tokio::test]
    async fn chat_without_credential_fails_not_configured() {
        let client = OpenRouterClient::new("");
        let cancel = CancellationToken::new();
        let err = client
            .chat(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_configured");
    }

    #[tokio::test]
    async fn status_mapping_is_exact() {
        for (status, code) in [
            (401u16, "auth_failed"),
            (402, "insufficient_credits"),
            (404, "model_not_found"),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
            let client = client_for(&server, &format!("status{status}"));
            let cancel = CancellationToken::new();
            let err = client
                .chat(&cancel, &[ChatMessage::user("x")])
                .await
                .unwrap_err();
            assert_eq!(err.code(), code, "HTTP {status}");
        }
    }

    #[tokio::test]
    async fn rate_limit_is_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("after retry")))
            .mount(&server)
            .await;

        let client = client_for(&server, "429retry").with_max_retries(2);
        let cancel = CancellationToken::new();
        let resp = client
            .chat(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap();
        assert_eq!(resp.content(), "after retry");
    }

    #[tokio::test]
    async fn server_errors_are_retried_and_4xx_is_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("recovered")))
            .mount(&server)
            .await;

        let client = client_for(&server, "5xx").with_max_retries(1);
        let cancel = CancellationToken::new();
        assert_eq!(
            client.chat(&cancel, &[ChatMessage::user("x")]).await.unwrap().content(),
            "recovered"
        );

        // 400 is terminal: exactly one request hits the mock.
        let server2 = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server2)
            .await;
        let client2 = client_for(&server2, "400final").with_max_retries(3);
        let err = client2
            .chat(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream_error");
    }

    #[tokio::test]
    async fn oversized_response_fails_response_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let client = client_for(&server, "bigbody").with_response_cap(1024);
        let cancel = CancellationToken::new();
        let err = client
            .chat(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "response_too_large");
    }

    #[tokio::test]
    async fn repeated_auth_failures_lock_the_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server, "lockme");
        let cancel = CancellationToken::new();
        for _ in 0..lockout::MAX_FAILURES {
            let err = client
                .chat(&cancel, &[ChatMessage::user("x")])
                .await
                .unwrap_err();
            assert_eq!(err.code(), "auth_failed");
        }
        // Next call is refused locally, before any request.
        let err = client
            .chat(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "locked");
    }

    // -----------------------------------------------------------------------
    // Concurrent per-call model override
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn concurrent_chat_with_model_never_mutates_the_receiver() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(move |req: &Request| {
                // Echo the requested model back so each caller can verify it
                // observed its own argument.
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let model = body["model"].as_str().unwrap_or("?").to_string();
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "id": "gen",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": model},
                        "finish_reason": "stop"
                    }]
                }))
            })
            .mount(&server)
            .await;

        let client = std::sync::Arc::new(client_for(&server, "concurrent"));
        assert_eq!(client.model(), DEFAULT_MODEL);

        let mut handles = Vec::new();
        for i in 0..100u32 {
            let client = std::sync::Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let model = format!("test-model-{}", i % 5);
                let resp = client
                    .chat_with_model(&cancel, &model, &[ChatMessage::user("x")])
                    .await
                    .unwrap();
                assert_eq!(resp.content(), model, "each call observes its own model");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(client.model(), DEFAULT_MODEL, "receiver model must be untouched");
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    fn sse_frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({
                "choices": [{"delta": {"content": content}, "finish_reason": null}]
            })
        )
    }

    #[tokio::test]
    async fn clean_stream_delivers_all_chunks_then_closes() {
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            sse_frame("a"),
            sse_frame("b"),
            sse_frame("c")
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, "cleanstream");
        let cancel = CancellationToken::new();
        let full = client
            .stream_completion(&cancel, &[ChatMessage::user("x")], |_| {})
            .await
            .unwrap();
        assert_eq!(full, "abc");
    }

    #[tokio::test]
    async fn truncated_stream_yields_stream_error_with_partial(){
        // Three frames, then the body ends without [DONE]; retries are
        // exhausted against 404s, so the caller gets the partial content.
        let body = format!("{}{}{}", sse_frame("one "), sse_frame("two "), sse_frame("three"));
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let client = client_for(&server, "partial");
        let cancel = CancellationToken::new();
        let mut rx = client
            .chat_stream(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap();

        let mut chunks = Vec::new();
        let mut final_err = None;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => chunks.push(chunk.content()),
                Err(e) => final_err = Some(e),
            }
        }
        assert_eq!(chunks, vec!["one ", "two ", "three"]);
        match final_err.expect("stream must end in an error") {
            CoreError::StreamError { partial, delivered, .. } => {
                assert_eq!(partial, "one two three");
                assert_eq!(delivered, 3);
            }
            other => panic!("expected stream_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_retry_sends_the_captured_last_event_id() {
        // First attempt: one identified frame, then EOF. Second attempt
        // must carry Last-Event-ID and completes cleanly.
        let first = format!("id: evt-9\n{}", sse_frame("part1 "));
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::header("last-event-id", "evt-9"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(format!("{}data: [DONE]\n\n", sse_frame("part2"))),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(first),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, "resume").with_max_retries(2);
        let cancel = CancellationToken::new();
        let full = client
            .stream_completion(&cancel, &[ChatMessage::user("x")], |_| {})
            .await
            .unwrap();
        assert_eq!(full, "part1 part2");
    }

    #[tokio::test]
    async fn cancellation_is_reported_immediately_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_frame("never-ends "))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, "cancelme").with_max_retries(3);
        let cancel = CancellationToken::new();
        let mut rx = client
            .chat_stream(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap();
        cancel.cancel();

        let mut saw_cancelled = false;
        while let Some(item) = rx.recv().await {
            if let Err(e) = item {
                assert_eq!(e.code(), "cancelled");
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled, "cancellation must surface as an error item");
    }

    // -----------------------------------------------------------------------
    // Retry-After parsing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn rate_limited_error_carries_the_retry_after_seconds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let client = client_for(&server, "retryafter");
        let cancel = CancellationToken::new();
        let err = client
            .chat(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap_err();
        match err {
            CoreError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 7),
            other => panic!("expected rate_limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_after_http_date_is_parsed() {
        let when = chrono::Utc::now() + chrono::Duration::seconds(30);
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", when.to_rfc2822().as_str()),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, "httpdate");
        let cancel = CancellationToken::new();
        let err = client
            .chat(&cancel, &[ChatMessage::user("x")])
            .await
            .unwrap_err();
        match err {
            CoreError::RateLimited { retry_after_secs } => {
                assert!((25..=30).contains(&retry_after_secs), "got {retry_after_secs}");
            }
            other => panic!("expected rate_limited, got {other:?}"),
        }
    }
}
