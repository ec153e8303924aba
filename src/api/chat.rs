//! `/v1/chat/completions` and `/v1/models`.
//!
//! The gateway never trusts classification from HTTP clients: every request
//! routes as `Unclassified`, with the server's own paranoid/offline flags
//! applied. Tier selection, dispatch, fallback and accounting happen here;
//! the response is the standard OpenAI `chat.completion` object, or SSE
//! `chat.completion.chunk` frames when `stream` is set.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classification::ClassificationLevel;
use crate::client::{ChatMessage, Role};
use crate::error::{AppError, CoreError};
use crate::routing::{estimate_tokens, route_query_detailed, RouteOptions, RoutingDecision, Tier};

use super::ServerState;

/// Hard bounds on an incoming request.
pub const MAX_MESSAGES: usize = 100;
pub const MAX_MESSAGE_CHARS: usize = 100_000;
pub const MAX_TOKENS_LIMIT: i64 = 128_000;

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

/// What one backend dispatch produced.
struct Dispatched {
    content: String,
    input_tokens: u32,
    output_tokens: u32,
    tier: Tier,
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, AppError> {
    validate_request(&request)?;

    let config = state.config();
    let query = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default();

    // Cache consult first, non-streaming only; routing happens on a miss.
    let cache_enabled = config.cache.enabled;
    if !request.stream && cache_enabled && !query.is_empty() {
        if let Some(hit) = state.cache.get(&query).await {
            state.stats.record(Tier::Cache, 0, 0, true);
            return Ok(completion_response(&hit, Tier::Cache, 0, 0).into_response());
        }
    }

    let opts = RouteOptions {
        mode: config.router.mode,
        max_tier: config.router.max_tier,
        paranoid: config.gateway.paranoid,
        offline: config.gateway.offline,
        has_cloud_key: state.remote.is_some(),
    };
    // The API layer never trusts classification from clients.
    let decision = route_query_detailed(&query, ClassificationLevel::Unclassified, opts);
    debug!(tier = %decision.tier, reason = %decision.reason, "routed");

    let messages = convert_messages(&request.messages);

    if request.stream {
        return Ok(stream_response(state, decision, messages, query).await);
    }

    let dispatched = dispatch(&state, &decision, &messages).await?;
    state.stats.record(
        dispatched.tier,
        dispatched.input_tokens,
        dispatched.output_tokens,
        false,
    );
    if cache_enabled && !query.is_empty() {
        state.cache.put(&query, &dispatched.content).await;
    }

    Ok(completion_response(
        &dispatched.content,
        dispatched.tier,
        dispatched.input_tokens,
        dispatched.output_tokens,
    )
    .into_response())
}

fn validate_request(request: &CompletionRequest) -> Result<(), CoreError> {
    if request.messages.is_empty() {
        return Err(CoreError::InvalidRequest("messages must not be empty".into()));
    }
    if request.messages.len() > MAX_MESSAGES {
        return Err(CoreError::InvalidRequest(format!(
            "at most {MAX_MESSAGES} messages per request"
        )));
    }
    for message in &request.messages {
        if Role::parse(&message.role).is_none() {
            return Err(CoreError::InvalidRequest(format!(
                "unrecognised role {:?}",
                message.role
            )));
        }
        if message.content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(CoreError::InvalidRequest(format!(
                "message content exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }
    }
    if let Some(max_tokens) = request.max_tokens {
        if !(0..=MAX_TOKENS_LIMIT).contains(&max_tokens) {
            return Err(CoreError::ParameterInvalid {
                name: "max_tokens".into(),
                reason: format!("must be within [0, {MAX_TOKENS_LIMIT}]"),
            });
        }
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(CoreError::ParameterInvalid {
                name: "temperature".into(),
                reason: "must be within [0.0, 2.0]".into(),
            });
        }
    }
    Ok(())
}

fn convert_messages(incoming: &[IncomingMessage]) -> Vec<ChatMessage> {
    incoming
        .iter()
        .filter_map(|m| {
            Role::parse(&m.role).map(|role| ChatMessage { role, content: m.content.clone() })
        })
        .collect()
}

/// Dispatch to the decided backend; a failed local dispatch falls back to
/// the remote gateway only when one is configured *and* policy permits
/// cloud for this request (a paranoid/offline pin must never fall back).
async fn dispatch(
    state: &ServerState,
    decision: &RoutingDecision,
    messages: &[ChatMessage],
) -> Result<Dispatched, CoreError> {
    let config = state.config();
    let cancel = CancellationToken::new();

    if decision.tier.is_local() {
        match dispatch_local(state, &cancel, decision, messages).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let may_fall_back = state.remote.is_some()
                    && !config.gateway.paranoid
                    && !config.gateway.offline;
                if !may_fall_back {
                    return Err(e);
                }
                warn!(error = %e, "local dispatch failed; falling back to remote");
            }
        }
    }
    dispatch_remote(state, &cancel, messages).await
}

async fn dispatch_local(
    state: &ServerState,
    cancel: &CancellationToken,
    decision: &RoutingDecision,
    messages: &[ChatMessage],
) -> Result<Dispatched, CoreError> {
    // The routing decision's model hint selects among the configured local
    // models; unhinted (or unconfigured) hints use the default tag.
    let config = state.config();
    let model = config
        .local
        .model_for_hint(decision.selected_model.as_deref())
        .to_string();
    let response = state.local.chat(cancel, &model, messages).await?;
    Ok(Dispatched {
        content: response.message.content,
        input_tokens: response.prompt_eval_count,
        output_tokens: response.eval_count,
        tier: Tier::Local,
    })
}

async fn dispatch_remote(
    state: &ServerState,
    cancel: &CancellationToken,
    messages: &[ChatMessage],
) -> Result<Dispatched, CoreError> {
    let remote = state
        .remote
        .as_ref()
        .ok_or_else(|| CoreError::NotConfigured("no remote gateway credential".into()))?;
    let response = remote.chat(cancel, messages).await?;
    let usage = response.usage.unwrap_or_default();
    Ok(Dispatched {
        content: response.content().to_string(),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        tier: Tier::Cloud,
    })
}

/// The OpenAI `chat.completion` response object.
fn completion_response(
    content: &str,
    tier: Tier,
    input_tokens: u32,
    output_tokens: u32,
) -> Json<serde_json::Value> {
    Json(json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": tier.name(),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

/// Streamed variant: SSE `chat.completion.chunk` frames, then `[DONE]`.
async fn stream_response(
    state: Arc<ServerState>,
    decision: RoutingDecision,
    messages: Vec<ChatMessage>,
    query: String,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<bytes::Bytes, std::io::Error>>();

    tokio::spawn(async move {
        let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        let created = chrono::Utc::now().timestamp();
        let model = decision.tier.name().to_string();
        let frame = |delta: serde_json::Value, finish: Option<&str>| {
            bytes::Bytes::from(format!(
                "data: {}\n\n",
                json!({
                    "id": id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": model,
                    "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
                })
            ))
        };

        // Opening frame names the assistant role.
        let _ = tx.send(Ok(frame(json!({"role": "assistant"}), None)));

        let cancel = CancellationToken::new();
        let config = state.config();
        let result: Result<String, CoreError> = if decision.tier.is_local() {
            let model_tag = config
                .local
                .model_for_hint(decision.selected_model.as_deref())
                .to_string();
            let sender = tx.clone();
            state
                .local
                .chat_stream(&cancel, &model_tag, &messages, |delta| {
                    let _ = sender.send(Ok(frame(json!({"content": delta}), None)));
                })
                .await
                .map(|resp| resp.message.content)
        } else {
            match state.remote.as_ref() {
                Some(remote) => {
                    let sender = tx.clone();
                    remote
                        .stream_completion(&cancel, &messages, |delta| {
                            let _ = sender.send(Ok(frame(json!({"content": delta}), None)));
                        })
                        .await
                }
                None => Err(CoreError::NotConfigured("no remote gateway credential".into())),
            }
        };

        match result {
            Ok(content) => {
                let _ = tx.send(Ok(frame(json!({}), Some("stop"))));
                let _ = tx.send(Ok(bytes::Bytes::from("data: [DONE]\n\n")));
                state.stats.record(
                    decision.tier,
                    estimate_tokens(&query),
                    estimate_tokens(&content),
                    false,
                );
            }
            Err(e) => {
                warn!(error = %e, "stream dispatch failed");
                // Partial content (if any) has already been delivered; close
                // the stream with an error frame so clients see the failure.
                let _ = tx.send(Ok(bytes::Bytes::from(format!(
                    "data: {}\n\n",
                    json!({"error": {"message": e.to_string(), "code": e.code()}})
                ))));
                let _ = tx.send(Ok(bytes::Bytes::from("data: [DONE]\n\n")));
            }
        }
    });

    let body_stream = futures_util::stream::unfold(rx, |mut rx| async {
        rx.recv().await.map(|item| (item, rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .expect("static header set must build")
}

/// GET /v1/models — tier names plus whatever the local daemon reports.
pub async fn list_models(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let created = chrono::Utc::now().timestamp();
    let mut data: Vec<serde_json::Value> = Tier::all()
        .iter()
        .map(|tier| {
            json!({
                "id": tier.name(),
                "object": "model",
                "created": created,
                "owned_by": if tier.is_local() { "local" } else { "remote" },
            })
        })
        .collect();

    if let Ok(local_models) = state.local.list_models().await {
        for name in local_models {
            data.push(json!({
                "id": name,
                "object": "model",
                "created": created,
                "owned_by": "ollama",
            }));
        }
    }

    Json(json!({"object": "list", "data": data}))
}
