//! Error types shared across the gateway.
//!
//! [`CoreError`] is the typed error surfaced by the routing, client, tool,
//! and security layers. Each variant maps to a stable machine-readable code
//! (used in HTTP error bodies) and knows whether a retry can help.
//!
//! [`AppError`] wraps [`anyhow::Error`] so axum handlers can propagate with
//! `?` — the idiomatic axum pattern. Detailed diagnostics go to the
//! structured log; the HTTP body carries only a generic message and code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Typed error for the routing and inference core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // --- configuration ---
    #[error("client is not configured: {0}")]
    NotConfigured(String),
    #[error("URL scheme not allowed: {0}")]
    InvalidUrlScheme(String),

    // --- classification & policy ---
    #[error("classification blocks cloud: {0}")]
    ClassificationBlocksCloud(String),
    #[error("{0}")]
    OfflineModeBlocks(String),

    // --- validation ---
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("payload too large (limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("invalid parameter {name}: {reason}")]
    ParameterInvalid { name: String, reason: String },

    // --- security ---
    #[error("path escapes the allowed directories: {0}")]
    PathTraversal(String),
    #[error("path is on the deny-list: {0}")]
    BlockedPath(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("sensitive path requires approval: {0}")]
    SensitivePathRequiresApproval(String),
    #[error("command blocked: {0}")]
    CommandBlocked(String),
    #[error("interactive command not allowed in non-TTY context: {0}")]
    InteractiveCommand(String),
    #[error("privilege escalation not allowed: {0}")]
    PrivilegedCommand(String),
    #[error("possible data exfiltration: {0}")]
    ExfiltrationRisk(String),

    // --- remote ---
    #[error("authentication failed")]
    AuthFailed,
    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("insufficient credits on the remote account")]
    InsufficientCredits,
    #[error("model not found on the remote gateway")]
    ModelNotFound,
    #[error("response exceeded the {limit}-byte cap")]
    ResponseTooLarge { limit: usize },
    #[error("stream frame exceeded the {limit}-byte cap")]
    ChunkTooLarge { limit: usize },
    #[error("stream failed after {delivered} chunks: {underlying}")]
    StreamError {
        /// Content accumulated before the failure; callers may display or
        /// discard it.
        partial: String,
        delivered: usize,
        underlying: String,
    },
    #[error("remote gateway returned HTTP {status}")]
    UpstreamStatus { status: u16 },

    // --- locking ---
    #[error("credential is locked out for {remaining_secs}s after repeated failures")]
    Locked { remaining_secs: u64 },

    // --- cancellation & transport ---
    #[error("operation cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
}

impl CoreError {
    /// Stable machine-readable code, surfaced in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "not_configured",
            Self::InvalidUrlScheme(_) => "invalid_url_scheme",
            Self::ClassificationBlocksCloud(_) => "classification_blocks_cloud",
            Self::OfflineModeBlocks(_) => "offline_mode_blocks",
            Self::InvalidRequest(_) => "invalid_request",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UnknownModel(_) => "unknown_model",
            Self::ParameterInvalid { .. } => "parameter_invalid",
            Self::PathTraversal(_) => "path_traversal",
            Self::BlockedPath(_) => "blocked_path",
            Self::PathNotFound(_) => "not_found",
            Self::SensitivePathRequiresApproval(_) => "sensitive_path_requires_approval",
            Self::CommandBlocked(_) => "command_blocked",
            Self::InteractiveCommand(_) => "interactive_command",
            Self::PrivilegedCommand(_) => "privileged_command",
            Self::ExfiltrationRisk(_) => "exfiltration_risk",
            Self::AuthFailed => "auth_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::InsufficientCredits => "insufficient_credits",
            Self::ModelNotFound => "model_not_found",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::ChunkTooLarge { .. } => "chunk_too_large",
            Self::StreamError { .. } => "stream_error",
            Self::UpstreamStatus { .. } => "upstream_error",
            Self::Locked { .. } => "locked",
            Self::Cancelled => "cancelled",
            Self::Transport(_) => "transport_error",
        }
    }

    /// Whether retrying the same request can succeed.
    ///
    /// Only transient transport conditions qualify. Cancellation is never
    /// retryable; neither are validation, policy, or security refusals.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Transport(_)
                | Self::UpstreamStatus { status: 500..=599 }
        )
    }
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
///
/// Any type that implements `Into<anyhow::Error>` (which includes
/// `io::Error`, `reqwest::Error`, and [`CoreError`]) converts into an
/// [`AppError`] via the blanket [`From`] implementation.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Typed core errors keep their code and get a sensible status;
        // anything else is an opaque 500. Full detail goes to the log only.
        let (status, code) = match self.0.downcast_ref::<CoreError>() {
            Some(e) => (status_for(e), e.code()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        tracing::warn!(error = %self.0, code, "handler error");
        (
            status,
            Json(json!({
                "error": {
                    "message": self.0.to_string(),
                    "type": "invalid_request_error",
                    "code": code,
                }
            })),
        )
            .into_response()
    }
}

fn status_for(e: &CoreError) -> StatusCode {
    match e {
        CoreError::InvalidRequest(_) | CoreError::ParameterInvalid { .. } => {
            StatusCode::BAD_REQUEST
        }
        CoreError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        CoreError::UnknownModel(_) | CoreError::ModelNotFound | CoreError::PathNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        CoreError::AuthFailed | CoreError::Locked { .. } => StatusCode::UNAUTHORIZED,
        CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoreError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
        CoreError::ClassificationBlocksCloud(_)
        | CoreError::OfflineModeBlocks(_)
        | CoreError::PathTraversal(_)
        | CoreError::BlockedPath(_)
        | CoreError::SensitivePathRequiresApproval(_)
        | CoreError::CommandBlocked(_)
        | CoreError::InteractiveCommand(_)
        | CoreError::PrivilegedCommand(_)
        | CoreError::ExfiltrationRisk(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
