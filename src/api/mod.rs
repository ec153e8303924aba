//! OpenAI-shaped HTTP gateway.
//!
//! Thin layer: handlers translate HTTP concerns into routing and client
//! calls; all policy lives in [`crate::routing`] and the security kernel.
//! The listener binds `127.0.0.1` only.
//!
//! Middleware chain, outer to inner: panic recovery → security headers →
//! request tracing → request-id → per-IP rate limiting → optional bearer
//! auth (constant-time) with IP allow-list → 1 MiB body cap.

pub mod chat;
pub mod middleware;
pub mod ops;
pub mod rate_limit;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::ResponseCache;
use crate::client::local::OllamaClient;
use crate::client::remote::OpenRouterClient;
use crate::config::Config;
use crate::routing::SessionStats;

use self::rate_limit::RateLimiter;

/// Request bodies above this are refused with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Whole-request processing deadline. Streaming bodies are not bounded by
/// this — the layer times the service call, and a stream's lifetime belongs
/// to its consumer.
pub const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Shared gateway state, injected into every handler.
pub struct ServerState {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: RwLock<Arc<Config>>,
    pub local: OllamaClient,
    pub remote: Option<OpenRouterClient>,
    pub cache: Arc<ResponseCache>,
    pub stats: Arc<SessionStats>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Resolved bearer token; `None` disables client auth.
    pub auth_token: Option<String>,
    /// Parsed IP allow-list; empty disables the check.
    pub allowed_ips: Vec<IpAddr>,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let local = OllamaClient::new(&config.local.base_url)
            .map_err(|e| anyhow::anyhow!("local.base_url invalid: {e}"))?;

        let remote = config.remote.api_key().map(|key| {
            let mut client = OpenRouterClient::new(key)
                .with_base_url(&config.remote.base_url)
                .with_model(&config.remote.model)
                .with_timeout(std::time::Duration::from_millis(config.remote.timeout_ms))
                .with_max_retries(config.remote.max_retries);
            if let Some(url) = &config.remote.site_url {
                client = client.with_site_url(url);
            }
            if let Some(name) = &config.remote.site_name {
                client = client.with_site_name(name);
            }
            client
        });

        let rate_limiter = config
            .gateway
            .rate_limit_rpm
            .filter(|&rpm| rpm > 0)
            .map(|rpm| Arc::new(RateLimiter::new(rpm)));

        let auth_token = config.gateway.auth_token();
        let allowed_ips = config
            .gateway
            .allowed_ips
            .iter()
            .filter_map(|raw| raw.parse().ok())
            .collect();

        let cache = Arc::new(ResponseCache::new(config.cache.capacity));

        Ok(Self {
            config_lock: RwLock::new(Arc::new(config)),
            local,
            remote,
            cache,
            stats: Arc::new(SessionStats::new()),
            rate_limiter,
            auth_token,
            allowed_ips,
            started_at: Instant::now(),
        })
    }

    /// Snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replace the live config (hot-reload task only). Listener
    /// and client wiring are startup-time; this swaps the routing knobs.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }
}

/// Build the gateway router with the full middleware chain.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(chat::list_models))
        .route("/health", get(ops::health))
        .route("/stats", get(ops::stats))
        .route("/cache/stats", get(ops::cache_stats))
        .route("/cache/clear", post(ops::cache_clear))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::client_auth,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
