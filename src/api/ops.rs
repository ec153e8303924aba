//! Operational endpoints: `/health`, `/stats`, `/cache/stats`,
//! `/cache/clear`.
//!
//! These expose aggregate state only — no backend URLs, no model tags from
//! config, no credential material in any form.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::ServerState;

/// GET /health
pub async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let cancel = CancellationToken::new();
    let local_running = state.local.check_running(&cancel).await;
    let cache_stats = state.cache.stats().await;
    let config = state.config();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "ollama_status": if local_running { "running" } else { "unreachable" },
        "cloud_status": if state.remote.is_some() { "configured" } else { "not_configured" },
        "cache_enabled": config.cache.enabled,
        "cache_entries": cache_stats.entries,
        "cache_hit_rate": cache_stats.hit_rate,
        "mode": crate::offline::status_badge(),
    }))
}

/// GET /stats — session accounting snapshot.
pub async fn stats(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

/// GET /cache/stats
pub async fn cache_stats(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.cache.stats().await)
}

/// POST /cache/clear
pub async fn cache_clear(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let cleared = state.cache.clear().await;
    tracing::info!(cleared, "response cache cleared");
    Json(json!({"cleared": cleared}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::api::test_support::state_with_backends;
    use crate::config::Config;
    use crate::routing::Tier;

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_daemon_and_cloud_state() {
        let local = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&local)
            .await;

        let state = Arc::new(state_with_backends(Config::default(), &local.uri(), None));
        let app = crate::api::router(state);

        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["ollama_status"], "running");
        assert_eq!(body["cloud_status"], "not_configured");
        assert_eq!(body["cache_enabled"], true);
        assert!(body["version"].as_str().is_some());
    }

    #[tokio::test]
    async fn health_never_leaks_backend_urls() {
        let local = MockServer::start().await;
        let state = Arc::new(state_with_backends(Config::default(), &local.uri(), None));
        let app = crate::api::router(state);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(
            !text.contains(&local.uri()),
            "backend URL must not appear in /health"
        );
    }

    #[tokio::test]
    async fn stats_surface_session_counters() {
        let local = MockServer::start().await;
        let state = Arc::new(state_with_backends(Config::default(), &local.uri(), None));
        state.stats.record(Tier::Local, 10, 30, false);
        state.stats.record(Tier::Cache, 0, 0, true);

        let app = crate::api::router(Arc::clone(&state));
        let (status, body) = get_json(app, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_queries"], 2);
        assert_eq!(body["cache_hits"], 1);
        assert_eq!(body["local_queries"], 1);
    }

    #[tokio::test]
    async fn cache_stats_and_clear_round_trip() {
        let local = MockServer::start().await;
        let state = Arc::new(state_with_backends(Config::default(), &local.uri(), None));
        state.cache.put("q", "r").await;

        let app = crate::api::router(Arc::clone(&state));
        let (_, body) = get_json(app.clone(), "/cache/stats").await;
        assert_eq!(body["entries"], 1);

        let resp = app
            .clone()
            .oneshot(Request::post("/cache/clear").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["cleared"], 1);

        let (_, body) = get_json(app, "/cache/stats").await;
        assert_eq!(body["entries"], 0);
    }
}
