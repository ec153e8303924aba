//! Request middleware: security headers, bearer auth, IP allow-list.
//!
//! The auth comparison is constant-time (`subtle`); an attacker probing the
//! token byte-by-byte learns nothing from response timing. The IP
//! allow-list runs before auth so a blocked address cannot even reach the
//! token check.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::ServerState;

/// Attach the standard security headers to every response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

/// Tag every request/response pair with an id for log correlation.
pub async fn request_id(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", request_id = %id);
    let mut response = tracing::Instrument::instrument(next.run(req), span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Optional bearer auth + IP allow-list. Both no-op when unconfigured.
pub async fn client_auth(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Response {
    // IP allow-list first.
    if !state.allowed_ips.is_empty() {
        let ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0.ip())
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        if !state.allowed_ips.contains(&ip) {
            return (
                StatusCode::FORBIDDEN,
                axum::Json(serde_json::json!({
                    "error": {
                        "message": "client address not allowed",
                        "type": "invalid_request_error",
                        "code": "forbidden",
                    }
                })),
            )
                .into_response();
        }
    }

    if let Some(expected) = &state.auth_token {
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let ok = presented
            .map(|token| token.as_bytes().ct_eq(expected.as_bytes()).into())
            .unwrap_or(false);
        if !ok {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer realm=\"tierguard\"")],
                axum::Json(serde_json::json!({
                    "error": {
                        "message": "valid API token required",
                        "type": "invalid_request_error",
                        "code": "auth_failed",
                    }
                })),
            )
                .into_response();
        }
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get, Router};
    use tower::ServiceExt;

    use crate::api::test_support::state_with;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn app_with_auth(token: Option<&str>, allowed: Vec<IpAddr>) -> Router {
        let mut state = state_with(crate::config::Config::default());
        state.auth_token = token.map(str::to_string);
        state.allowed_ips = allowed;
        let state = Arc::new(state);
        Router::new()
            .route("/", get(ok_handler))
            .layer(middleware::from_fn_with_state(state.clone(), client_auth))
            .layer(middleware::from_fn(security_headers))
            .layer(middleware::from_fn(request_id))
            .with_state(state)
    }

    #[tokio::test]
    async fn security_headers_are_always_present() {
        let app = app_with_auth(None, vec![]);
        let resp = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
        assert_eq!(resp.headers()["x-frame-options"], "DENY");
        assert!(resp.headers().contains_key("content-security-policy"));
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn no_auth_configured_passes_through() {
        let app = app_with_auth(None, vec![]);
        let resp = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_or_missing_token_is_unauthorized() {
        let app = app_with_auth(Some("right-token"), vec![]);
        let resp = app
            .clone()
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                HttpRequest::get("/")
                    .header("authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_token_is_accepted() {
        let app = app_with_auth(Some("right-token"), vec![]);
        let resp = app
            .oneshot(
                HttpRequest::get("/")
                    .header("authorization", "Bearer right-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ip_allow_list_blocks_unlisted_addresses() {
        // Without ConnectInfo the middleware sees 127.0.0.1.
        let app = app_with_auth(None, vec![IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1))]);
        let resp = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let app = app_with_auth(None, vec![IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)]);
        let resp = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
