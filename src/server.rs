//! Application state and the two HTTP surfaces built on it.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::authz::{Authorizer, KeyCache};
use crate::config::Config;
use crate::forward_auth;
use crate::service::TokenService;
use crate::store::SharedStore;
use crate::usage::UsageRecorder;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub tokens: TokenService,
    pub authorizer: Authorizer,
    pub cache: Arc<KeyCache>,
}

impl AppState {
    pub fn new(config: Config, store: SharedStore, usage: UsageRecorder) -> Self {
        let cache = Arc::new(KeyCache::new(config.cache_ttl));
        let tokens = TokenService::new(
            store.clone(),
            cache.clone(),
            config.store_timeout,
            config.store_retries,
        );
        let authorizer = Authorizer::new(store, cache.clone(), usage, config.store_timeout);
        Self {
            config,
            tokens,
            authorizer,
            cache,
        }
    }
}

/// Admin listener: JSON API under `/api/v1` plus health checks.
pub fn admin_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .nest("/api/v1", api::api_router(state.clone()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware))
}

/// Forward-auth listener.
pub fn auth_app(state: Arc<AppState>) -> Router {
    forward_auth::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Middleware: echoes the caller's X-Request-Id, or assigns a new one.
pub async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());
    let mut resp = next.run(req).await;
    if let Some(val) = req_id {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: injects security headers into every admin response.
pub async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    // responses may carry one-time secrets
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");

    resp
}
