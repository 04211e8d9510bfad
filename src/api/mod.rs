pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};

use crate::errors::AppError;
use crate::server::AppState;

/// The acting user of an admin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

/// Admin API routes, mounted under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tokens",
            get(handlers::list_tokens).post(handlers::create_token),
        )
        .route(
            "/tokens/:id",
            get(handlers::get_token)
                .post(handlers::rotate_token)
                .patch(handlers::update_token)
                .delete(handlers::delete_token),
        )
        .layer(middleware::from_fn_with_state(state, user_identity))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Resolve the acting user from the configured identity header, or the
/// impersonated user when one is configured.
async fn user_identity(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = match &state.config.debug_impersonate {
        Some(user) => user.clone(),
        None => req
            .headers()
            .get(state.config.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .ok_or_else(|| {
                tracing::warn!(header = %state.config.user_header, "admin API: missing user header");
                AppError::Unauthenticated
            })?,
    };

    req.extensions_mut().insert(Identity(user));
    Ok(next.run(req).await)
}
