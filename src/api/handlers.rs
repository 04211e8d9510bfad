use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    http::StatusCode,
    Extension, Json,
};

use super::Identity;
use crate::errors::AppError;
use crate::models::token::{ConfigPatch, Token, TokenId};
use crate::server::AppState;
use crate::service::Issued;

fn token_id(path: Result<Path<TokenId>, PathRejection>) -> Result<TokenId, AppError> {
    // a non-numeric id can never name a token
    path.map(|Path(id)| id).map_err(|_| AppError::TokenNotFound)
}

fn body(json: Result<Json<ConfigPatch>, JsonRejection>) -> Result<ConfigPatch, AppError> {
    json.map(|Json(patch)| patch)
        .map_err(|e| AppError::InvalidRequest(e.body_text()))
}

pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(Identity(user)): Extension<Identity>,
) -> Result<Json<Vec<Token>>, AppError> {
    let tokens = state.tokens.list(&user).await?;
    Ok(Json(tokens))
}

pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(Identity(user)): Extension<Identity>,
    payload: Result<Json<ConfigPatch>, JsonRejection>,
) -> Result<(StatusCode, Json<Issued>), AppError> {
    let config = body(payload)?;
    let issued = state.tokens.create(&user, config).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Extension(Identity(user)): Extension<Identity>,
    id: Result<Path<TokenId>, PathRejection>,
) -> Result<Json<Token>, AppError> {
    let token = state.tokens.get(&user, token_id(id)?).await?;
    Ok(Json(token))
}

pub async fn rotate_token(
    State(state): State<Arc<AppState>>,
    Extension(Identity(user)): Extension<Identity>,
    id: Result<Path<TokenId>, PathRejection>,
) -> Result<Json<Issued>, AppError> {
    let issued = state.tokens.rotate(&user, token_id(id)?).await?;
    Ok(Json(issued))
}

pub async fn update_token(
    State(state): State<Arc<AppState>>,
    Extension(Identity(user)): Extension<Identity>,
    id: Result<Path<TokenId>, PathRejection>,
    payload: Result<Json<ConfigPatch>, JsonRejection>,
) -> Result<Json<Token>, AppError> {
    let id = token_id(id)?;
    let patch = body(payload)?;
    let token = state.tokens.update(&user, id, patch).await?;
    Ok(Json(token))
}

pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(Identity(user)): Extension<Identity>,
    id: Result<Path<TokenId>, PathRejection>,
) -> Result<StatusCode, AppError> {
    state.tokens.delete(&user, token_id(id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
