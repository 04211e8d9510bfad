//! Token persistence.
//!
//! [`TokenStore`] is the contract the admin service and the authorizer rely
//! on. Two backends implement it: [`memory::MemoryStore`] and
//! [`postgres::PgStore`].

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::credentials::{CredentialError, KeyId, KeyMaterial};
use crate::models::token::{ConfigPatch, NewToken, Token, TokenId};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown id, or a token owned by someone else.
    #[error("token not found")]
    NotFound,

    /// keyID already taken by another token.
    #[error("key id conflict")]
    Conflict,

    #[error("store operation timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt token record: {0}")]
    Corrupt(#[from] CredentialError),
}

/// A token after credential rotation, with the keyID it replaced.
#[derive(Debug, Clone)]
pub struct Rotated {
    pub token: Token,
    pub previous_key_id: KeyId,
}

/// Durable token registry.
///
/// Every user-facing operation is scoped by `user`; a token owned by someone
/// else is reported as [`StoreError::NotFound`]. `find_by_key_id` and
/// `record_usage` are unscoped and reserved for the authorization path.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a new token. Fails with `Conflict` if its keyID is taken.
    async fn create(&self, token: NewToken) -> Result<Token, StoreError>;

    async fn get(&self, user: &str, id: TokenId) -> Result<Token, StoreError>;

    /// Tokens owned by `user`, newest first.
    async fn list(&self, user: &str) -> Result<Vec<Token>, StoreError>;

    /// Merge `patch` into the token; unset fields are left untouched.
    async fn update(&self, user: &str, id: TokenId, patch: ConfigPatch)
        -> Result<Token, StoreError>;

    /// Swap the credential in one step: the old secret stops validating at
    /// the same moment the new one starts.
    async fn rotate(&self, user: &str, id: TokenId, key: KeyMaterial)
        -> Result<Rotated, StoreError>;

    /// Remove the token immediately, returning the removed record.
    async fn delete(&self, user: &str, id: TokenId) -> Result<Token, StoreError>;

    async fn find_by_key_id(&self, key_id: &KeyId) -> Result<Token, StoreError>;

    /// `updated_at` of the token currently holding `key_id`. Lets a cached
    /// snapshot be checked against changes made by other processes.
    async fn key_revision(&self, key_id: &KeyId) -> Result<DateTime<Utc>, StoreError> {
        self.find_by_key_id(key_id).await.map(|token| token.updated_at)
    }

    /// Add `hits` to the usage counter and advance the last access time.
    /// Unknown ids are ignored.
    async fn record_usage(
        &self,
        id: TokenId,
        hits: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn TokenStore>;

/// Bound a store call; an elapsed deadline becomes [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}

/// Open the backend named by `database_url`: `memory://` or a Postgres URL.
pub async fn open(database_url: &str, max_connections: u32) -> anyhow::Result<SharedStore> {
    if database_url.starts_with("memory://") {
        tracing::warn!("using in-memory token store; tokens are lost on restart");
        return Ok(Arc::new(memory::MemoryStore::new()));
    }

    let store = postgres::PgStore::connect(database_url, max_connections).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}
