//! Admin-facing token operations.
//!
//! `TokenService` validates input, bounds every store call with a timeout,
//! retries transient faults and keeps the key cache coherent with
//! mutations. Callers only ever see `NotFound`, a validation failure or a
//! generic `Unavailable`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::authz::KeyCache;
use crate::credentials::{self, Credential, KeyId, Secret};
use crate::models::token::{ConfigPatch, NewToken, Token, TokenId};
use crate::store::{with_timeout, SharedStore, StoreError};
use crate::validation::{self, ValidationError};

/// Fresh keys tried when a minted keyID is already taken.
pub const MINT_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("token not found")]
    NotFound,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("service unavailable")]
    Unavailable,
}

/// A token together with its newly issued credential.
#[derive(Debug, Clone, Serialize)]
pub struct Issued {
    #[serde(skip)]
    pub token: Token,
    #[serde(flatten)]
    pub credential: Credential,
}

impl Issued {
    fn new(token: Token, secret: &Secret) -> Self {
        let credential = Credential::new(token.id, secret);
        Self { token, credential }
    }
}

#[derive(Clone)]
pub struct TokenService {
    store: SharedStore,
    cache: Arc<KeyCache>,
    store_timeout: Duration,
    store_retries: u32,
}

impl TokenService {
    pub fn new(
        store: SharedStore,
        cache: Arc<KeyCache>,
        store_timeout: Duration,
        store_retries: u32,
    ) -> Self {
        Self {
            store,
            cache,
            store_timeout,
            store_retries,
        }
    }

    pub async fn create(&self, user: &str, config: ConfigPatch) -> Result<Issued, ServiceError> {
        let config = validation::normalize(config)?.into_config();

        for attempt in 1..=MINT_ATTEMPTS {
            let (secret, key) = credentials::mint();
            let key_id = key.key_id;
            let new = NewToken {
                user: user.to_string(),
                config: config.clone(),
                key,
            };
            let created = match self.call(|| self.store.create(new.clone())).await {
                // a timed-out attempt may have committed before the retry
                Err(StoreError::Conflict) => self.already_created(user, &key_id, &secret).await,
                other => other,
            };
            match created {
                Ok(token) => {
                    tracing::info!(user, token_id = token.id, hint = %token.hint(), "token created");
                    return Ok(Issued::new(token, &secret));
                }
                Err(StoreError::Conflict) => {
                    tracing::warn!(attempt, "key id collision on create, minting again");
                }
                Err(e) => return Err(surface("create", e)),
            }
        }
        Err(surface("create", StoreError::Conflict))
    }

    /// The token holding `key_id` if it was inserted by this very call, i.e.
    /// it belongs to `user` and verifies `secret`. Anything else is a real
    /// keyID collision.
    async fn already_created(
        &self,
        user: &str,
        key_id: &KeyId,
        secret: &Secret,
    ) -> Result<Token, StoreError> {
        match self.call(|| self.store.find_by_key_id(key_id)).await {
            Ok(token) if token.user == user && token.digest.verify(secret) => Ok(token),
            Ok(_) | Err(StoreError::NotFound) => Err(StoreError::Conflict),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, user: &str) -> Result<Vec<Token>, ServiceError> {
        self.call(|| self.store.list(user))
            .await
            .map_err(|e| surface("list", e))
    }

    pub async fn get(&self, user: &str, id: TokenId) -> Result<Token, ServiceError> {
        self.call(|| self.store.get(user, id))
            .await
            .map_err(|e| surface("get", e))
    }

    /// Apply a partial update. An empty patch returns the token unchanged.
    pub async fn update(
        &self,
        user: &str,
        id: TokenId,
        patch: ConfigPatch,
    ) -> Result<Token, ServiceError> {
        let patch = validation::normalize(patch)?;
        if patch.is_empty() {
            return self.get(user, id).await;
        }

        let token = self
            .call(|| self.store.update(user, id, patch.clone()))
            .await
            .map_err(|e| surface("update", e))?;
        self.cache.invalidate(&token.key_id);
        tracing::info!(user, token_id = id, "token updated");
        Ok(token)
    }

    /// Replace the credential. The previous secret stops working at once.
    pub async fn rotate(&self, user: &str, id: TokenId) -> Result<Issued, ServiceError> {
        let current = self.get(user, id).await?;

        for attempt in 1..=MINT_ATTEMPTS {
            let (secret, key) = credentials::rotate(&current);
            match self.call(|| self.store.rotate(user, id, key.clone())).await {
                Ok(rotated) => {
                    self.cache.invalidate(&rotated.previous_key_id);
                    self.cache.invalidate(&rotated.token.key_id);
                    tracing::info!(
                        user,
                        token_id = id,
                        previous = %rotated.previous_key_id.hint(),
                        hint = %rotated.token.hint(),
                        "token rotated"
                    );
                    return Ok(Issued::new(rotated.token, &secret));
                }
                Err(StoreError::Conflict) => {
                    tracing::warn!(attempt, "key id collision on rotate, minting again");
                }
                Err(e) => return Err(surface("rotate", e)),
            }
        }
        Err(surface("rotate", StoreError::Conflict))
    }

    pub async fn delete(&self, user: &str, id: TokenId) -> Result<(), ServiceError> {
        let removed = self
            .call(|| self.store.delete(user, id))
            .await
            .map_err(|e| surface("delete", e))?;
        self.cache.invalidate(&removed.key_id);
        tracing::info!(user, token_id = id, hint = %removed.hint(), "token deleted");
        Ok(())
    }

    /// Run a store call under the timeout, retrying timeouts.
    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retries = 0;
        loop {
            match with_timeout(self.store_timeout, op()).await {
                Err(StoreError::Timeout) if retries < self.store_retries => {
                    retries += 1;
                    tracing::debug!(retries, "store call timed out, retrying");
                }
                result => return result,
            }
        }
    }
}

fn surface(op: &'static str, err: StoreError) -> ServiceError {
    match err {
        StoreError::NotFound => ServiceError::NotFound,
        other => {
            tracing::error!(op, "token store failure: {}", other);
            ServiceError::Unavailable
        }
    }
}
