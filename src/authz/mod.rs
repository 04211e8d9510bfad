//! Request authorization.
//!
//! [`Authorizer::authorize`] resolves a presented secret to a token through
//! the [`KeyCache`] (falling back to the store), verifies the full secret in
//! constant time and checks the request host and path against the token's
//! patterns. It takes no locks of its own and is safe to call from any
//! number of tasks.
//!
//! A cache hit is only trusted after the store confirms the keyID still
//! belongs to a token with the same `updated_at`. The cache saves the full
//! row fetch and pattern compilation, never the existence check.

pub mod cache;

use std::sync::Arc;
use std::time::Duration;

use crate::credentials::{KeyId, Secret};
use crate::glob::normalize_host;
use crate::models::token::{Header, TokenId};
use crate::store::{with_timeout, SharedStore, StoreError};
use crate::usage::UsageRecorder;

pub use cache::{ActiveToken, KeyCache};

/// Why a request was denied. Internal detail: callers without an
/// authenticated context should only see [`DenyReason::public`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UnknownKey,
    InvalidSecret,
    HostPathMismatch,
}

impl DenyReason {
    /// Label safe to expose: unknown keys and bad secrets look the same.
    pub fn public(&self) -> &'static str {
        match self {
            DenyReason::UnknownKey | DenyReason::InvalidSecret => "invalid_credential",
            DenyReason::HostPathMismatch => "host_path_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub token_id: TokenId,
    pub user: String,
    pub key_id: KeyId,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Grant),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

#[derive(Clone)]
pub struct Authorizer {
    store: SharedStore,
    cache: Arc<KeyCache>,
    usage: UsageRecorder,
    store_timeout: Duration,
}

impl Authorizer {
    pub fn new(
        store: SharedStore,
        cache: Arc<KeyCache>,
        usage: UsageRecorder,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            usage,
            store_timeout,
        }
    }

    /// Evaluate one request. Only store faults are errors; every negative
    /// outcome is a `Decision::Deny`.
    pub async fn authorize(
        &self,
        presented: &str,
        host: &str,
        path: &str,
    ) -> Result<Decision, StoreError> {
        let Ok(secret) = Secret::parse(presented) else {
            return Ok(Decision::Deny(DenyReason::UnknownKey));
        };
        let key_id = secret.key_id();

        let Some(active) = self.resolve(&key_id).await? else {
            return Ok(Decision::Deny(DenyReason::UnknownKey));
        };
        let token = &active.token;

        if !token.digest.verify(&secret) {
            return Ok(Decision::Deny(DenyReason::InvalidSecret));
        }

        let host = normalize_host(host);
        let host_ok = active.host.as_ref().is_some_and(|p| p.is_match(&host));
        let path_ok = active.path.as_ref().is_some_and(|p| p.is_match(path));
        if !(host_ok && path_ok) {
            return Ok(Decision::Deny(DenyReason::HostPathMismatch));
        }

        self.usage.hit(token.id);

        Ok(Decision::Allow(Grant {
            token_id: token.id,
            user: token.user.clone(),
            key_id,
            headers: token.headers.clone(),
        }))
    }

    async fn resolve(&self, key_id: &KeyId) -> Result<Option<Arc<ActiveToken>>, StoreError> {
        if let Some(hit) = self.cache.get(key_id) {
            // the token may have been rotated, edited or deleted by another
            // process sharing the store
            match with_timeout(self.store_timeout, self.store.key_revision(key_id)).await {
                Ok(revision) if revision == hit.token.updated_at => return Ok(Some(hit)),
                Ok(_) => self.cache.invalidate(key_id),
                Err(StoreError::NotFound) => {
                    self.cache.invalidate(key_id);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        let epoch = self.cache.epoch();
        let token = match with_timeout(self.store_timeout, self.store.find_by_key_id(key_id)).await
        {
            Ok(token) => token,
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let active = Arc::new(ActiveToken::new(token));
        self.cache.fill(epoch, active.clone());
        Ok(Some(active))
    }
}
