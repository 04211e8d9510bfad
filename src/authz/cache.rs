use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::credentials::KeyId;
use crate::glob::Pattern;
use crate::models::token::Token;

/// A token ready for evaluation, with its patterns compiled once.
#[derive(Debug)]
pub struct ActiveToken {
    pub token: Token,
    pub host: Option<Pattern>,
    pub path: Option<Pattern>,
}

impl ActiveToken {
    /// A pattern that fails to compile is kept as `None` and never matches.
    pub fn new(token: Token) -> Self {
        let host = Pattern::compile(&token.host).ok();
        let path = Pattern::compile(&token.path).ok();
        if host.is_none() || path.is_none() {
            tracing::warn!(
                token_id = token.id,
                hint = %token.key_id.hint(),
                "stored host/path pattern does not compile; token will deny"
            );
        }
        Self { token, host, path }
    }
}

struct CacheEntry {
    token: Arc<ActiveToken>,
    expires_at: Instant,
}

/// keyID → token cache used on the authorization path.
///
/// Entries expire after `ttl` and are evicted lazily on read, or in bulk by
/// `evict_expired()`. A zero ttl disables caching entirely.
pub struct KeyCache {
    ttl: Duration,
    entries: DashMap<KeyId, CacheEntry>,
    // bumped on every invalidation; a fill started before it is discarded
    epoch: AtomicU64,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, key_id: &KeyId) -> Option<Arc<ActiveToken>> {
        let entry = self.entries.get(key_id)?;
        if Instant::now() < entry.expires_at {
            return Some(entry.token.clone());
        }
        // expired: drop the ref before removing
        drop(entry);
        self.entries
            .remove_if(key_id, |_, entry| Instant::now() >= entry.expires_at);
        None
    }

    /// Snapshot to pass to `fill` once the store lookup completes.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Insert `token` unless an invalidation happened since `epoch` was read.
    pub fn fill(&self, epoch: u64, token: Arc<ActiveToken>) {
        if !self.is_enabled() {
            return;
        }
        let key_id = token.token.key_id;
        self.entries.insert(
            key_id,
            CacheEntry {
                token,
                expires_at: Instant::now() + self.ttl,
            },
        );
        if self.epoch() != epoch {
            self.entries.remove(&key_id);
        }
    }

    pub fn invalidate(&self, key_id: &KeyId) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.entries.remove(key_id);
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
