//! In-process token arena.
//!
//! Records live in a `DashMap` keyed by id with a secondary keyID → id
//! index. Structural changes hold the shard entry of the affected id; usage
//! counters are atomics updated under a read guard, so hits never contend
//! with each other.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::credentials::{KeyId, KeyMaterial};
use crate::models::token::{ConfigPatch, NewToken, Token, TokenId};
use crate::store::{Rotated, StoreError, TokenStore};

/// `last_access` sentinel for "never used".
const NEVER: i64 = i64::MIN;

struct Slot {
    record: Token,
    requests: AtomicI64,
    last_access_us: AtomicI64,
}

impl Slot {
    fn snapshot(&self) -> Token {
        let mut token = self.record.clone();
        token.requests = self.requests.load(Ordering::Relaxed);
        token.last_access_at = match self.last_access_us.load(Ordering::Relaxed) {
            NEVER => None,
            micros => DateTime::from_timestamp_micros(micros),
        };
        token
    }

    fn touch(&self, hits: u64, at: DateTime<Utc>) {
        let hits = i64::try_from(hits).unwrap_or(i64::MAX);
        self.requests.fetch_add(hits, Ordering::Relaxed);
        self.last_access_us
            .fetch_max(at.timestamp_micros(), Ordering::Relaxed);
    }
}

pub struct MemoryStore {
    next_id: AtomicI64,
    tokens: DashMap<TokenId, Slot>,
    by_key: DashMap<KeyId, TokenId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            tokens: DashMap::new(),
            by_key: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Claim `key_id` for `id` in the index.
    fn claim(&self, key_id: KeyId, id: TokenId) -> Result<(), StoreError> {
        match self.by_key.entry(key_id) {
            MapEntry::Occupied(_) => Err(StoreError::Conflict),
            MapEntry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    fn release(&self, key_id: &KeyId, id: TokenId) {
        self.by_key.remove_if(key_id, |_, owner| *owner == id);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn create(&self, token: NewToken) -> Result<Token, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.claim(token.key.key_id, id)?;

        let now = Utc::now();
        let record = Token {
            id,
            created_at: now,
            updated_at: now,
            last_access_at: None,
            key_id: token.key.key_id,
            user: token.user,
            label: token.config.label,
            host: token.config.host,
            path: token.config.path,
            headers: token.config.headers,
            requests: 0,
            digest: token.key.digest,
        };
        let slot = Slot {
            record,
            requests: AtomicI64::new(0),
            last_access_us: AtomicI64::new(NEVER),
        };
        let snapshot = slot.snapshot();
        self.tokens.insert(id, slot);
        Ok(snapshot)
    }

    async fn get(&self, user: &str, id: TokenId) -> Result<Token, StoreError> {
        self.tokens
            .get(&id)
            .filter(|slot| slot.record.user == user)
            .map(|slot| slot.snapshot())
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self, user: &str) -> Result<Vec<Token>, StoreError> {
        let mut tokens: Vec<Token> = self
            .tokens
            .iter()
            .filter(|slot| slot.record.user == user)
            .map(|slot| slot.snapshot())
            .collect();
        tokens.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(tokens)
    }

    async fn update(
        &self,
        user: &str,
        id: TokenId,
        patch: ConfigPatch,
    ) -> Result<Token, StoreError> {
        let mut slot = self
            .tokens
            .get_mut(&id)
            .filter(|slot| slot.record.user == user)
            .ok_or(StoreError::NotFound)?;

        let record = &mut slot.record;
        patch.label.apply_to(&mut record.label);
        patch.host.apply_to(&mut record.host);
        patch.path.apply_to(&mut record.path);
        patch.headers.apply_to(&mut record.headers);
        record.updated_at = Utc::now();

        Ok(slot.snapshot())
    }

    async fn rotate(
        &self,
        user: &str,
        id: TokenId,
        key: KeyMaterial,
    ) -> Result<Rotated, StoreError> {
        let (token, previous_key_id) = {
            let mut slot = self
                .tokens
                .get_mut(&id)
                .filter(|slot| slot.record.user == user)
                .ok_or(StoreError::NotFound)?;

            self.claim(key.key_id, id)?;

            let record = &mut slot.record;
            let previous = record.key_id;
            record.key_id = key.key_id;
            record.digest = key.digest;
            record.updated_at = Utc::now();
            (slot.snapshot(), previous)
        };

        // lookups through the stale index entry already miss: the record
        // no longer carries this keyID
        self.release(&previous_key_id, id);

        Ok(Rotated {
            token,
            previous_key_id,
        })
    }

    async fn delete(&self, user: &str, id: TokenId) -> Result<Token, StoreError> {
        let (_, slot) = self
            .tokens
            .remove_if(&id, |_, slot| slot.record.user == user)
            .ok_or(StoreError::NotFound)?;
        self.release(&slot.record.key_id, id);
        Ok(slot.snapshot())
    }

    async fn find_by_key_id(&self, key_id: &KeyId) -> Result<Token, StoreError> {
        let id = *self.by_key.get(key_id).ok_or(StoreError::NotFound)?;
        self.tokens
            .get(&id)
            .filter(|slot| slot.record.key_id == *key_id)
            .map(|slot| slot.snapshot())
            .ok_or(StoreError::NotFound)
    }

    async fn key_revision(&self, key_id: &KeyId) -> Result<DateTime<Utc>, StoreError> {
        let id = *self.by_key.get(key_id).ok_or(StoreError::NotFound)?;
        self.tokens
            .get(&id)
            .filter(|slot| slot.record.key_id == *key_id)
            .map(|slot| slot.record.updated_at)
            .ok_or(StoreError::NotFound)
    }

    async fn record_usage(
        &self,
        id: TokenId,
        hits: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(slot) = self.tokens.get(&id) {
            slot.touch(hits, at);
        }
        Ok(())
    }
}
