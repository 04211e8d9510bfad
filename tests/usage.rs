//! Usage accounting pipeline tests.
//!
//! These tests verify:
//! 1. Concurrent `record_usage` calls never lose increments
//! 2. Hits from the authorizer reach the store through the worker
//! 3. A failed flush keeps its aggregate for the next attempt

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tokengate::authz::{Authorizer, KeyCache};
use tokengate::credentials::{KeyId, KeyMaterial};
use tokengate::jobs::usage_sync;
use tokengate::models::token::{ConfigPatch, NewToken, Token, TokenId};
use tokengate::service::TokenService;
use tokengate::store::memory::MemoryStore;
use tokengate::store::{Rotated, SharedStore, StoreError, TokenStore};
use tokengate::usage::{Hit, UsageBatch, UsageRecorder};

#[tokio::test]
async fn test_concurrent_record_usage_counts_every_hit() {
    let store = Arc::new(MemoryStore::new());
    let shared: SharedStore = store.clone();
    let tokens = TokenService::new(
        shared,
        Arc::new(KeyCache::new(Duration::ZERO)),
        Duration::from_secs(1),
        0,
    );
    let issued = tokens.create("alice", ConfigPatch::default()).await.unwrap();
    let id = issued.token.id;

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    store.record_usage(id, 1, Utc::now()).await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let token = tokens.get("alice", id).await.unwrap();
    assert_eq!(token.requests, 32 * 100);
}

#[tokio::test]
async fn test_authorized_hits_reach_store_after_shutdown_flush() {
    let store = Arc::new(MemoryStore::new());
    let shared: SharedStore = store.clone();
    let cache = Arc::new(KeyCache::new(Duration::from_secs(15)));
    let tokens = TokenService::new(shared.clone(), cache.clone(), Duration::from_secs(1), 0);
    let issued = tokens.create("alice", ConfigPatch::default()).await.unwrap();

    let (usage, rx) = UsageRecorder::channel(1024);
    // long interval: only the final flush on close writes anything
    let worker = usage_sync::spawn(
        shared.clone(),
        rx,
        Duration::from_secs(3600),
        Duration::from_secs(1),
    );
    let authorizer = Authorizer::new(shared, cache, usage, Duration::from_secs(1));

    for _ in 0..10 {
        let decision = authorizer
            .authorize(&issued.credential.key, "", "")
            .await
            .unwrap();
        assert!(decision.is_allow());
    }
    drop(authorizer);
    worker.await.unwrap();

    let token = tokens.get("alice", issued.token.id).await.unwrap();
    assert_eq!(token.requests, 10);
    assert!(token.last_access_at.is_some());
}

#[tokio::test]
async fn test_periodic_flush() {
    let store = Arc::new(MemoryStore::new());
    let shared: SharedStore = store.clone();
    let tokens = TokenService::new(
        shared.clone(),
        Arc::new(KeyCache::new(Duration::ZERO)),
        Duration::from_secs(1),
        0,
    );
    let issued = tokens.create("alice", ConfigPatch::default()).await.unwrap();

    let (usage, rx) = UsageRecorder::channel(16);
    let worker = usage_sync::spawn(shared, rx, Duration::from_millis(20), Duration::from_secs(1));
    usage.hit(issued.token.id);
    usage.hit(issued.token.id);

    let mut requests = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        requests = tokens.get("alice", issued.token.id).await.unwrap().requests;
        if requests == 2 {
            break;
        }
    }
    assert_eq!(requests, 2);

    drop(usage);
    worker.await.unwrap();
}

/// Memory store whose `record_usage` fails a fixed number of times.
struct FlakyUsage {
    inner: MemoryStore,
    failures_left: AtomicUsize,
}

#[async_trait]
impl TokenStore for FlakyUsage {
    async fn create(&self, token: NewToken) -> Result<Token, StoreError> {
        self.inner.create(token).await
    }
    async fn get(&self, user: &str, id: TokenId) -> Result<Token, StoreError> {
        self.inner.get(user, id).await
    }
    async fn list(&self, user: &str) -> Result<Vec<Token>, StoreError> {
        self.inner.list(user).await
    }
    async fn update(&self, user: &str, id: TokenId, patch: ConfigPatch) -> Result<Token, StoreError> {
        self.inner.update(user, id, patch).await
    }
    async fn rotate(&self, user: &str, id: TokenId, key: KeyMaterial) -> Result<Rotated, StoreError> {
        self.inner.rotate(user, id, key).await
    }
    async fn delete(&self, user: &str, id: TokenId) -> Result<Token, StoreError> {
        self.inner.delete(user, id).await
    }
    async fn find_by_key_id(&self, key_id: &KeyId) -> Result<Token, StoreError> {
        self.inner.find_by_key_id(key_id).await
    }
    async fn record_usage(&self, id: TokenId, hits: u64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Timeout);
        }
        self.inner.record_usage(id, hits, at).await
    }
}

#[tokio::test]
async fn test_failed_flush_keeps_aggregate() {
    let store = FlakyUsage {
        inner: MemoryStore::new(),
        failures_left: AtomicUsize::new(1),
    };
    let (_, key) = tokengate::credentials::mint();
    let token = store
        .create(NewToken {
            user: "alice".into(),
            config: Default::default(),
            key,
        })
        .await
        .unwrap();

    let mut batch = UsageBatch::default();
    for _ in 0..3 {
        batch.add(Hit {
            token_id: token.id,
            at: Utc::now(),
        });
    }

    assert_eq!(batch.flush(&store, Duration::from_secs(1)).await, 0);
    assert_eq!(batch.hits(token.id), 3);

    assert_eq!(batch.flush(&store, Duration::from_secs(1)).await, 1);
    assert!(batch.is_empty());
    assert_eq!(store.get("alice", token.id).await.unwrap().requests, 3);
}
