//! End-to-end authorization tests against the in-memory store.
//!
//! These tests verify:
//! 1. The allow/deny contract of the evaluator for host, path and secret
//! 2. Rotation and deletion revoke the previous secret at once
//! 3. Partial updates never clobber fields they do not name
//! 4. Store faults are errors, never silent denies or allows

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_test::{assert_err, assert_ok};

use tokengate::authz::{Authorizer, Decision, DenyReason, KeyCache};
use tokengate::credentials::{self, KeyId, KeyMaterial, Secret, KEY_SIZE};
use tokengate::models::token::{ConfigPatch, Header, NewToken, Patch, Token, TokenId};
use tokengate::service::TokenService;
use tokengate::store::memory::MemoryStore;
use tokengate::store::{Rotated, SharedStore, StoreError, TokenStore};
use tokengate::usage::UsageRecorder;

struct Harness {
    store: Arc<MemoryStore>,
    tokens: TokenService,
    authorizer: Authorizer,
}

fn harness(cache_ttl: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let shared: SharedStore = store.clone();
    let cache = Arc::new(KeyCache::new(cache_ttl));
    let (usage, _rx) = UsageRecorder::channel(64);
    Harness {
        store,
        tokens: TokenService::new(shared.clone(), cache.clone(), Duration::from_secs(1), 2),
        authorizer: Authorizer::new(shared, cache, usage, Duration::from_secs(1)),
    }
}

fn scoped(host: &str, path: &str, headers: Vec<Header>) -> ConfigPatch {
    ConfigPatch {
        host: Patch::Set(host.into()),
        path: Patch::Set(path.into()),
        headers: Patch::Set(headers),
        ..ConfigPatch::default()
    }
}

fn deny(reason: DenyReason) -> Decision {
    Decision::Deny(reason)
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let h = harness(Duration::from_secs(15));
    let issued = h
        .tokens
        .create(
            "alice",
            scoped("*.example.com", "/api/*", vec![Header::new("X-Tenant", "42")]),
        )
        .await
        .unwrap();
    let key = issued.credential.key.clone();

    match h.authorizer.authorize(&key, "a.example.com", "/api/widgets").await.unwrap() {
        Decision::Allow(grant) => {
            assert_eq!(grant.headers, vec![Header::new("X-Tenant", "42")]);
            assert_eq!(grant.user, "alice");
            assert_eq!(grant.token_id, issued.token.id);
        }
        other => panic!("expected allow, got {:?}", other),
    }

    let wrong = Secret::generate().encode();
    assert_eq!(
        h.authorizer.authorize(&wrong, "a.example.com", "/api/widgets").await.unwrap(),
        deny(DenyReason::UnknownKey)
    );
    assert_eq!(
        h.authorizer.authorize(&key, "a.example.com", "/other").await.unwrap(),
        deny(DenyReason::HostPathMismatch)
    );
    assert_eq!(
        h.authorizer.authorize(&key, "example.com", "/api/widgets").await.unwrap(),
        deny(DenyReason::HostPathMismatch)
    );
}

#[tokio::test]
async fn test_host_normalized_at_both_ends() {
    let h = harness(Duration::from_secs(15));
    let issued = h
        .tokens
        .create("alice", scoped("*.Example.COM", "", vec![]))
        .await
        .unwrap();
    assert_eq!(issued.token.host, "*.example.com");

    let decision = h
        .authorizer
        .authorize(&issued.credential.key, "API.example.com:8443", "/anything")
        .await
        .unwrap();
    assert!(decision.is_allow());
}

#[tokio::test]
async fn test_empty_patterns_match_everything() {
    let h = harness(Duration::from_secs(15));
    let issued = h.tokens.create("alice", ConfigPatch::default()).await.unwrap();

    for (host, path) in [("", ""), ("x.y", "/"), ("localhost", "/a/b/c?d")] {
        let decision = h
            .authorizer
            .authorize(&issued.credential.key, host, path)
            .await
            .unwrap();
        assert!(decision.is_allow(), "host={host:?} path={path:?}");
    }
}

#[tokio::test]
async fn test_same_key_id_wrong_payload_is_invalid_secret() {
    let h = harness(Duration::from_secs(15));
    let issued = h.tokens.create("alice", ConfigPatch::default()).await.unwrap();

    // forge a secret sharing the keyID but not the payload
    let real = Secret::parse(&issued.credential.key).unwrap();
    let mut forged = [0x5A_u8; KEY_SIZE];
    forged[..8].copy_from_slice(real.key_id().as_bytes());
    let forged = Secret::from_bytes(forged);
    assert_eq!(forged.key_id(), real.key_id());

    assert_eq!(
        h.authorizer.authorize(&forged.encode(), "", "").await.unwrap(),
        deny(DenyReason::InvalidSecret)
    );
}

#[tokio::test]
async fn test_malformed_credential_is_unknown_key() {
    let h = harness(Duration::from_secs(15));
    for presented in ["", "short", "!!!not-base64!!!"] {
        assert_eq!(
            h.authorizer.authorize(presented, "", "").await.unwrap(),
            deny(DenyReason::UnknownKey)
        );
    }
}

#[tokio::test]
async fn test_rotation_revokes_old_secret_immediately() {
    // cache on: rotation must still take effect at once on this instance
    let h = harness(Duration::from_secs(60));
    let issued = h.tokens.create("alice", ConfigPatch::default()).await.unwrap();
    let old = issued.credential.key.clone();

    // warm the cache
    assert!(h.authorizer.authorize(&old, "", "").await.unwrap().is_allow());

    let rotated = h.tokens.rotate("alice", issued.token.id).await.unwrap();
    assert_ne!(rotated.credential.key_id, issued.credential.key_id);

    assert_eq!(
        h.authorizer.authorize(&old, "", "").await.unwrap(),
        deny(DenyReason::UnknownKey)
    );
    assert!(h
        .authorizer
        .authorize(&rotated.credential.key, "", "")
        .await
        .unwrap()
        .is_allow());
}

#[tokio::test]
async fn test_delete_then_authorize_denies() {
    let h = harness(Duration::from_secs(60));
    let issued = h.tokens.create("alice", ConfigPatch::default()).await.unwrap();
    assert!(h
        .authorizer
        .authorize(&issued.credential.key, "", "")
        .await
        .unwrap()
        .is_allow());

    assert_ok!(h.tokens.delete("alice", issued.token.id).await);
    assert_eq!(
        h.authorizer.authorize(&issued.credential.key, "", "").await.unwrap(),
        deny(DenyReason::UnknownKey)
    );
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_update_takes_effect_through_cache() {
    let h = harness(Duration::from_secs(60));
    let issued = h
        .tokens
        .create("alice", scoped("a.*", "", vec![]))
        .await
        .unwrap();
    let key = issued.credential.key.clone();
    assert!(h.authorizer.authorize(&key, "a.test", "/x").await.unwrap().is_allow());

    let patch = ConfigPatch {
        path: Patch::Set("/y".into()),
        ..ConfigPatch::default()
    };
    let updated = h.tokens.update("alice", issued.token.id, patch).await.unwrap();
    assert_eq!(updated.host, "a.*");
    assert_eq!(updated.path, "/y");

    assert_eq!(
        h.authorizer.authorize(&key, "a.test", "/x").await.unwrap(),
        deny(DenyReason::HostPathMismatch)
    );
    assert!(h.authorizer.authorize(&key, "a.test", "/y").await.unwrap().is_allow());
}

/// A second service over the same store with its own cache, like the
/// `token` CLI or another gateway instance.
fn other_process(h: &Harness) -> TokenService {
    let shared: SharedStore = h.store.clone();
    TokenService::new(
        shared,
        Arc::new(KeyCache::new(Duration::ZERO)),
        Duration::from_secs(1),
        2,
    )
}

#[tokio::test]
async fn test_rotation_elsewhere_revokes_cached_secret() {
    let h = harness(Duration::from_secs(60));
    let issued = h.tokens.create("alice", ConfigPatch::default()).await.unwrap();
    let old = issued.credential.key.clone();
    assert!(h.authorizer.authorize(&old, "", "").await.unwrap().is_allow());

    let rotated = other_process(&h).rotate("alice", issued.token.id).await.unwrap();

    assert_eq!(
        h.authorizer.authorize(&old, "", "").await.unwrap(),
        deny(DenyReason::UnknownKey)
    );
    assert!(h
        .authorizer
        .authorize(&rotated.credential.key, "", "")
        .await
        .unwrap()
        .is_allow());
}

#[tokio::test]
async fn test_delete_elsewhere_revokes_cached_secret() {
    let h = harness(Duration::from_secs(60));
    let issued = h.tokens.create("alice", ConfigPatch::default()).await.unwrap();
    let key = issued.credential.key.clone();
    assert!(h.authorizer.authorize(&key, "", "").await.unwrap().is_allow());

    assert_ok!(other_process(&h).delete("alice", issued.token.id).await);

    assert_eq!(
        h.authorizer.authorize(&key, "", "").await.unwrap(),
        deny(DenyReason::UnknownKey)
    );
}

#[tokio::test]
async fn test_update_elsewhere_refreshes_cached_patterns() {
    let h = harness(Duration::from_secs(60));
    let issued = h
        .tokens
        .create("alice", scoped("", "/x", vec![]))
        .await
        .unwrap();
    let key = issued.credential.key.clone();
    assert!(h.authorizer.authorize(&key, "a.test", "/x").await.unwrap().is_allow());

    let patch = ConfigPatch {
        path: Patch::Set("/y".into()),
        ..ConfigPatch::default()
    };
    assert_ok!(other_process(&h).update("alice", issued.token.id, patch).await);

    assert_eq!(
        h.authorizer.authorize(&key, "a.test", "/x").await.unwrap(),
        deny(DenyReason::HostPathMismatch)
    );
    assert!(h.authorizer.authorize(&key, "a.test", "/y").await.unwrap().is_allow());
}

#[tokio::test]
async fn test_users_are_isolated() {
    let h = harness(Duration::from_secs(15));
    let issued = h.tokens.create("alice", ConfigPatch::default()).await.unwrap();

    assert_err!(h.tokens.get("bob", issued.token.id).await);
    assert_err!(
        h.tokens
            .update("bob", issued.token.id, scoped("evil", "", vec![]))
            .await
    );
    assert!(h.tokens.list("bob").await.unwrap().is_empty());
    assert_eq!(h.tokens.list("alice").await.unwrap().len(), 1);
}

/// Store whose lookups never finish.
struct StalledStore;

#[async_trait]
impl TokenStore for StalledStore {
    async fn create(&self, _: NewToken) -> Result<Token, StoreError> {
        std::future::pending().await
    }
    async fn get(&self, _: &str, _: TokenId) -> Result<Token, StoreError> {
        std::future::pending().await
    }
    async fn list(&self, _: &str) -> Result<Vec<Token>, StoreError> {
        std::future::pending().await
    }
    async fn update(&self, _: &str, _: TokenId, _: ConfigPatch) -> Result<Token, StoreError> {
        std::future::pending().await
    }
    async fn rotate(&self, _: &str, _: TokenId, _: KeyMaterial) -> Result<Rotated, StoreError> {
        std::future::pending().await
    }
    async fn delete(&self, _: &str, _: TokenId) -> Result<Token, StoreError> {
        std::future::pending().await
    }
    async fn find_by_key_id(&self, _: &KeyId) -> Result<Token, StoreError> {
        std::future::pending().await
    }
    async fn record_usage(&self, _: TokenId, _: u64, _: DateTime<Utc>) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_store_timeout_is_distinct_from_not_found() {
    let store: SharedStore = Arc::new(StalledStore);
    let cache = Arc::new(KeyCache::new(Duration::from_secs(15)));
    let (usage, _rx) = UsageRecorder::channel(8);
    let authorizer = Authorizer::new(store.clone(), cache.clone(), usage, Duration::from_millis(20));

    let (secret, _) = credentials::mint();
    let result = authorizer.authorize(&secret.encode(), "", "").await;
    assert!(matches!(result, Err(StoreError::Timeout)));

    let tokens = TokenService::new(store, cache, Duration::from_millis(20), 1);
    assert!(matches!(
        tokens.get("alice", 1).await,
        Err(tokengate::service::ServiceError::Unavailable)
    ));
}
