//! Background job: sweep expired entries out of the key cache.
//!
//! Reads already ignore expired entries; this only bounds memory for keys
//! that are never presented again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::authz::KeyCache;

/// Spawn the sweep task. Call this once at startup.
pub fn spawn(cache: Arc<KeyCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = cache.len(), "swept key cache");
            }
        }
    })
}
