//! Usage accounting off the authorization path.
//!
//! `UsageRecorder::hit` only enqueues; the `jobs::usage_sync` worker drains
//! the queue into a [`UsageBatch`] and flushes it to the store periodically.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::token::TokenId;
use crate::store::{with_timeout, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub token_id: TokenId,
    pub at: DateTime<Utc>,
}

/// Sending half of the usage queue. Cheap to clone.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<Hit>,
}

impl UsageRecorder {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Hit>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Record one successful authorization. Never blocks; a full queue
    /// drops the hit.
    pub fn hit(&self, token_id: TokenId) {
        let hit = Hit {
            token_id,
            at: Utc::now(),
        };
        match self.tx.try_send(hit) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(token_id, "usage queue full, dropping hit");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(token_id, "usage worker gone, dropping hit");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    hits: u64,
    last: DateTime<Utc>,
}

/// Per-token aggregate of hits not yet written to the store.
#[derive(Debug, Default)]
pub struct UsageBatch {
    pending: HashMap<TokenId, Pending>,
}

impl UsageBatch {
    pub fn add(&mut self, hit: Hit) {
        self.pending
            .entry(hit.token_id)
            .and_modify(|p| {
                p.hits += 1;
                p.last = p.last.max(hit.at);
            })
            .or_insert(Pending {
                hits: 1,
                last: hit.at,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Hits pending for `token_id`.
    pub fn hits(&self, token_id: TokenId) -> u64 {
        self.pending.get(&token_id).map_or(0, |p| p.hits)
    }

    /// Write every aggregate to the store. Entries that fail stay queued for
    /// the next flush. Returns the number of tokens written.
    pub async fn flush(&mut self, store: &dyn TokenStore, timeout: Duration) -> usize {
        let mut written = 0;
        let ids: Vec<TokenId> = self.pending.keys().copied().collect();
        for id in ids {
            let Some(pending) = self.pending.get(&id).copied() else {
                continue;
            };
            match with_timeout(timeout, store.record_usage(id, pending.hits, pending.last)).await {
                Ok(()) => {
                    self.pending.remove(&id);
                    written += 1;
                }
                Err(e) => {
                    tracing::warn!(token_id = id, hits = pending.hits, "failed to record usage: {}", e);
                }
            }
        }
        written
    }
}
