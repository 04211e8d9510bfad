//! Background job: drain the usage queue into the store.
//!
//! Hits are aggregated per token and written every `interval`. When every
//! `UsageRecorder` is dropped the queue closes; the worker then flushes what
//! it holds and exits.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::store::SharedStore;
use crate::usage::{Hit, UsageBatch};

pub fn spawn(
    store: SharedStore,
    rx: mpsc::Receiver<Hit>,
    interval: Duration,
    store_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(run(store, rx, interval, store_timeout))
}

pub async fn run(
    store: SharedStore,
    mut rx: mpsc::Receiver<Hit>,
    interval: Duration,
    store_timeout: Duration,
) {
    let mut batch = UsageBatch::default();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            hit = rx.recv() => match hit {
                Some(hit) => batch.add(hit),
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    let written = batch.flush(store.as_ref(), store_timeout).await;
                    tracing::debug!(written, pending = batch.len(), "usage flushed");
                }
            }
        }
    }

    let written = batch.flush(store.as_ref(), store_timeout).await;
    if !batch.is_empty() {
        tracing::warn!(pending = batch.len(), "usage lost on shutdown");
    }
    tracing::info!(written, "usage worker stopped");
}
