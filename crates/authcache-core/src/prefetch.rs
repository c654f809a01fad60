//! Background prefetch with bounded concurrency.
//!
//! Callers hand over batches ordered by how soon each asset is likely to be needed. Keys
//! already queued this session are skipped through a bounded seen-set, which is dropped
//! wholesale once it outgrows its cap. Workers drain a shared FIFO and exit when it is
//! empty, so at most `concurrency` resolves run at any moment.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::assets::{AssetCache, ResolveOptions};
use crate::config::PrefetchTuning;

/// The one operation prefetching and memoization need from the cache.
#[async_trait::async_trait]
pub trait AssetResolver: Send + Sync + 'static {
    async fn resolve(&self, key: &str, url: &str) -> Option<PathBuf>;
}

#[async_trait::async_trait]
impl AssetResolver for AssetCache {
    async fn resolve(&self, key: &str, url: &str) -> Option<PathBuf> {
        match AssetCache::resolve(self, key, url, ResolveOptions::default()).await {
            Ok(path) => path,
            Err(err) => {
                warn!("asset request rejected: {err}");
                None
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueItem {
    pub key: String,
    pub url: String,
}

impl QueueItem {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueReport {
    pub accepted: usize,
    pub skipped_seen: usize,
    pub dropped_over_limit: usize,
    pub workers_started: usize,
    /// The seen-set outgrew its cap and was dropped before this batch.
    pub seen_reset: bool,
}

#[derive(Default)]
struct QueueState {
    seen: HashSet<String>,
    pending: VecDeque<QueueItem>,
    active_workers: usize,
}

struct Inner {
    resolver: Arc<dyn AssetResolver>,
    tuning: PrefetchTuning,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Clone)]
pub struct PrefetchQueue {
    inner: Arc<Inner>,
}

impl PrefetchQueue {
    pub fn new(resolver: Arc<dyn AssetResolver>, tuning: PrefetchTuning) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                tuning,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Queue over `cache` whose seen-set and backlog are dropped by `cache.clear_all()`.
    pub fn for_cache(cache: &AssetCache, tuning: PrefetchTuning) -> Self {
        let queue = Self::new(Arc::new(cache.clone()), tuning);
        let weak: Weak<Inner> = Arc::downgrade(&queue.inner);
        cache.on_clear(move || {
            if let Some(inner) = weak.upgrade() {
                inner.clear();
            }
        });
        queue
    }

    /// Enqueue with the configured `max_initial` and `concurrency`.
    pub fn enqueue_default(&self, items: Vec<QueueItem>) -> EnqueueReport {
        let tuning = &self.inner.tuning;
        self.enqueue(items, tuning.max_initial, tuning.concurrency)
    }

    /// Queues up to `max_initial` unseen items and makes sure up to `concurrency` workers
    /// are draining the queue. Must be called inside a tokio runtime.
    pub fn enqueue(
        &self,
        items: Vec<QueueItem>,
        max_initial: usize,
        concurrency: usize,
    ) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        let to_start = {
            let mut state = self.inner.state.lock();
            if state.seen.len() > self.inner.tuning.seen_cap {
                debug!(
                    seen = state.seen.len(),
                    cap = self.inner.tuning.seen_cap,
                    "prefetch seen-set over cap; resetting"
                );
                state.seen.clear();
                state.pending.clear();
                report.seen_reset = true;
            }

            for item in items {
                if state.seen.contains(&item.key) {
                    report.skipped_seen += 1;
                    continue;
                }
                if report.accepted >= max_initial {
                    report.dropped_over_limit += 1;
                    continue;
                }
                state.seen.insert(item.key.clone());
                state.pending.push_back(item);
                report.accepted += 1;
            }

            let wanted = concurrency.max(1);
            let to_start = wanted
                .saturating_sub(state.active_workers)
                .min(state.pending.len());
            state.active_workers += to_start;
            to_start
        };

        for _ in 0..to_start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.work().await });
        }
        report.workers_started = to_start;
        if report.accepted > 0 {
            info!(
                accepted = report.accepted,
                skipped = report.skipped_seen,
                workers = to_start,
                "prefetch batch queued"
            );
        }
        report
    }

    /// Waits until the queue is empty and no worker is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if state.active_workers == 0 && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Drops the seen-set and anything not yet picked up by a worker.
    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn seen_len(&self) -> usize {
        self.inner.state.lock().seen.len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.state.lock().active_workers
    }
}

impl Inner {
    async fn work(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(item) => Some(item),
                    None => {
                        state.active_workers = state.active_workers.saturating_sub(1);
                        None
                    }
                }
            };
            let Some(item) = next else {
                self.idle.notify_waiters();
                return;
            };
            if self.resolver.resolve(&item.key, &item.url).await.is_none() {
                debug!(key = %item.key, "prefetch failed; key may be queued again");
                self.state.lock().seen.remove(&item.key);
            }
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.seen.clear();
        state.pending.clear();
    }
}
