//! Disk-backed asset cache.
//!
//! `resolve` maps an asset key to a local file: a valid file on disk wins, a running
//! download for the key is joined, and otherwise a new download is started. Downloads
//! stream into `<key>.<ext>.<epoch_ms>.tmp` and are renamed into place only after the
//! size check passes, so the final path never holds a partial file.

mod download;
mod storage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{duration_ms, SharedClock};
use crate::config::{AssetTuning, CacheConfig};
use crate::credential::CredentialCache;
use crate::error::CacheError;
use crate::http_client;
use crate::single_flight::{FlightRole, SingleFlight};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub extension: String,
    pub size_bytes: u64,
    pub written_at_ms: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Skip the disk check and any running download; fetch again.
    pub force_refresh: bool,
}

impl ResolveOptions {
    pub fn forced() -> Self {
        Self {
            force_refresh: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub deleted_count: u64,
    pub freed_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AssetCacheStats {
    pub entries: usize,
    pub inflight: usize,
    pub hits: u64,
    pub coalesced: u64,
    pub downloads_started: u64,
    pub downloads_completed: u64,
    pub failures: u64,
    pub bytes_downloaded: u64,
    pub auth_refreshes: u64,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    coalesced: u64,
    downloads_started: u64,
    downloads_completed: u64,
    failures: u64,
    bytes_downloaded: u64,
    auth_refreshes: u64,
}

impl Counters {
    fn record_completed(&mut self, bytes: u64) {
        self.downloads_completed = self.downloads_completed.saturating_add(1);
        self.bytes_downloaded = self.bytes_downloaded.saturating_add(bytes);
    }

    fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, CacheEntry>,
    /// Extension seen last time per key; only a hint for the disk probe.
    hints: HashMap<String, String>,
    /// Bumped by `clear_all`; downloads started before it must not land.
    generation: u64,
}

type ClearListener = Box<dyn Fn() + Send + Sync>;

struct Inner {
    dir: PathBuf,
    http: reqwest::Client,
    credentials: CredentialCache,
    clock: SharedClock,
    tuning: AssetTuning,
    diagnostics: bool,
    registry: Mutex<Registry>,
    flights: SingleFlight<String, Option<PathBuf>>,
    listeners: Mutex<Vec<ClearListener>>,
    counters: Mutex<Counters>,
}

#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<Inner>,
}

impl AssetCache {
    pub fn new(
        config: &CacheConfig,
        credentials: CredentialCache,
        clock: SharedClock,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let http = http_client::asset_client(&config.assets)?;
        Ok(Self::with_client(config, credentials, clock, http))
    }

    pub fn with_client(
        config: &CacheConfig,
        credentials: CredentialCache,
        clock: SharedClock,
        http: reqwest::Client,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: config.cache_dir.clone(),
                http,
                credentials,
                clock,
                tuning: config.assets.clone(),
                diagnostics: config.diagnostics,
                registry: Mutex::new(Registry::default()),
                flights: SingleFlight::new(),
                listeners: Mutex::new(Vec::new()),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.inner.credentials
    }

    /// Local path for `key`, downloading from `url` when needed. `Ok(None)` covers every
    /// expected failure; `Err` means the key or URL itself is unusable.
    pub async fn resolve(
        &self,
        key: &str,
        url: &str,
        opts: ResolveOptions,
    ) -> Result<Option<PathBuf>, CacheError> {
        storage::validate_key(key)?;
        let url = storage::parse_url(url)?;
        let flight_key = key.to_string();

        if opts.force_refresh {
            self.inner.flights.wait(&flight_key).await;
        } else if let Some(path) = self.lookup(key).await {
            self.inner.counters.lock().hits += 1;
            return Ok(Some(path));
        }

        let inner = Arc::clone(&self.inner);
        let owned_key = flight_key.clone();
        let (result, role) = self
            .inner
            .flights
            .run(flight_key, move || async move {
                inner.download(&owned_key, &url).await
            })
            .await;
        if role == FlightRole::Follower {
            self.inner.counters.lock().coalesced += 1;
        }
        Ok(result.flatten())
    }

    /// Drops one key from the registries and deletes its files.
    pub async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        storage::validate_key(key)?;
        let had_entry = self.inner.forget(key).is_some();
        let removed = storage::remove_variants(&self.inner.dir, key, None).await;
        debug!(key, removed, "asset evicted");
        Ok(had_entry || removed > 0)
    }

    /// Wipes every registry, notifies clear listeners, then deletes everything in the
    /// cache directory. Sizes are summed before each deletion. Downloads still running
    /// are discarded when they finish and resolve to `None`.
    pub async fn clear_all(&self) -> ClearReport {
        {
            let mut registry = self.inner.registry.lock();
            registry.entries.clear();
            registry.hints.clear();
            registry.generation = registry.generation.wrapping_add(1);
        }
        self.inner.flights.clear();
        for listener in self.inner.listeners.lock().iter() {
            listener();
        }
        let dir = self.inner.dir.clone();
        let report = match tokio::task::spawn_blocking(move || storage::purge_dir(&dir)).await {
            Ok(report) => report,
            Err(err) => {
                warn!("cache purge task failed: {err}");
                ClearReport::default()
            }
        };
        info!(
            deleted = report.deleted_count,
            freed_bytes = report.freed_bytes,
            "asset cache cleared"
        );
        report
    }

    /// Registers a callback run by [`AssetCache::clear_all`] before files are deleted.
    pub fn on_clear(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.registry.lock().entries.get(key).cloned()
    }

    pub fn stats(&self) -> AssetCacheStats {
        let entries = self.inner.registry.lock().entries.len();
        let counters = self.inner.counters.lock();
        AssetCacheStats {
            entries,
            inflight: self.inner.flights.len(),
            hits: counters.hits,
            coalesced: counters.coalesced,
            downloads_started: counters.downloads_started,
            downloads_completed: counters.downloads_completed,
            failures: counters.failures,
            bytes_downloaded: counters.bytes_downloaded,
            auth_refreshes: counters.auth_refreshes,
        }
    }

    /// Valid cached path for `key`, if any. Stale or undersized files are deleted.
    async fn lookup(&self, key: &str) -> Option<PathBuf> {
        let now = self.inner.clock.now_ms();
        let (known, hint) = {
            let registry = self.inner.registry.lock();
            (
                registry.entries.get(key).cloned(),
                registry.hints.get(key).cloned(),
            )
        };
        let mut entry = match known {
            Some(entry) => entry,
            None => storage::probe(&self.inner.dir, key, hint.as_deref(), now).await?,
        };

        match tokio::fs::metadata(&entry.path).await {
            Ok(meta) if meta.is_file() => entry.size_bytes = meta.len(),
            _ => {
                self.inner.forget(key);
                return None;
            }
        }

        let age_ms = now.saturating_sub(entry.written_at_ms);
        let too_old = age_ms > duration_ms(self.inner.tuning.max_age());
        let too_small = entry.size_bytes < self.inner.tuning.min_size_bytes;
        if too_old || too_small {
            debug!(key, age_ms, size = entry.size_bytes, "cached asset invalid");
            self.discard(key, &entry).await;
            return None;
        }

        let path = entry.path.clone();
        self.inner.remember(entry);
        Some(path)
    }

    async fn discard(&self, key: &str, stale: &CacheEntry) {
        // A running download will replace the file through its own rename.
        if self.inner.flights.contains(&key.to_string()) {
            return;
        }
        {
            let mut registry = self.inner.registry.lock();
            let replaced = registry
                .entries
                .get(key)
                .is_some_and(|current| current.written_at_ms != stale.written_at_ms);
            if replaced {
                return;
            }
            registry.entries.remove(key);
        }
        storage::remove_quietly(&stale.path).await;
    }
}

impl Inner {
    fn generation(&self) -> u64 {
        self.registry.lock().generation
    }

    /// Records `entry` unless `clear_all` ran since `generation` was read.
    fn remember_if_current(&self, entry: CacheEntry, generation: u64) -> bool {
        let mut registry = self.registry.lock();
        if registry.generation != generation {
            return false;
        }
        registry
            .hints
            .insert(entry.key.clone(), entry.extension.clone());
        registry.entries.insert(entry.key.clone(), entry);
        true
    }

    fn remember(&self, entry: CacheEntry) {
        let mut registry = self.registry.lock();
        registry
            .hints
            .insert(entry.key.clone(), entry.extension.clone());
        registry.entries.insert(entry.key.clone(), entry);
    }

    fn forget(&self, key: &str) -> Option<CacheEntry> {
        let mut registry = self.registry.lock();
        registry.hints.remove(key);
        registry.entries.remove(key)
    }
}
