//! Session memo in front of the asset cache.
//!
//! `get` answers from memory when it can and otherwise kicks off a resolve in the
//! background, reporting `is_loading` until it settles. Failures are flagged but never
//! memoized. Every state change bumps a `watch` counter for observers.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::assets::AssetCache;
use crate::prefetch::AssetResolver;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub local_uri: Option<String>,
    pub is_loading: bool,
    pub has_error: bool,
}

impl Resolution {
    fn ready(uri: String) -> Self {
        Self {
            local_uri: Some(uri),
            is_loading: false,
            has_error: false,
        }
    }

    fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::default()
        }
    }

    fn failed() -> Self {
        Self {
            has_error: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ResolutionState {
    memo: HashMap<String, String>,
    loading: HashSet<String>,
    errors: HashSet<String>,
    /// Bumped by `clear` so results from before the clear are discarded.
    generation: u64,
}

struct Inner {
    resolver: Arc<dyn AssetResolver>,
    state: Mutex<ResolutionState>,
    updates: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct ResolutionCache {
    inner: Arc<Inner>,
}

impl ResolutionCache {
    pub fn new(resolver: Arc<dyn AssetResolver>) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                resolver,
                state: Mutex::new(ResolutionState::default()),
                updates,
            }),
        }
    }

    /// Memo over `cache`, emptied whenever `cache.clear_all()` runs.
    pub fn for_cache(cache: &AssetCache) -> Self {
        let memo = Self::new(Arc::new(cache.clone()));
        let weak: Weak<Inner> = Arc::downgrade(&memo.inner);
        cache.on_clear(move || {
            if let Some(inner) = weak.upgrade() {
                inner.clear();
            }
        });
        memo
    }

    /// Current resolution for `key`, starting a background resolve on a miss. A key that
    /// failed earlier is attempted again. Must be called inside a tokio runtime.
    pub fn get(&self, key: &str, url: &str) -> Resolution {
        let generation = {
            let mut state = self.inner.state.lock();
            if let Some(uri) = state.memo.get(key) {
                return Resolution::ready(uri.clone());
            }
            if state.loading.contains(key) {
                return Resolution::loading();
            }
            state.errors.remove(key);
            state.loading.insert(key.to_string());
            state.generation
        };
        self.inner.bump();

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let url = url.to_string();
        tokio::spawn(async move {
            let resolved = inner.resolver.resolve(&key, &url).await;
            inner.settle(&key, generation, resolved.as_deref());
        });
        Resolution::loading()
    }

    /// Snapshot for `key` without side effects.
    pub fn peek(&self, key: &str) -> Resolution {
        let state = self.inner.state.lock();
        if let Some(uri) = state.memo.get(key) {
            Resolution::ready(uri.clone())
        } else if state.loading.contains(key) {
            Resolution::loading()
        } else if state.errors.contains(key) {
            Resolution::failed()
        } else {
            Resolution::default()
        }
    }

    /// Like [`ResolutionCache::get`], but waits for the resolve to settle.
    pub async fn resolve(&self, key: &str, url: &str) -> Resolution {
        let mut updates = self.inner.updates.subscribe();
        let mut current = self.get(key, url);
        while current.is_loading {
            if updates.changed().await.is_err() {
                break;
            }
            current = self.peek(key);
        }
        current
    }

    /// Forgets the memo entry and error flag for `key`; the disk cache is untouched.
    pub fn retry(&self, key: &str) {
        {
            let mut state = self.inner.state.lock();
            state.memo.remove(key);
            state.errors.remove(key);
        }
        self.inner.bump();
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Version counter bumped on every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn settle(&self, key: &str, generation: u64, resolved: Option<&Path>) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!(key, "dropping resolution finished after a clear");
                return;
            }
            state.loading.remove(key);
            match resolved {
                Some(path) => {
                    state.memo.insert(key.to_string(), local_uri(path));
                }
                None => {
                    state.errors.insert(key.to_string());
                }
            }
        }
        self.bump();
    }

    fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.memo.clear();
            state.loading.clear();
            state.errors.clear();
            state.generation = state.generation.wrapping_add(1);
        }
        self.bump();
    }

    fn bump(&self) {
        self.updates.send_modify(|version| *version = version.wrapping_add(1));
    }
}

fn local_uri(path: &Path) -> String {
    Url::from_file_path(path)
        .map(String::from)
        .unwrap_or_else(|_| path.display().to_string())
}
