#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use authcache_core::{
    CacheConfig, CredentialCache, CredentialProvider, ProviderError, RetryPolicy, SharedClock,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::json;

pub const START_MS: i64 = 1_700_000_000_000;

pub fn jwt_expiring_at(exp_secs: i64, tag: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({"exp": exp_secs, "sub": tag}).to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

/// Answers from a script, then from a fallback; forced refreshes may get their own answer.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Mutex<Result<String, ProviderError>>,
    forced: Mutex<Option<Result<String, ProviderError>>>,
    delay: Duration,
    calls: AtomicUsize,
    forced_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(fallback: Result<String, ProviderError>) -> Arc<Self> {
        Self::with_delay(fallback, Duration::ZERO)
    }

    pub fn with_delay(fallback: Result<String, ProviderError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            forced: Mutex::new(None),
            delay,
            calls: AtomicUsize::new(0),
            forced_calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, result: Result<String, ProviderError>) {
        self.script.lock().push_back(result);
    }

    pub fn set_fallback(&self, result: Result<String, ProviderError>) {
        *self.fallback.lock() = result;
    }

    pub fn on_force(&self, result: Result<String, ProviderError>) {
        *self.forced.lock() = Some(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn forced_calls(&self) -> usize {
        self.forced_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for ScriptedProvider {
    async fn fetch(&self, force_refresh: bool) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if force_refresh {
            self.forced_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(result) = self.forced.lock().clone() {
                return result;
            }
        }
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        self.fallback.lock().clone()
    }
}

pub fn test_config(dir: &Path) -> CacheConfig {
    let mut cfg = CacheConfig {
        cache_dir: dir.to_path_buf(),
        ..CacheConfig::default()
    };
    cfg.credential.retry = RetryPolicy::new(1, Duration::from_millis(1));
    cfg.assets.retry = RetryPolicy::new(3, Duration::from_millis(1));
    cfg.assets.request_timeout_secs = 5;
    cfg
}

pub fn credential_cache(
    provider: Arc<ScriptedProvider>,
    cfg: &CacheConfig,
    clock: SharedClock,
) -> CredentialCache {
    CredentialCache::new(provider, cfg.credential.clone(), clock)
}

pub fn tmp_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".tmp"))
                .collect()
        })
        .unwrap_or_default()
}
