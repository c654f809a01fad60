use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::retry::RetryPolicy;

/// Request header carrying the credential on asset downloads.
pub const ATTESTATION_HEADER: &str = "Authorization-Attestation";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialTuning {
    /// A cached credential closer than this to its expiry is refreshed.
    pub expiration_buffer_secs: u64,
    /// Assumed validity when the credential's `exp` claim cannot be read.
    pub fallback_ttl_secs: u64,
    /// Quiet period after a rate-limit or attestation refusal.
    pub cooldown_secs: u64,
    /// Bound on a single provider call.
    pub fetch_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for CredentialTuning {
    fn default() -> Self {
        Self {
            expiration_buffer_secs: 5 * 60,
            fallback_ttl_secs: 25 * 60,
            cooldown_secs: 30,
            fetch_timeout_secs: 15,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
            },
        }
    }
}

impl CredentialTuning {
    pub fn expiration_buffer(&self) -> Duration {
        Duration::from_secs(self.expiration_buffer_secs)
    }

    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.fallback_ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssetTuning {
    /// Files older than this are downloaded again.
    pub max_age_secs: u64,
    /// Files smaller than this are treated as corrupt.
    pub min_size_bytes: u64,
    /// Bound on a single download attempt, body included.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Download without a credential when none can be obtained.
    pub allow_anonymous: bool,
    pub retry: RetryPolicy,
}

impl Default for AssetTuning {
    fn default() -> Self {
        Self {
            max_age_secs: 7 * 24 * 60 * 60,
            min_size_bytes: 1024,
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
            allow_anonymous: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl AssetTuning {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrefetchTuning {
    pub concurrency: usize,
    pub max_initial: usize,
    /// Seen-set size past which it is dropped wholesale.
    pub seen_cap: usize,
}

impl Default for PrefetchTuning {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_initial: 20,
            seen_cap: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Verbose per-request logging; meant for development builds.
    pub diagnostics: bool,
    pub credential: CredentialTuning,
    pub assets: AssetTuning,
    pub prefetch: PrefetchTuning,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("authcache"),
            diagnostics: false,
            credential: CredentialTuning::default(),
            assets: AssetTuning::default(),
            prefetch: PrefetchTuning::default(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Overlays `AUTHCACHE_*` environment variables; unparsable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(dir) = env_string("AUTHCACHE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(flag) = env_flag("AUTHCACHE_DIAGNOSTICS") {
            self.diagnostics = flag;
        }

        let cred = &mut self.credential;
        if let Some(v) = env_u64("AUTHCACHE_EXPIRATION_BUFFER_SECS") {
            cred.expiration_buffer_secs = v;
        }
        if let Some(v) = env_u64("AUTHCACHE_FALLBACK_TTL_SECS") {
            cred.fallback_ttl_secs = v;
        }
        if let Some(v) = env_u64("AUTHCACHE_COOLDOWN_SECS") {
            cred.cooldown_secs = v;
        }
        if let Some(v) = env_u64("AUTHCACHE_TOKEN_TIMEOUT_SECS") {
            cred.fetch_timeout_secs = v.max(1);
        }

        let assets = &mut self.assets;
        if let Some(v) = env_u64("AUTHCACHE_MAX_AGE_SECS") {
            assets.max_age_secs = v;
        }
        if let Some(v) = env_u64("AUTHCACHE_MIN_SIZE_BYTES") {
            assets.min_size_bytes = v;
        }
        if let Some(v) = env_u64("AUTHCACHE_HTTP_TIMEOUT_SECS") {
            assets.request_timeout_secs = v.max(1);
        }
        if let Some(v) = env_u64("AUTHCACHE_MAX_ATTEMPTS") {
            assets.retry.max_attempts = u32::try_from(v.clamp(1, 16)).unwrap_or(16);
        }
        if let Some(v) = env_u64("AUTHCACHE_RETRY_BACKOFF_MS") {
            assets.retry.base_delay_ms = v.clamp(1, 60_000);
        }
        if let Some(flag) = env_flag("AUTHCACHE_ALLOW_ANONYMOUS") {
            assets.allow_anonymous = flag;
        }

        let prefetch = &mut self.prefetch;
        if let Some(v) = env_u64("AUTHCACHE_PREFETCH_CONCURRENCY") {
            prefetch.concurrency = (v as usize).max(1);
        }
        if let Some(v) = env_u64("AUTHCACHE_PREFETCH_MAX_INITIAL") {
            prefetch.max_initial = v as usize;
        }
        if let Some(v) = env_u64("AUTHCACHE_SEEN_CAP") {
            prefetch.seen_cap = (v as usize).max(1);
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(CacheError::Config("cache_dir must not be empty".into()));
        }
        if self.assets.retry.max_attempts == 0 {
            return Err(CacheError::Config(
                "assets.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.prefetch.concurrency == 0 {
            return Err(CacheError::Config(
                "prefetch.concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Loads a TOML config file; missing keys keep their defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<CacheConfig, CacheError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| CacheError::Config(format!("read {}: {e}", path.display())))?;
    let cfg: CacheConfig = toml::from_str(&content)
        .map_err(|e| CacheError::Config(format!("parse {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|s| s.parse::<u64>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = env_string(key)?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.credential.expiration_buffer(), Duration::from_secs(300));
        assert_eq!(cfg.credential.fallback_ttl(), Duration::from_secs(1500));
        assert_eq!(cfg.credential.cooldown(), Duration::from_secs(30));
        assert_eq!(cfg.assets.min_size_bytes, 1024);
        assert!(cfg.assets.allow_anonymous);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        writeln!(
            file,
            "cache_dir = \"/tmp/assets\"\n\n[assets]\nmin_size_bytes = 2048\n\n[assets.retry]\nmax_attempts = 5\n\n[prefetch]\nconcurrency = 6\n"
        )
        .expect("write");
        let cfg = load_config(file.path()).expect("config");
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp/assets"));
        assert_eq!(cfg.assets.min_size_bytes, 2048);
        assert_eq!(cfg.assets.retry.max_attempts, 5);
        assert_eq!(cfg.assets.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.prefetch.concurrency, 6);
        assert_eq!(cfg.credential, CredentialTuning::default());
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        writeln!(file, "[prefetch]\nconcurrency = 0\n").expect("write");
        assert!(matches!(load_config(file.path()), Err(CacheError::Config(_))));
    }

    #[test]
    #[serial]
    fn env_overlay_applies_and_ignores_garbage() {
        std::env::set_var("AUTHCACHE_COOLDOWN_SECS", "45");
        std::env::set_var("AUTHCACHE_ALLOW_ANONYMOUS", "off");
        std::env::set_var("AUTHCACHE_MIN_SIZE_BYTES", "lots");
        let cfg = CacheConfig::from_env();
        std::env::remove_var("AUTHCACHE_COOLDOWN_SECS");
        std::env::remove_var("AUTHCACHE_ALLOW_ANONYMOUS");
        std::env::remove_var("AUTHCACHE_MIN_SIZE_BYTES");

        assert_eq!(cfg.credential.cooldown_secs, 45);
        assert!(!cfg.assets.allow_anonymous);
        assert_eq!(cfg.assets.min_size_bytes, 1024);
    }
}
