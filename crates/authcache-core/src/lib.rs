//! Authenticated asset cache: a short-lived credential manager, a disk-backed
//! deduplicating fetcher, a bounded background prefetch queue and a process-local
//! resolution memo.
//!
//! The pieces are plain instances built from a [`CacheConfig`] and an injected
//! [`Clock`]; nothing here lives in a global.

pub mod assets;
pub mod claims;
pub mod clock;
mod config;
pub mod credential;
mod error;
pub mod http_client;
pub mod prefetch;
pub mod provider;
pub mod resolution;
pub mod retry;
pub mod single_flight;

pub use assets::{AssetCache, AssetCacheStats, CacheEntry, ClearReport, ResolveOptions};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    load_config, AssetTuning, CacheConfig, CredentialTuning, PrefetchTuning,
    ATTESTATION_HEADER,
};
pub use credential::{CooldownState, Credential, CredentialCache, CredentialStatus};
pub use error::{CacheError, FailureClass, ProviderError};
pub use prefetch::{AssetResolver, EnqueueReport, PrefetchQueue, QueueItem};
pub use provider::{CredentialProvider, HttpCredentialProvider, StaticCredentialProvider};
pub use resolution::{Resolution, ResolutionCache};
pub use retry::RetryPolicy;
pub use single_flight::SingleFlight;
