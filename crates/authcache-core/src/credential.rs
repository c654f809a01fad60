//! Expiry-aware cache for the short-lived bearer credential.
//!
//! Fetches are single-flighted under one key. Rate-limit and attestation refusals start
//! a cooldown during which no provider call is made; while it lasts the cache hands back
//! its last credential if that has not actually expired, and nothing otherwise.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::claims;
use crate::clock::{duration_ms, SharedClock};
use crate::config::CredentialTuning;
use crate::error::{FailureClass, ProviderError};
use crate::provider::CredentialProvider;
use crate::single_flight::{FlightRole, SingleFlight};

const FETCH_KEY: &str = "credential";
/// Forced fetches never join a plain one, so the provider always sees `force_refresh`.
const FORCED_FETCH_KEY: &str = "credential:forced";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub value: String,
    pub expires_at_ms: i64,
    pub obtained_at_ms: i64,
}

impl Credential {
    /// Still usable without a refresh, keeping `buffer_ms` of headroom.
    pub fn is_fresh(&self, now_ms: i64, buffer_ms: i64) -> bool {
        self.expires_at_ms.saturating_sub(now_ms) > buffer_ms
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CooldownState {
    pub active_until_ms: i64,
}

impl CooldownState {
    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms < self.active_until_ms
    }
}

/// Serializable view of the cache for diagnostics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CredentialStatus {
    pub has_credential: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureClass>,
    pub provider_calls: u64,
    pub provider_failures: u64,
    pub cooldowns: u64,
    pub coalesced: u64,
}

#[derive(Default)]
struct CredentialState {
    current: Option<Credential>,
    cooldown: CooldownState,
    last_failure: Option<FailureClass>,
    provider_calls: u64,
    provider_failures: u64,
    cooldowns: u64,
    coalesced: u64,
    /// Bumped by `reset`; fetches started before it must not write back.
    generation: u64,
}

struct Inner {
    provider: Arc<dyn CredentialProvider>,
    clock: SharedClock,
    tuning: CredentialTuning,
    state: Mutex<CredentialState>,
    flights: SingleFlight<&'static str, Option<Credential>>,
}

#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<Inner>,
}

impl CredentialCache {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        tuning: CredentialTuning,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                clock,
                tuning,
                state: Mutex::new(CredentialState::default()),
                flights: SingleFlight::new(),
            }),
        }
    }

    /// Current credential, fetching one when the cached value is missing or close to
    /// expiry. `None` means the caller should proceed without one.
    pub async fn get_credential(&self) -> Option<Credential> {
        let now = self.inner.clock.now_ms();
        let buffer = duration_ms(self.inner.tuning.expiration_buffer());
        {
            let state = self.inner.state.lock();
            if let Some(current) = state.current.as_ref() {
                if current.is_fresh(now, buffer) {
                    return Some(current.clone());
                }
            }
            if state.cooldown.is_active(now) {
                debug!(
                    until = state.cooldown.active_until_ms,
                    "credential fetch suppressed by cooldown"
                );
                return state.current.clone().filter(|c| !c.is_expired(now));
            }
        }
        self.fetch_shared(false).await
    }

    /// Installs an externally obtained credential as if it had just been fetched.
    pub fn prime_credential(&self, value: impl Into<String>) -> Credential {
        let credential = self.inner.install(value.into());
        info!(
            expires_at_ms = credential.expires_at_ms,
            "credential primed"
        );
        credential
    }

    /// Drops the cached credential and asks the provider for a new one, bypassing any
    /// provider-side caching. An active cooldown still applies.
    pub async fn force_refresh(&self) -> Option<Credential> {
        self.inner.state.lock().current = None;
        self.inner.flights.wait(&FETCH_KEY).await;
        let now = self.inner.clock.now_ms();
        if self.inner.state.lock().cooldown.is_active(now) {
            debug!("forced credential refresh suppressed by cooldown");
            return None;
        }
        self.fetch_shared(true).await
    }

    /// Forgets the credential, the cooldown and any in-flight fetch. A provider call still
    /// running is discarded when it lands.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock();
            let generation = state.generation.wrapping_add(1);
            *state = CredentialState {
                generation,
                ..CredentialState::default()
            };
        }
        self.inner.flights.clear();
    }

    pub fn cached(&self) -> Option<Credential> {
        self.inner.state.lock().current.clone()
    }

    pub fn last_failure(&self) -> Option<FailureClass> {
        self.inner.state.lock().last_failure
    }

    pub fn status(&self) -> CredentialStatus {
        let now = self.inner.clock.now_ms();
        let state = self.inner.state.lock();
        CredentialStatus {
            has_credential: state.current.is_some(),
            expires_at_ms: state.current.as_ref().map(|c| c.expires_at_ms),
            cooldown_until_ms: state
                .cooldown
                .is_active(now)
                .then_some(state.cooldown.active_until_ms),
            last_failure: state.last_failure,
            provider_calls: state.provider_calls,
            provider_failures: state.provider_failures,
            cooldowns: state.cooldowns,
            coalesced: state.coalesced,
        }
    }

    async fn fetch_shared(&self, force_refresh: bool) -> Option<Credential> {
        let key = if force_refresh {
            FORCED_FETCH_KEY
        } else {
            FETCH_KEY
        };
        let inner = Arc::clone(&self.inner);
        let (result, role) = self
            .inner
            .flights
            .run(key, move || async move {
                inner.fetch_once(force_refresh).await
            })
            .await;
        if role == FlightRole::Follower {
            let mut state = self.inner.state.lock();
            state.coalesced = state.coalesced.saturating_add(1);
        }
        result.flatten()
    }
}

impl Inner {
    async fn fetch_once(&self, force_refresh: bool) -> Option<Credential> {
        let generation = self.state.lock().generation;
        let timeout = self.tuning.fetch_timeout();
        let outcome = self
            .tuning
            .retry
            .run(
                |attempt| async move {
                    {
                        let mut state = self.state.lock();
                        state.provider_calls = state.provider_calls.saturating_add(1);
                    }
                    debug!(attempt, force_refresh, "requesting credential");
                    match tokio::time::timeout(timeout, self.provider.fetch(force_refresh)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Transient(format!(
                            "provider did not answer within {timeout:?}"
                        ))),
                    }
                },
                ProviderError::class,
            )
            .await;

        match outcome {
            Ok(value) => {
                let credential = self.decode(value);
                if !self.store(&credential, Some(generation)) {
                    debug!("dropping credential fetched before a reset");
                    return None;
                }
                debug!(
                    expires_at_ms = credential.expires_at_ms,
                    "credential refreshed"
                );
                Some(credential)
            }
            Err(err) => self.record_failure(err, generation),
        }
    }

    fn install(&self, value: String) -> Credential {
        let credential = self.decode(value);
        self.store(&credential, None);
        credential
    }

    /// Stamps expiry from the `exp` claim, or the fallback TTL when it is unreadable.
    fn decode(&self, value: String) -> Credential {
        let now = self.clock.now_ms();
        let expires_at_ms = match claims::expiry_ms(&value) {
            Ok(exp) => exp,
            Err(err) => {
                let fallback = duration_ms(self.tuning.fallback_ttl());
                warn!(
                    "credential expiry unreadable ({err}); assuming {}s validity",
                    self.tuning.fallback_ttl_secs
                );
                now.saturating_add(fallback)
            }
        };
        Credential {
            value,
            expires_at_ms,
            obtained_at_ms: now,
        }
    }

    /// Makes `credential` current unless a reset happened since `generation` was read.
    fn store(&self, credential: &Credential, generation: Option<u64>) -> bool {
        let mut state = self.state.lock();
        if generation.is_some_and(|g| g != state.generation) {
            return false;
        }
        state.current = Some(credential.clone());
        state.last_failure = None;
        true
    }

    fn record_failure(&self, err: ProviderError, generation: u64) -> Option<Credential> {
        let class = err.class();
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(%class, "ignoring failure of a fetch started before a reset");
            return None;
        }
        state.provider_failures = state.provider_failures.saturating_add(1);
        state.last_failure = Some(class);
        if class.triggers_cooldown() {
            let until = now.saturating_add(duration_ms(self.tuning.cooldown()));
            state.cooldown.active_until_ms = state.cooldown.active_until_ms.max(until);
            state.cooldowns = state.cooldowns.saturating_add(1);
            warn!(%class, until, "credential provider refused; cooling down: {err}");
        } else {
            warn!(%class, "credential fetch failed: {err}");
        }
        state.current.clone().filter(|c| !c.is_expired(now))
    }
}
