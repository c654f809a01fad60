use serde::Serialize;

/// Outcome classes shared by the credential and asset paths. The retry predicate and
/// the cooldown logic both key off this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimited,
    AttestationRejected,
    TransientNetwork,
    Unauthorized,
    ClientRejected,
    SizeValidation,
    Decode,
    Io,
    /// The cache was cleared while the work was running.
    Cancelled,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::RateLimited => "rate_limited",
            FailureClass::AttestationRejected => "attestation_rejected",
            FailureClass::TransientNetwork => "transient_network",
            FailureClass::Unauthorized => "unauthorized",
            FailureClass::ClientRejected => "client_rejected",
            FailureClass::SizeValidation => "size_validation",
            FailureClass::Decode => "decode",
            FailureClass::Io => "io",
            FailureClass::Cancelled => "cancelled",
        }
    }

    /// Whether another attempt can plausibly succeed.
    ///
    /// `Unauthorized` stays retryable: the asset loop refreshes the credential once and
    /// otherwise falls back to the normal backoff schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureClass::TransientNetwork | FailureClass::Unauthorized
        )
    }

    /// Provider-side refusals that put the credential cache into cooldown.
    pub fn triggers_cooldown(&self) -> bool {
        matches!(
            self,
            FailureClass::RateLimited | FailureClass::AttestationRejected
        )
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a [`crate::CredentialProvider`] may report.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("credential provider is rate limiting requests")]
    RateLimited,
    #[error("attestation rejected: {0}")]
    AttestationRejected(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
}

impl ProviderError {
    pub fn class(&self) -> FailureClass {
        match self {
            ProviderError::RateLimited => FailureClass::RateLimited,
            ProviderError::AttestationRejected(_) => FailureClass::AttestationRejected,
            ProviderError::Transient(_) => FailureClass::TransientNetwork,
        }
    }
}

// Anything a provider cannot classify is treated as transient.
impl From<anyhow::Error> for ProviderError {
    fn from(err: anyhow::Error) -> Self {
        ProviderError::Transient(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transient(err.to_string())
    }
}

/// Caller mistakes. Expected runtime failures never surface through this type.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("invalid asset key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("invalid asset url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
