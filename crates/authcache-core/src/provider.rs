//! Credential sources.
//!
//! The cache only needs something that hands back a bearer string and classifies its
//! failures; how the value is attested is the provider's business.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::{CacheError, ProviderError};
use crate::http_client;

#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns a fresh bearer credential. `force_refresh` asks the provider to bypass
    /// any caching of its own.
    async fn fetch(&self, force_refresh: bool) -> Result<String, ProviderError>;
}

/// Hands out one fixed value. Useful for operators holding a token from elsewhere.
#[derive(Clone, Debug)]
pub struct StaticCredentialProvider {
    value: String,
}

impl StaticCredentialProvider {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn fetch(&self, _force_refresh: bool) -> Result<String, ProviderError> {
        if self.value.trim().is_empty() {
            return Err(ProviderError::AttestationRejected(
                "static credential is empty".into(),
            ));
        }
        Ok(self.value.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "value", alias = "access_token")]
    token: String,
}

/// Exchanges with a token endpoint: `POST {"force_refresh": bool}` answered by
/// `{"token": "..."}`.
#[derive(Clone, Debug)]
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCredentialProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CacheError> {
        let endpoint = Url::parse(endpoint).map_err(|e| CacheError::InvalidUrl {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        let client = http_client::builder(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key: None,
            timeout,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait::async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch(&self, force_refresh: bool) -> Result<String, ProviderError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&json!({ "force_refresh": force_refresh }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        debug!(%status, force_refresh, "token endpoint answered");
        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::AttestationRejected(format!(
                    "{status}: {}",
                    body.trim()
                )))
            }
            s if s.is_success() => {
                let parsed: TokenResponse = response.json().await?;
                if parsed.token.trim().is_empty() {
                    return Err(ProviderError::Transient(
                        "token endpoint returned an empty token".into(),
                    ));
                }
                Ok(parsed.token)
            }
            s => Err(ProviderError::Transient(format!(
                "token endpoint returned {s}"
            ))),
        }
    }
}
