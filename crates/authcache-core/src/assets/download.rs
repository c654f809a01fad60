use std::path::{Path, PathBuf};
use std::time::Instant;

use futures_util::StreamExt;
use reqwest::{header, StatusCode};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use url::Url;

use super::{storage, CacheEntry, Inner};
use crate::config::ATTESTATION_HEADER;
use crate::credential::Credential;
use crate::error::FailureClass;

#[derive(thiserror::Error, Debug)]
pub(super) enum DownloadFailure {
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("body of {size} bytes is below the {min} byte minimum")]
    TooSmall { size: u64, min: u64 },
    #[error("local io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache cleared while downloading")]
    Cancelled,
}

impl DownloadFailure {
    pub(super) fn class(&self) -> FailureClass {
        match self {
            DownloadFailure::Status(status) => classify_status(*status),
            DownloadFailure::Network(_) => FailureClass::TransientNetwork,
            DownloadFailure::TooSmall { .. } => FailureClass::SizeValidation,
            DownloadFailure::Io(_) => FailureClass::Io,
            DownloadFailure::Cancelled => FailureClass::Cancelled,
        }
    }
}

pub(super) fn classify_status(status: StatusCode) -> FailureClass {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureClass::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => FailureClass::TransientNetwork,
        s if s.is_server_error() => FailureClass::TransientNetwork,
        _ => FailureClass::ClientRejected,
    }
}

impl Inner {
    /// Retry loop around [`Inner::attempt`]. Returns the final path on success.
    pub(super) async fn download(&self, key: &str, url: &Url) -> Option<PathBuf> {
        let started = Instant::now();
        let policy = self.tuning.retry;
        let mut attempt = 0u32;
        let mut refreshed = false;
        let generation = self.generation();
        self.counters.lock().downloads_started += 1;

        loop {
            let credential = self.credentials.get_credential().await;
            if credential.is_none() && !self.tuning.allow_anonymous {
                warn!(key, "no credential available and anonymous downloads are disabled");
                self.counters.lock().record_failure();
                return None;
            }

            let failure = match self.attempt(key, url, credential.as_ref(), generation).await {
                Ok(entry) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if self.diagnostics {
                        info!(key, bytes = entry.size_bytes, elapsed_ms, attempt, "asset downloaded");
                    } else {
                        debug!(key, bytes = entry.size_bytes, elapsed_ms, attempt, "asset downloaded");
                    }
                    self.counters.lock().record_completed(entry.size_bytes);
                    return Some(entry.path);
                }
                Err(failure) => failure,
            };

            let class = failure.class();
            if class == FailureClass::Cancelled {
                debug!(key, "download discarded: {failure}");
                return None;
            }
            if class == FailureClass::Unauthorized {
                if credential.is_none() {
                    warn!(key, "server rejected an anonymous download: {failure}");
                    self.counters.lock().record_failure();
                    return None;
                }
                if !refreshed {
                    refreshed = true;
                    self.counters.lock().auth_refreshes += 1;
                    if self.credentials.force_refresh().await.is_some() {
                        debug!(key, "credential refreshed after {failure}; retrying");
                        continue;
                    }
                    warn!(key, "credential refresh after {failure} yielded nothing");
                }
            }

            if !policy.should_retry(attempt, class) {
                warn!(key, attempt, %class, "asset download failed: {failure}");
                self.counters.lock().record_failure();
                return None;
            }
            let delay = policy.backoff_delay(attempt);
            warn!(key, attempt, %class, ?delay, "asset download failed: {failure}; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        key: &str,
        url: &Url,
        credential: Option<&Credential>,
        generation: u64,
    ) -> Result<CacheEntry, DownloadFailure> {
        let mut request = self
            .http
            .get(url.clone())
            .timeout(self.tuning.request_timeout());
        if let Some(credential) = credential {
            request = request.header(ATTESTATION_HEADER, credential.value.as_str());
        }
        let response = request.send().await.map_err(DownloadFailure::Network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadFailure::Status(status));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let extension = storage::extension_for(url, content_type.as_deref());
        fs::create_dir_all(&self.dir).await?;
        let final_path = storage::final_path(&self.dir, key, &extension);
        let tmp_path = storage::tmp_path(&final_path, self.clock.now_ms());

        if let Err(err) = write_body(&tmp_path, response).await {
            storage::remove_quietly(&tmp_path).await;
            return Err(err);
        }
        let size = match fs::metadata(&tmp_path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                storage::remove_quietly(&tmp_path).await;
                return Err(err.into());
            }
        };
        let min = self.tuning.min_size_bytes;
        if size < min {
            storage::remove_quietly(&tmp_path).await;
            return Err(DownloadFailure::TooSmall { size, min });
        }
        if self.generation() != generation {
            storage::remove_quietly(&tmp_path).await;
            return Err(DownloadFailure::Cancelled);
        }
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            storage::remove_quietly(&tmp_path).await;
            return Err(err.into());
        }

        let entry = CacheEntry {
            key: key.to_string(),
            path: final_path.clone(),
            extension,
            size_bytes: size,
            written_at_ms: self.clock.now_ms(),
        };
        // A clear that slipped in between the check and the rename wins.
        if !self.remember_if_current(entry.clone(), generation) {
            storage::remove_quietly(&final_path).await;
            return Err(DownloadFailure::Cancelled);
        }
        storage::remove_variants(&self.dir, key, Some(&final_path)).await;
        Ok(entry)
    }
}

async fn write_body(path: &Path, response: reqwest::Response) -> Result<u64, DownloadFailure> {
    let file = fs::File::create(path).await?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DownloadFailure::Network)?;
        writer.write_all(&chunk).await?;
        written = written.saturating_add(chunk.len() as u64);
    }
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_failure_classes() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureClass::Unauthorized);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureClass::Unauthorized);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            FailureClass::TransientNetwork
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            FailureClass::TransientNetwork
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureClass::ClientRejected);
        assert_eq!(classify_status(StatusCode::GONE), FailureClass::ClientRejected);
    }

    #[test]
    fn size_failures_are_not_retryable() {
        let failure = DownloadFailure::TooSmall { size: 100, min: 1024 };
        assert_eq!(failure.class(), FailureClass::SizeValidation);
        assert!(!failure.class().is_retryable());
    }
}
