use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::warn;
use url::Url;
use walkdir::WalkDir;

use super::{CacheEntry, ClearReport};
use crate::error::CacheError;

const MAX_KEY_LEN: usize = 128;
const DEFAULT_EXTENSION: &str = "bin";

pub(super) fn validate_key(key: &str) -> Result<(), CacheError> {
    let reason = if key.is_empty() {
        Some("must not be empty")
    } else if key.len() > MAX_KEY_LEN {
        Some("longer than 128 bytes")
    } else if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        Some("only ASCII letters, digits, '-' and '_' are allowed")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(CacheError::InvalidKey {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

pub(super) fn parse_url(raw: &str) -> Result<Url, CacheError> {
    let url = Url::parse(raw).map_err(|e| CacheError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(CacheError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

pub(super) fn final_path(dir: &Path, key: &str, extension: &str) -> PathBuf {
    dir.join(format!("{key}.{extension}"))
}

/// `<final>.<epoch_ms>.tmp`, next to the final file so the rename stays on one filesystem.
pub(super) fn tmp_path(final_path: &Path, now_ms: i64) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(format!(".{now_ms}.tmp"));
    PathBuf::from(name)
}

/// Picks the on-disk extension: URL path first, then the response content type.
pub(super) fn extension_for(url: &Url, content_type: Option<&str>) -> String {
    let from_path = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| is_extension(ext));
    if let Some(ext) = from_path {
        return ext;
    }
    content_type
        .and_then(extension_for_mime)
        .unwrap_or(DEFAULT_EXTENSION)
        .to_string()
}

fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let ext = match mime.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/avif" => "avif",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "video/mp4" => "mp4",
        "application/json" => "json",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => return None,
    };
    Some(ext)
}

fn is_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.len() <= 8
        && ext != "tmp"
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Extension of `file_name` when it is a final file for `key`.
fn variant_extension<'a>(file_name: &'a str, key: &str) -> Option<&'a str> {
    let ext = file_name.strip_prefix(key)?.strip_prefix('.')?;
    is_extension(ext).then_some(ext)
}

async fn entry_from_disk(key: &str, path: PathBuf, extension: &str, now_ms: i64) -> Option<CacheEntry> {
    let meta = fs::metadata(&path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    let written_at_ms = meta
        .modified()
        .ok()
        .map(|time| DateTime::<Utc>::from(time).timestamp_millis())
        .unwrap_or(now_ms);
    Some(CacheEntry {
        key: key.to_string(),
        path,
        extension: extension.to_string(),
        size_bytes: meta.len(),
        written_at_ms,
    })
}

/// Finds a final file for `key` on disk, trying the hinted extension before scanning.
pub(super) async fn probe(dir: &Path, key: &str, hint: Option<&str>, now_ms: i64) -> Option<CacheEntry> {
    if let Some(ext) = hint {
        if let Some(entry) = entry_from_disk(key, final_path(dir, key, ext), ext, now_ms).await {
            return Some(entry);
        }
    }
    let mut entries = fs::read_dir(dir).await.ok()?;
    while let Ok(Some(dirent)) = entries.next_entry().await {
        let name = dirent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(ext) = variant_extension(name, key) {
            if Some(ext) == hint {
                continue;
            }
            if let Some(entry) = entry_from_disk(key, dirent.path(), ext, now_ms).await {
                return Some(entry);
            }
        }
    }
    None
}

/// Deletes final files for `key` other than `keep`. Returns how many were removed.
pub(super) async fn remove_variants(dir: &Path, key: &str, keep: Option<&Path>) -> usize {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(dirent)) = entries.next_entry().await {
        let path = dirent.path();
        if Some(path.as_path()) == keep {
            continue;
        }
        let matches = dirent
            .file_name()
            .to_str()
            .and_then(|name| variant_extension(name, key))
            .is_some();
        if !matches {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(err) => warn!("failed to remove {}: {err}", path.display()),
        }
    }
    removed
}

pub(super) async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", path.display());
        }
    }
}

/// Deletes everything below `dir`, keeping `dir` itself. Blocking; run it off the runtime.
pub(super) fn purge_dir(dir: &Path) -> ClearReport {
    let mut report = ClearReport::default();
    if !dir.is_dir() {
        return report;
    }
    let walker = WalkDir::new(dir).min_depth(1).contents_first(true);
    for entry in walker.into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if entry.file_type().is_dir() {
            if let Err(err) = std::fs::remove_dir(path) {
                warn!("failed to remove directory {}: {err}", path.display());
            }
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(path) {
            Ok(()) => {
                report.deleted_count += 1;
                report.freed_bytes = report.freed_bytes.saturating_add(size);
            }
            Err(err) => warn!("failed to remove {}: {err}", path.display()),
        }
    }
    report
}
