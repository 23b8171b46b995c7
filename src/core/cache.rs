use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs4::tokio::AsyncFileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::error::QuotaError;

/// Default time-to-live for cached quota data.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What is stored on disk for each key. Timestamps are epoch millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub fetched_at: i64,
    pub expires_at: i64,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// File-backed key/value store with per-entry TTL.
///
/// Reads never fail: a missing, unparseable or expired file is a miss.
/// Writes are serialized per key by an advisory lock on `<key>.lock` and
/// land atomically through a temp file + rename. If the lock can't be taken
/// within `lock_timeout` the write is skipped.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.entry_path(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return None,
        };
        let entry: CacheEntry<T> = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(e) => {
                debug!(key, error = %e, "Ignoring unreadable cache entry");
                return None;
            }
        };
        if entry.is_expired(Utc::now().timestamp_millis()) {
            debug!(key, "Cache entry expired");
            return None;
        }
        debug!(key, "Cache hit");
        Some(entry.data)
    }

    /// Best-effort write. Failures are logged, never returned.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Err(e) = self.try_set(key, value, ttl).await {
            warn!(key, error = %e, "Skipping cache write");
        }
    }

    /// Remove `prefix` and every `prefix-<scope>` entry.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        let prefix = sanitize_key(prefix);
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let scoped = stem
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('-'));
            if scoped {
                self.invalidate(stem).await;
            }
        }
    }

    /// Remove the entry for `key`. Missing entries are fine.
    pub async fn invalidate(&self, key: &str) {
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(key, "Cache entry invalidated"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(key, error = %e, "Failed to remove cache entry"),
        }
    }

    async fn try_set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), QuotaError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unavailable(format!("create {}: {}", self.dir.display(), e)))?;

        let now = Utc::now().timestamp_millis();
        let entry = CacheEntry {
            data: value,
            fetched_at: now,
            expires_at: now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64),
        };
        let json = serde_json::to_string(&entry).map_err(|e| unavailable(e.to_string()))?;

        let lock = self.acquire_lock(key).await?;

        let path = self.entry_path(key);
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| unavailable(format!("create {}: {}", tmp.display(), e)))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| unavailable(format!("write {}: {}", tmp.display(), e)))?;
        file.sync_all()
            .await
            .map_err(|e| unavailable(format!("sync {}: {}", tmp.display(), e)))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable(format!("rename {}: {}", path.display(), e)))?;

        // Unlocks on drop
        drop(lock);
        debug!(key, ttl_ms = ttl.as_millis() as u64, "Cache entry written");
        Ok(())
    }

    async fn acquire_lock(&self, key: &str) -> Result<tokio::fs::File, QuotaError> {
        let path = self.lock_path(key);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| unavailable(format!("open {}: {}", path.display(), e)))?;

        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(true) => return Ok(file),
                Ok(false) => {}
                Err(e) => return Err(unavailable(format!("lock {}: {}", path.display(), e))),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(unavailable(format!(
                    "timed out after {}ms waiting for {}",
                    self.lock_timeout.as_millis(),
                    path.display()
                )));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize_key(key)))
    }
}

/// `base-<hash>`: one entry per credential or server without putting the
/// secret itself in a file name.
pub fn scoped_key(base: &str, scope: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    format!("{}-{}", base, &format!("{:x}", hasher.finalize())[..12])
}

fn unavailable(msg: String) -> QuotaError {
    QuotaError::CacheUnavailable(msg)
}

/// Keys become file names; anything outside `[A-Za-z0-9._-]` is replaced.
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
