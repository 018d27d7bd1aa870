//! Durable (L2) tier: one JSON file per entry under a content-addressed path.

use super::backend::CacheBackend;
use crate::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    expires_at_ms: u64,
    /// Base64 of the stored bytes.
    value: String,
}

/// Filesystem tier. The entry for key `k` lives at
/// `<dir>/<h[..2]>/<h>` where `h = sha256(k)`.
///
/// Writes go to a uniquely named temporary file that is renamed into place,
/// so readers never observe a partial entry; concurrent writers to one key
/// race safely and the last rename wins. Corrupt or truncated entries read
/// as misses and are deleted.
pub struct DiskCache {
    dir: PathBuf,
    repairs: AtomicU64,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            repairs: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest: String = Sha256::digest(key.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        self.dir.join(&digest[..2]).join(digest)
    }

    async fn remove_quietly(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove L2 entry");
            }
        }
    }

    async fn repair(&self, path: &Path, reason: &str) {
        warn!(path = %path.display(), reason, "corrupt L2 entry, deleting");
        self.repairs.fetch_add(1, Ordering::Relaxed);
        Self::remove_quietly(path).await;
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: DiskEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                self.repair(&path, &e.to_string()).await;
                return Ok(None);
            }
        };
        if now_ms() >= entry.expires_at_ms {
            debug!(key, "L2 entry expired");
            Self::remove_quietly(&path).await;
            return Ok(None);
        }
        match STANDARD.decode(entry.value.as_bytes()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                self.repair(&path, &e.to_string()).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let path = self.entry_path(key);
        let parent = path.parent().unwrap_or(&self.dir).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let entry = DiskEntry {
            expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
            value: STANDARD.encode(value),
        };
        let body = serde_json::to_vec(&entry)?;

        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            Self::remove_quietly(&tmp).await;
            return Err(e.into());
        }
        debug!(key, bytes = value.len(), "L2 entry written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes entry files shard by shard. In-flight temporary files are
    /// left alone, so a write racing a clear may survive it.
    async fn clear(&self) -> Result<()> {
        let mut shards = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0usize;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let mut files = match tokio::fs::read_dir(shard.path()).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(file) = files.next_entry().await? {
                if file.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                match tokio::fs::remove_file(file.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            // Fails harmlessly when a concurrent writer repopulated the shard.
            let _ = tokio::fs::remove_dir(shard.path()).await;
        }
        debug!(dir = %self.dir.display(), removed, "L2 cleared");
        Ok(())
    }

    /// Counts entry files, expired ones included.
    async fn len(&self) -> Result<usize> {
        let mut count = 0;
        let mut shards = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = match tokio::fs::read_dir(shard.path()).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(file) = files.next_entry().await? {
                if !file.file_name().to_string_lossy().starts_with('.') {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "disk"
    }

    fn repairs(&self) -> u64 {
        self.repairs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_round_trip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.set("key", b"value", TTL).await.unwrap();
        assert_eq!(cache.get("key").await.unwrap(), Some(b"value".to_vec()));

        let path = cache.entry_path("key");
        let shard = path.parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(shard.len(), 2);
        assert!(name.starts_with(&shard));
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.set("key", b"value", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("key").await.unwrap(), None);
        assert!(!cache.entry_path("key").exists());
    }

    #[tokio::test]
    async fn test_corrupt_entry_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.set("key", b"value", TTL).await.unwrap();
        let path = cache.entry_path("key");
        std::fs::write(&path, b"{\"expires_at_ms\": 12").unwrap();

        assert_eq!(cache.get("key").await.unwrap(), None);
        assert!(!path.exists());
        assert_eq!(cache.repairs(), 1);

        // the key is writable again afterwards
        cache.set("key", b"fresh", TTL).await.unwrap();
        assert_eq!(cache.get("key").await.unwrap(), Some(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_keeps_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("l2");
        let cache = DiskCache::new(&root);
        cache.set("a", b"1", TTL).await.unwrap();
        cache.set("b", b"2", TTL).await.unwrap();
        cache.clear().await.unwrap();
        assert!(root.is_dir());
        assert_eq!(cache.len().await.unwrap(), 0);
        assert!(!cache.delete("a").await.unwrap());
    }
}
