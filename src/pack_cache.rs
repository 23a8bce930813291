//! Pack cache: a content-addressed store of already-assembled pack
//! streams, keyed by the fingerprint computed in [`crate::parser`]. Sharded
//! two hex chars deep so no single directory accumulates too many entries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::Error;
use crate::lock::{LockGuard, LockManager};
use crate::pktline::ChunkFilter;
use crate::repo::touch_path;

const SERVE_CHUNK_SIZE: usize = 64 * 1024;

/// How often [`PackCacheCleaner::clean`] is allowed to actually scan and
/// evict, regardless of how often it's called.
const CLEAN_THROTTLE: Duration = Duration::from_secs(60);

pub struct PackCache {
    root: PathBuf,
    fingerprint: String,
    path: PathBuf,
    locks: Arc<LockManager>,
}

impl PackCache {
    pub fn new(root: PathBuf, locks: Arc<LockManager>, fingerprint: &str) -> Self {
        let shard = &fingerprint[..fingerprint.len().min(2)];
        let path = root.join(shard).join(fingerprint);
        PackCache {
            root,
            fingerprint: fingerprint.to_string(),
            path,
            locks,
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    }

    pub async fn read_lock(&self) -> Result<LockGuard, Error> {
        self.locks.acquire_shared(&self.lock_path()).await
    }

    pub async fn write_lock(&self) -> Result<LockGuard, Error> {
        self.locks.acquire_exclusive(&self.lock_path()).await
    }

    /// A valid entry exists, is non-empty, and ends with the pkt-line flush
    /// marker: anything else (missing, zero-length, truncated mid-write) is
    /// treated as a miss.
    pub fn exists(&self) -> bool {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return false;
        };
        if meta.len() == 0 {
            return false;
        }
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return false;
        };
        use std::io::{Read, Seek, SeekFrom};
        if file.seek(SeekFrom::End(-4)).is_err() {
            return false;
        }
        let mut tail = [0u8; 4];
        if file.read_exact(&mut tail).is_err() {
            return false;
        }
        &tail == b"0000"
    }

    fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Stream the cached entry to `writer` in 64 KiB chunks. Always bumps
    /// the entry's mtime for LRU purposes, whether the read finished or the
    /// client disconnected partway through.
    pub async fn serve<W>(&self, mut writer: W) -> Result<(), Error>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let total_size = self.size();
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; SERVE_CHUNK_SIZE];

        let result = loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(Error::Io(e)),
            };
            sent += n as u64;
            if let Err(e) = writer.write_all(&buf[..n]).await {
                tracing::warn!(fingerprint = %self.fingerprint, "connection reset while serving pack cache");
                let _ = e;
                break Ok(());
            }
        };

        touch_path(&self.path);

        if sent != total_size {
            tracing::warn!(
                fingerprint = %self.fingerprint,
                sent,
                total_size,
                "incomplete_pack_cache_read"
            );
        }

        result
    }

    /// Drain `read_fn`-style source (anything implementing `AsyncRead`)
    /// through the side-band-2 chunk filter and write the result to the
    /// cache entry. On any failure, unlinks the partial file so a later
    /// request tries again from scratch rather than serving a corrupt
    /// entry.
    pub async fn populate<R>(&self, reader: R) -> Result<(), Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result: Result<(), Error> = async {
            let mut file = tokio::fs::File::create(&self.path).await?;
            let mut filter = ChunkFilter::new(reader);
            while let Some(frame) = filter.next_frame().await? {
                file.write_all(&frame).await?;
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&self.path).await;
        }
        result
    }
}

/// Singleton eviction sweep across the whole pack-cache tree, throttled to
/// once per minute.
pub struct PackCacheCleaner {
    root: PathBuf,
    max_size: u64,
    locks: Arc<LockManager>,
}

impl PackCacheCleaner {
    pub fn new(root: PathBuf, max_size: u64, locks: Arc<LockManager>) -> Self {
        PackCacheCleaner {
            root,
            max_size,
            locks,
        }
    }

    fn lockfile(&self) -> PathBuf {
        self.root.join("clean.lock")
    }

    /// Fire-and-forget entry point: spawns the actual cleanup as a detached
    /// task so callers (the cached upload-pack path) don't wait on it.
    pub fn clean_in_background(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(e) = self.clean().await {
                tracing::warn!(error = %e, "pack cache cleanup failed");
            }
        });
    }

    async fn clean(&self) -> Result<(), Error> {
        let lockfile = self.lockfile();
        if let Ok(meta) = tokio::fs::metadata(&lockfile).await {
            if let Ok(modified) = meta.modified() {
                if SystemTime::now()
                    .duration_since(modified)
                    .map(|age| age < CLEAN_THROTTLE)
                    .unwrap_or(false)
                {
                    tracing::debug!("no need to cleanup pack cache yet");
                    return Ok(());
                }
            }
        }

        let _guard = self.locks.acquire_exclusive(&lockfile).await?;
        if let Some(parent) = lockfile.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&lockfile, []).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        touch_path(&lockfile);
        self.sweep().await
    }

    async fn sweep(&self) -> Result<(), Error> {
        let mut entries = Vec::new();
        let mut total_size: u64 = 0;

        let mut shard_reader = match tokio::fs::read_dir(&self.root).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(shard) = shard_reader.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut file_reader = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = file_reader.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let meta = entry.metadata().await?;
                total_size += meta.len();
                entries.push((entry.path(), meta.len(), meta.modified()?));
            }
        }

        tracing::info!(size = total_size, max_size = self.max_size, n_entry = entries.len(), "pack cache size");

        if total_size < self.max_size {
            return Ok(());
        }

        // Oldest (smallest mtime) first: evict from the tail of a
        // most-recent-first sort.
        entries.sort_by(|a, b| b.2.cmp(&a.2));

        let mut removed = 0usize;
        let mut freed = 0u64;
        while total_size - freed >= self.max_size {
            let Some((path, size, _mtime)) = entries.pop() else {
                break;
            };
            freed += size;
            removed += 1;
            if let Some(fingerprint) = path.file_name().and_then(|n| n.to_str()) {
                let cache = PackCache::new(self.root.clone(), self.locks.clone(), fingerprint);
                let _guard = cache.write_lock().await?;
                let _ = tokio::fs::remove_file(&path).await;
            }
        }

        tracing::info!(size = total_size, freed, removed, "pack cache cleaning");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<LockManager> {
        Arc::new(LockManager::new())
    }

    #[tokio::test]
    async fn populate_then_serve_round_trips_pack_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackCache::new(dir.path().to_path_buf(), manager(), "abc123");
        assert!(!cache.exists());

        let mut body = Vec::new();
        body.extend(crate::pktline::encode(b"PACK-DATA", Some(crate::pktline::Channel::Data)));
        body.extend(crate::pktline::flush());

        cache.populate(&body[..]).await.unwrap();
        assert!(cache.exists());

        let mut out = Vec::new();
        cache.serve(&mut out).await.unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn populate_failure_unlinks_partial_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackCache::new(dir.path().to_path_buf(), manager(), "deadbeef");

        // truncated stream: no terminating flush
        let body = crate::pktline::encode(b"PACK-DATA", Some(crate::pktline::Channel::Data));
        let err = cache.populate(&body[..]).await;
        assert!(err.is_err());
        assert!(!cache.path.exists());
    }

    #[test]
    fn corrupted_entry_without_trailing_flush_is_not_valid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackCache::new(dir.path().to_path_buf(), manager(), "feedface");
        std::fs::write(&cache.path, b"not a real pack stream").unwrap();
        assert!(!cache.exists());
    }
}
