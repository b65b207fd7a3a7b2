//! Content-addressed disk cache.
//!
//! Every cacheable response — a whole segment, a byte range of an fMP4, or a
//! freshly fetched manifest body — is stored as one regular file under
//! `cache_root`, named `<sha256-hex>.<ext>`. There is no index file; the
//! filesystem is the index.

pub mod key;

pub use key::{extension_for_url, CacheKey};

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::errors::CacheError;

/// A content-addressed file store with atomic and streaming writes, and LRU
/// pruning against a byte-size budget.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    /// Best-effort: a failure here is logged, not fatal.
    pub async fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Err(e) = fs::create_dir_all(&root).await {
            warn!(path = %root.display(), error = %e, "failed to create cache root");
        }
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pure function, no I/O.
    pub fn path_for(&self, key: &CacheKey, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key.hex_digest(), ext))
    }

    /// True only if the file is present AND non-empty; a zero-byte file is
    /// treated as absent.
    pub async fn exists(&self, path: &Path) -> bool {
        matches!(fs::metadata(path).await, Ok(meta) if meta.len() > 0)
    }

    pub async fn size_of(&self, path: &Path) -> Option<u64> {
        fs::metadata(path)
            .await
            .ok()
            .map(|m| m.len())
            .filter(|&len| len > 0)
    }

    /// Whole-file read, used for manifests only. An empty file is treated as
    /// absent and removed.
    pub async fn read_all(&self, path: &Path) -> Option<Vec<u8>> {
        let bytes = fs::read(path).await.ok()?;
        if bytes.is_empty() {
            trace!(path = %path.display(), "dropping empty cache entry on read");
            let _ = fs::remove_file(path).await;
            return None;
        }
        Some(bytes)
    }

    /// Write the whole buffer atomically: write to a sibling temp file, then
    /// rename over the destination.
    pub async fn save_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let tmp = sibling_tmp_path(path);
        let mut file = File::create(&tmp)
            .await
            .map_err(|e| CacheError::io(&tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CacheError::io(&tmp, e))?;
        file.flush().await.map_err(|e| CacheError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, path)
            .await
            .map_err(|e| CacheError::io(path, e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved cache entry atomically");
        Ok(())
    }

    /// Open an append-only streaming write handle: the file is created
    /// (truncated if present) immediately, so a crash mid-stream leaves a
    /// partial file rather than nothing — callers must treat an aborted
    /// handle as a delete, never serve a partial file as complete.
    pub async fn open_stream(&self, path: &Path) -> Result<WriteHandle, CacheError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| CacheError::io(path, e))?;
        Ok(WriteHandle {
            file,
            path: path.to_path_buf(),
        })
    }

    pub async fn delete(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to delete cache entry");
            }
        }
    }

    /// Remove the whole cache directory and recreate it empty.
    pub async fn clear_all(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.root.display(), error = %e, "failed to clear cache directory");
            }
        }
        if let Err(e) = fs::create_dir_all(&self.root).await {
            warn!(path = %self.root.display(), error = %e, "failed to recreate cache directory");
        }
    }

    /// Enforce `max_bytes`: enumerate entries, and if the total size is at
    /// or above budget, delete oldest-by-mtime files until it drops below.
    /// Best-effort throughout: any per-file error is logged and traversal
    /// continues.
    pub async fn prune(&self, max_bytes: u64) {
        let mut entries = match self.list_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "prune: failed to list cache directory");
                return;
            }
        };

        let total: u64 = entries.iter().map(|e| e.size).sum();
        if total < max_bytes {
            trace!(total, max_bytes, "prune: under budget, nothing to do");
            return;
        }

        entries.sort_by_key(|e| e.mtime);

        let mut running = total;
        for entry in entries {
            if running <= max_bytes {
                break;
            }
            match fs::remove_file(&entry.path).await {
                Ok(()) => {
                    running = running.saturating_sub(entry.size);
                    debug!(path = %entry.path.display(), "pruned cache entry");
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "prune: failed to remove entry");
                }
            }
        }
    }

    async fn list_entries(&self) -> std::io::Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        while let Some(entry) = dir.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push(Entry {
                path: entry.path(),
                size: meta.len(),
                mtime,
            });
        }
        Ok(out)
    }
}

struct Entry {
    path: PathBuf,
    size: u64,
    mtime: SystemTime,
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = tmp
        .file_name()
        .map(|n| format!("{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| "cache.tmp".to_string());
    tmp.set_file_name(file_name);
    tmp
}

/// An append-only handle returned by [`CacheStore::open_stream`]. Every
/// chunk the scheduler hands the data source is appended here as it is
/// forwarded to the socket.
pub struct WriteHandle {
    file: File,
    path: PathBuf,
}

impl WriteHandle {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| CacheError::io(&self.path, e))
    }

    /// Successful completion: flush and close, leaving the file as the
    /// permanent cache entry. Its mtime (just touched by the writes above)
    /// becomes its LRU key.
    pub async fn finish(mut self) -> Result<(), CacheError> {
        self.file
            .flush()
            .await
            .map_err(|e| CacheError::io(&self.path, e))
    }

    /// Failure path: delete the partial file so it is never served as
    /// complete.
    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove aborted partial write");
            }
        }
    }
}
