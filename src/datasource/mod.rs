//! Per-request resolver.
//!
//! One `DataSource` is built per accepted HTTP request. It decides whether
//! the requested resource is a manifest or a segment, whether it is already
//! on disk, and if not, drives a scheduler download that tees bytes to the
//! client and to the cache at the same time.

mod head_only;
mod mime;
mod range;

pub use head_only::HeadOnlyTracker;
pub use mime::mime_for_url;
pub use range::ByteRangeRequest;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::errors::SchedulerError;
use crate::manifest;
use crate::scheduler::{ByteRange, DownloadDelegate, Scheduler};

/// What kind of body the caller should write to the socket.
pub enum ResponseBody {
    /// The whole body is already in memory (cache hit, or a freshly fetched
    /// and rewritten manifest).
    Whole(Bytes),
    /// Body arrives incrementally; the receiver yields chunks in order and
    /// closes when the download completes (successfully or not).
    Streamed(mpsc::Receiver<Bytes>),
}

/// Everything a `ConnectionHandler` needs to write a response.
pub struct ResolvedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub content_length: Option<u64>,
    /// `(lo, hi, total)`; `total` is `None` when the full resource size
    /// isn't known (a cached range entry with no whole-file sibling),
    /// rendered as `Content-Range: bytes lo-hi/*`.
    pub content_range: Option<(u64, u64, Option<u64>)>,
    pub accept_ranges: bool,
    pub body: ResponseBody,
}

/// Resolution failures the connection handler turns into a `404`.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("missing or malformed url parameter")]
    BadUrl,
    #[error("requested range is not satisfiable")]
    BadRange,
    #[error("origin returned an error fetching the manifest")]
    ManifestFetchFailed,
}

pub struct DataSource {
    store: Arc<CacheStore>,
    scheduler: Arc<Scheduler>,
    head_only: Option<Arc<HeadOnlyTracker>>,
    port: u16,
}

impl DataSource {
    pub fn new(
        store: Arc<CacheStore>,
        scheduler: Arc<Scheduler>,
        head_only: Option<Arc<HeadOnlyTracker>>,
        port: u16,
    ) -> Self {
        Self {
            store,
            scheduler,
            head_only,
            port,
        }
    }

    /// Resolve one request. `remote_url` must already be a validated, parsed
    /// absolute URL string; `range` is the parsed `Range:` header, if any.
    pub async fn resolve(
        &self,
        remote_url: &str,
        range: Option<ByteRangeRequest>,
    ) -> Result<ResolvedResponse, ResolveError> {
        if url::Url::parse(remote_url).is_err() {
            return Err(ResolveError::BadUrl);
        }

        if is_manifest_url(remote_url) {
            self.resolve_manifest(remote_url).await
        } else {
            self.resolve_segment(remote_url, range).await
        }
    }

    async fn resolve_manifest(&self, remote_url: &str) -> Result<ResolvedResponse, ResolveError> {
        let key = CacheKey::for_url(remote_url);
        let path = self.store.path_for(&key, "m3u8");

        let body = if let Some(bytes) = self.store.read_all(&path).await {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            let fetched = fetch_whole(&self.scheduler, remote_url)
                .await
                .ok_or(ResolveError::ManifestFetchFailed)?;
            if let Err(e) = self.store.save_atomic(&path, &fetched).await {
                warn!(%remote_url, error = %e, "failed to cache manifest body");
            }
            String::from_utf8_lossy(&fetched).into_owned()
        };

        let rewritten = manifest::rewrite(&body, remote_url, self.port);
        Ok(ResolvedResponse {
            status: 200,
            content_type: "application/vnd.apple.mpegurl",
            content_length: Some(rewritten.len() as u64),
            content_range: None,
            accept_ranges: false,
            body: ResponseBody::Whole(Bytes::from(rewritten)),
        })
    }

    async fn resolve_segment(
        &self,
        remote_url: &str,
        range: Option<ByteRangeRequest>,
    ) -> Result<ResolvedResponse, ResolveError> {
        let ext = crate::cache::extension_for_url(remote_url);

        // A cached range entry is keyed by its exact (lo, hi), so only an
        // identical repeat request can hit it; check it before falling back
        // to the whole-file key.
        if let Some(r) = range {
            let range_key = CacheKey::for_range(remote_url, r.lo, r.hi.unwrap_or(u64::MAX));
            let range_path = self.store.path_for(&range_key, &ext);
            if let Some(size) = self.store.size_of(&range_path).await {
                return self.serve_range_from_disk(&range_path, r.lo, size, remote_url).await;
            }
        }

        let plain_key = CacheKey::for_url(remote_url);
        let plain_path = self.store.path_for(&plain_key, &ext);

        if let Some(size) = self.store.size_of(&plain_path).await {
            return self.serve_from_disk(&plain_path, size, remote_url, range).await;
        }

        self.fetch_segment(remote_url, range, &plain_path, &ext).await
    }

    async fn serve_from_disk(
        &self,
        path: &std::path::Path,
        size: u64,
        remote_url: &str,
        range: Option<ByteRangeRequest>,
    ) -> Result<ResolvedResponse, ResolveError> {
        let bytes = self
            .store
            .read_all(path)
            .await
            .ok_or(ResolveError::BadUrl)?;

        match range {
            Some(range) => {
                let (lo, hi) = range.clamp(size).ok_or(ResolveError::BadRange)?;
                let slice = Bytes::copy_from_slice(&bytes[lo as usize..=hi as usize]);
                Ok(ResolvedResponse {
                    status: 206,
                    content_type: mime_for_url(remote_url),
                    content_length: Some(hi - lo + 1),
                    content_range: Some((lo, hi, Some(size))),
                    accept_ranges: true,
                    body: ResponseBody::Whole(slice),
                })
            }
            None => Ok(ResolvedResponse {
                status: 200,
                content_type: mime_for_url(remote_url),
                content_length: Some(size),
                content_range: None,
                accept_ranges: true,
                body: ResponseBody::Whole(Bytes::from(bytes)),
            }),
        }
    }

    /// Serve a cache entry that was stored under a range-specific key. Only
    /// that exact range's bytes are on disk — the resource's total size was
    /// never learned — so the `Content-Range` total is rendered as `*`.
    async fn serve_range_from_disk(
        &self,
        path: &std::path::Path,
        lo: u64,
        size: u64,
        remote_url: &str,
    ) -> Result<ResolvedResponse, ResolveError> {
        let bytes = self
            .store
            .read_all(path)
            .await
            .ok_or(ResolveError::BadUrl)?;
        let hi = lo + size - 1;
        Ok(ResolvedResponse {
            status: 206,
            content_type: mime_for_url(remote_url),
            content_length: Some(size),
            content_range: Some((lo, hi, None)),
            accept_ranges: true,
            body: ResponseBody::Whole(Bytes::from(bytes)),
        })
    }

    async fn fetch_segment(
        &self,
        remote_url: &str,
        range: Option<ByteRangeRequest>,
        plain_path: &std::path::Path,
        ext: &str,
    ) -> Result<ResolvedResponse, ResolveError> {
        let scheduler_range = range.map(|r| ByteRange { lo: r.lo, hi: r.hi });

        let should_persist = match &self.head_only {
            Some(tracker) => tracker.should_persist(remote_url),
            None => true,
        };

        let (cache_path, cache_key) = if let Some(r) = range {
            let key = CacheKey::for_range(remote_url, r.lo, r.hi.unwrap_or(u64::MAX));
            (self.store.path_for(&key, ext), key)
        } else {
            (plain_path.to_path_buf(), CacheKey::for_url(remote_url))
        };
        trace!(%remote_url, key = cache_key.raw(), "segment cache miss, scheduling download");

        let (client_tx, client_rx) = mpsc::channel::<Bytes>(8);
        let write_handle = if should_persist {
            self.store.open_stream(&cache_path).await.ok()
        } else {
            None
        };

        let delegate = Arc::new(TeeDelegate {
            client_tx,
            write_handle: tokio::sync::Mutex::new(write_handle),
            cache_path: cache_path.clone(),
            status: Arc::new(tokio::sync::Mutex::new(200u16)),
        });

        self.scheduler
            .download(remote_url.to_string(), scheduler_range, delegate);

        // The origin's real status/Content-Range (if any) only arrives
        // asynchronously via the delegate, after these headers are already
        // on the wire, so a range miss is served as a close-delimited `200`
        // rather than a `206` with no `Content-Range`.
        Ok(ResolvedResponse {
            status: 200,
            content_type: mime_for_url(remote_url),
            content_length: None,
            content_range: None,
            accept_ranges: true,
            body: ResponseBody::Streamed(client_rx),
        })
    }
}

/// A manifest URL is identified purely by its path extension.
fn is_manifest_url(url: &str) -> bool {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_default();
    path.to_ascii_lowercase().ends_with(".m3u8")
}

/// One-shot whole-body fetch used for manifest misses.
async fn fetch_whole(scheduler: &Scheduler, url: &str) -> Option<Vec<u8>> {
    // Unbounded: the sender side (on_data) runs to completion before
    // `done.notify_waiters()` fires, so a bounded channel with nobody
    // draining it yet would deadlock on a body larger than its capacity.
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let done = Arc::new(tokio::sync::Notify::new());
    let ok = Arc::new(std::sync::atomic::AtomicBool::new(false));

    struct Collector {
        tx: mpsc::UnboundedSender<Bytes>,
        done: Arc<tokio::sync::Notify>,
        ok: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl DownloadDelegate for Collector {
        async fn on_response(&self, status: u16, _headers: reqwest::header::HeaderMap) {
            self.ok
                .store((200..300).contains(&status), std::sync::atomic::Ordering::SeqCst);
        }
        async fn on_data(&self, chunk: Bytes) {
            let _ = self.tx.send(chunk);
        }
        async fn on_complete(&self, error: Option<SchedulerError>) {
            if error.is_some() {
                self.ok.store(false, std::sync::atomic::Ordering::SeqCst);
            }
            self.done.notify_waiters();
        }
    }

    let delegate = Arc::new(Collector {
        tx,
        done: done.clone(),
        ok: ok.clone(),
    });
    scheduler.download(url.to_string(), None, delegate);

    done.notified().await;
    let mut out = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        out.extend_from_slice(&chunk);
    }
    if ok.load(std::sync::atomic::Ordering::SeqCst) {
        Some(out)
    } else {
        None
    }
}

/// Tees every chunk from the scheduler to the client channel and to the
/// cache write handle at the same time.
struct TeeDelegate {
    client_tx: mpsc::Sender<Bytes>,
    write_handle: tokio::sync::Mutex<Option<crate::cache::WriteHandle>>,
    cache_path: std::path::PathBuf,
    status: Arc<tokio::sync::Mutex<u16>>,
}

#[async_trait]
impl DownloadDelegate for TeeDelegate {
    async fn on_response(&self, status: u16, _headers: reqwest::header::HeaderMap) {
        *self.status.lock().await = status;
        if !(200..300).contains(&status) {
            // Origin rejected the range/request; drop any partial write.
            if let Some(handle) = self.write_handle.lock().await.take() {
                handle.abort().await;
            }
        }
    }

    async fn on_data(&self, chunk: Bytes) {
        if let Some(handle) = self.write_handle.lock().await.as_mut() {
            if let Err(e) = handle.write(&chunk).await {
                warn!(path = %self.cache_path.display(), error = %e, "cache write failed mid-stream");
            }
        }
        let _ = self.client_tx.send(chunk).await;
    }

    async fn on_complete(&self, error: Option<SchedulerError>) {
        let handle = self.write_handle.lock().await.take();
        match (handle, error) {
            (Some(handle), None) => {
                if let Err(e) = handle.finish().await {
                    warn!(path = %self.cache_path.display(), error = %e, "failed to finalize cache entry");
                }
            }
            (Some(handle), Some(_)) => {
                handle.abort().await;
            }
            (None, _) => {}
        }
        // client_tx is dropped with `self`, closing the stream to the socket.
    }
}
