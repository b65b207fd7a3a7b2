//! Bounded-concurrency download scheduler.
//!
//! A process-wide singleton that caps concurrent BULK (heavy segment)
//! downloads behind a semaphore while dispatching PRIORITY downloads
//! (manifests, small probes) immediately. Permit acquisition is funnelled
//! through a single serial broker task so no more than one acquisition is
//! in flight at a time even though many BULK tasks may be queued.

mod priority;

pub use priority::{classify, Priority};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, trace, warn};

use crate::errors::SchedulerError;

/// Default BULK concurrency bound.
pub const MAX_CONCURRENT_BULK: usize = 32;

/// Per-request segment fetch deadline.
pub const SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Manifest fetch deadline.
pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(10);

/// An inclusive byte range requested from the origin.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub lo: u64,
    pub hi: Option<u64>,
}

/// Callbacks a download's owner receives as the fetch progresses.
#[async_trait]
pub trait DownloadDelegate: Send + Sync {
    async fn on_response(&self, status: u16, headers: reqwest::header::HeaderMap);
    async fn on_data(&self, chunk: Bytes);
    async fn on_complete(&self, error: Option<SchedulerError>);
}

/// A handle to one outstanding fetch. `cancel()` is idempotent and safe to
/// call whether the task is waiting for a BULK permit or already streaming.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct PermitRequest {
    reply: oneshot::Sender<tokio::sync::OwnedSemaphorePermit>,
}

/// The process-wide download scheduler.
pub struct Scheduler {
    client: Client,
    semaphore: Arc<Semaphore>,
    permit_requests: mpsc::UnboundedSender<PermitRequest>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_bulk_limit(MAX_CONCURRENT_BULK)
    }

    pub fn with_bulk_limit(max_concurrent_bulk: usize) -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(max_concurrent_bulk.max(1))
            .build()
            .expect("reqwest client builder should not fail with default TLS backend");

        let semaphore = Arc::new(Semaphore::new(max_concurrent_bulk));
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_permit_broker(semaphore.clone(), rx);

        Self {
            client,
            semaphore,
            permit_requests: tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of BULK permits currently available.
    pub fn available_bulk_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Submit a fetch. `url`'s priority class is decided at submission time.
    pub fn download(
        &self,
        url: String,
        range: Option<ByteRange>,
        delegate: Arc<dyn DownloadDelegate>,
    ) -> TaskHandle {
        let priority = classify(&url, range);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        };

        let client = self.client.clone();
        let task_handle = handle.clone();
        let permit_requests = self.permit_requests.clone();

        tokio::spawn(async move {
            run_download(client, url, range, priority, delegate, task_handle, permit_requests)
                .await;
        });

        handle
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Single task that owns the semaphore and grants permits strictly one
/// acquisition at a time.
fn spawn_permit_broker(
    semaphore: Arc<Semaphore>,
    mut requests: mpsc::UnboundedReceiver<PermitRequest>,
) {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            match semaphore.clone().acquire_owned().await {
                Ok(permit) => {
                    // Receiver may have vanished (task cancelled while queued);
                    // dropping the permit here releases it immediately.
                    let _ = request.reply.send(permit);
                }
                Err(_) => break, // semaphore closed, scheduler shutting down
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_download(
    client: Client,
    url: String,
    range: Option<ByteRange>,
    priority: Priority,
    delegate: Arc<dyn DownloadDelegate>,
    handle: TaskHandle,
    permit_requests: mpsc::UnboundedSender<PermitRequest>,
) {
    if handle.is_cancelled() {
        delegate.on_complete(Some(SchedulerError::Cancelled)).await;
        return;
    }

    // BULK tasks must wait for a permit before touching the network; PRIORITY
    // tasks bypass the semaphore entirely.
    let _permit = if priority == Priority::Bulk {
        let (reply_tx, reply_rx) = oneshot::channel();
        if permit_requests.send(PermitRequest { reply: reply_tx }).is_err() {
            delegate
                .on_complete(Some(SchedulerError::Cancelled))
                .await;
            return;
        }

        tokio::select! {
            permit = reply_rx => {
                match permit {
                    Ok(permit) => {
                        if handle.is_cancelled() {
                            drop(permit);
                            delegate.on_complete(Some(SchedulerError::Cancelled)).await;
                            return;
                        }
                        Some(permit)
                    }
                    Err(_) => {
                        delegate.on_complete(Some(SchedulerError::Cancelled)).await;
                        return;
                    }
                }
            }
            _ = handle.notify.notified() => {
                delegate.on_complete(Some(SchedulerError::Cancelled)).await;
                return;
            }
        }
    } else {
        None
    };

    trace!(id = handle.id(), %url, ?priority, "download starting");

    let timeout = if priority == Priority::Priority {
        MANIFEST_TIMEOUT
    } else {
        SEGMENT_TIMEOUT
    };

    let mut request = client.get(&url).timeout(timeout);
    if let Some(range) = range {
        let value = match range.hi {
            Some(hi) => format!("bytes={}-{}", range.lo, hi),
            None => format!("bytes={}-", range.lo),
        };
        request = request.header(reqwest::header::RANGE, value);
    }

    let response = tokio::select! {
        result = request.send() => result,
        _ = handle.notify.notified() => {
            delegate.on_complete(Some(SchedulerError::Cancelled)).await;
            return;
        }
    };

    let response = match response {
        Ok(resp) => resp,
        Err(e) => {
            warn!(id = handle.id(), %url, error = %e, "download transport error");
            delegate
                .on_complete(Some(SchedulerError::Transport(e)))
                .await;
            return;
        }
    };

    let status = response.status();
    delegate.on_response(status.as_u16(), response.headers().clone()).await;

    if !status.is_success() {
        delegate
            .on_complete(Some(SchedulerError::BadStatus(status.as_u16())))
            .await;
        return;
    }

    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            chunk = stream.next() => chunk,
            _ = handle.notify.notified() => {
                delegate.on_complete(Some(SchedulerError::Cancelled)).await;
                return;
            }
        };

        match next {
            Some(Ok(chunk)) => delegate.on_data(chunk).await,
            Some(Err(e)) => {
                delegate
                    .on_complete(Some(SchedulerError::Transport(e)))
                    .await;
                return;
            }
            None => break,
        }
    }

    debug!(id = handle.id(), %url, "download completed");
    delegate.on_complete(None).await;
    // `_permit` (if any) drops here, releasing the slot exactly once on every
    // exit path of this function.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingDelegate {
        chunks: Mutex<Vec<Bytes>>,
        responses: Mutex<Vec<u16>>,
        completions: Mutex<Vec<bool>>,
        notify: Arc<Notify>,
    }

    impl RecordingDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                completions: Mutex::new(Vec::new()),
                notify: Arc::new(Notify::new()),
            })
        }
    }

    #[async_trait]
    impl DownloadDelegate for RecordingDelegate {
        async fn on_response(&self, status: u16, _headers: reqwest::header::HeaderMap) {
            self.responses.lock().unwrap().push(status);
        }
        async fn on_data(&self, chunk: Bytes) {
            self.chunks.lock().unwrap().push(chunk);
        }
        async fn on_complete(&self, error: Option<SchedulerError>) {
            self.completions.lock().unwrap().push(error.is_none());
            self.notify.notify_waiters();
        }
    }

    #[tokio::test]
    async fn bulk_download_streams_body_and_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seg.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'A'; 500]))
            .mount(&server)
            .await;

        let scheduler = Scheduler::new();
        let delegate = RecordingDelegate::new();
        let url = format!("{}/seg.ts", server.uri());
        let handle = scheduler.download(url, None, delegate.clone());
        assert!(handle.id() > 0);

        delegate.notify.notified().await;

        assert_eq!(delegate.responses.lock().unwrap().as_slice(), &[200]);
        assert_eq!(delegate.completions.lock().unwrap().as_slice(), &[true]);
        let total: usize = delegate.chunks.lock().unwrap().iter().map(|c| c.len()).sum();
        assert_eq!(total, 500);
    }

    #[tokio::test]
    async fn bulk_concurrency_is_bounded() {
        let scheduler = Scheduler::with_bulk_limit(4);
        assert_eq!(scheduler.available_bulk_permits(), 4);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let mut handles = Vec::new();
        let mut delegates = Vec::new();
        for i in 0..10 {
            let delegate = RecordingDelegate::new();
            let url = format!("{}/bulk{}", server.uri(), i);
            handles.push(scheduler.download(url, None, delegate.clone()));
            delegates.push(delegate);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.available_bulk_permits(), 0);

        for delegate in &delegates {
            delegate.notify.notified().await;
        }
        assert_eq!(scheduler.available_bulk_permits(), 4);
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_permit_releases_cleanly() {
        let scheduler = Scheduler::with_bulk_limit(1);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let blocker = RecordingDelegate::new();
        let _busy = scheduler.download(format!("{}/busy", server.uri()), None, blocker.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.available_bulk_permits(), 0);

        let waiter = RecordingDelegate::new();
        let waiting_handle =
            scheduler.download(format!("{}/waiting", server.uri()), None, waiter.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiting_handle.cancel();

        waiter.notify.notified().await;
        assert_eq!(waiter.completions.lock().unwrap(), &[false]);
    }
}
