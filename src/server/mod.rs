//! The loopback HTTP listener.
//!
//! `ProxyServer` owns the `TcpListener`, the shared [`CacheStore`] and
//! [`Scheduler`], and a registry of in-flight connection handlers. Only one
//! instance runs at a time per process; `start`/`stop` are idempotent.

mod connection;

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::DEFAULT_HEAD_ONLY_SEGMENT_COUNT;
use crate::datasource::HeadOnlyTracker;
use crate::errors::ProxyError;
use crate::scheduler::Scheduler;

pub use connection::HandlerId;
use connection::handle_connection;

/// Delay before the first post-start prune sweep.
const INITIAL_PRUNE_DELAY: std::time::Duration = std::time::Duration::from_secs(7);

struct RunningServer {
    port: u16,
    listener_task: JoinHandle<()>,
    shutdown: Arc<Notify>,
    handlers: Arc<DashMap<HandlerId, Arc<Notify>>>,
}

/// Process-wide proxy server. Only one runs at a time.
pub struct ProxyServer {
    store: Arc<CacheStore>,
    scheduler: Arc<Scheduler>,
    running: tokio::sync::Mutex<Option<RunningServer>>,
}

impl ProxyServer {
    pub fn new(store: Arc<CacheStore>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            store,
            scheduler,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind and start accepting connections on `127.0.0.1:<port>`. Returns
    /// the bound port on success. Idempotent if already running on the same
    /// port; refuses a different port while running.
    pub async fn start(
        &self,
        port: u16,
        max_bytes: u64,
        head_only: bool,
    ) -> Result<u16, ProxyError> {
        let mut running = self.running.lock().await;

        if let Some(existing) = running.as_ref() {
            if existing.port == port {
                return Ok(port);
            }
            return Err(ProxyError::PortChangeWhileRunning {
                running_port: existing.port,
                requested_port: port,
            });
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|_| ProxyError::PortInUse { port })?;

        let shutdown = Arc::new(Notify::new());
        let handlers: Arc<DashMap<HandlerId, Arc<Notify>>> = Arc::new(DashMap::new());
        let head_only_tracker = head_only
            .then(|| Arc::new(HeadOnlyTracker::new(DEFAULT_HEAD_ONLY_SEGMENT_COUNT)));

        let task_shutdown = shutdown.clone();
        let task_handlers = handlers.clone();
        let store = self.store.clone();
        let scheduler = self.scheduler.clone();
        let next_id = Arc::new(AtomicU64::new(1));

        let listener_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (socket, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };

                        let id = HandlerId(next_id.fetch_add(1, Ordering::Relaxed));
                        let cancel = Arc::new(Notify::new());
                        task_handlers.insert(id, cancel.clone());

                        let store = store.clone();
                        let scheduler = scheduler.clone();
                        let head_only_tracker = head_only_tracker.clone();
                        let handlers_for_cleanup = task_handlers.clone();

                        tokio::spawn(async move {
                            handle_connection(socket, peer, store, scheduler, head_only_tracker, port, cancel)
                                .await;
                            handlers_for_cleanup.remove(&id);
                        });
                    }
                    _ = task_shutdown.notified() => {
                        info!(port, "listener shutting down");
                        break;
                    }
                }
            }
        });

        *running = Some(RunningServer {
            port,
            listener_task,
            shutdown,
            handlers,
        });
        drop(running);

        self.schedule_prune(max_bytes);
        info!(port, max_bytes, head_only, "proxy server listening");
        Ok(port)
    }

    /// Stop the listener and cancel every in-flight handler. A no-op if not
    /// running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            return;
        };
        drop(running);

        server.shutdown.notify_waiters();
        server.listener_task.abort();

        let snapshot: Vec<_> = server
            .handlers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        server.handlers.clear();
        for cancel in snapshot {
            cancel.notify_waiters();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn active_port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|s| s.port)
    }

    /// Purge the cache directory. Works whether or not the server is
    /// currently running.
    pub async fn clear_cache(&self) {
        self.store.clear_all().await;
    }

    fn schedule_prune(&self, max_bytes: u64) {
        let store = self.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INITIAL_PRUNE_DELAY).await;
            store.prune(max_bytes).await;
        });
    }
}
