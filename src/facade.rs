//! The three host-facing operations.
//!
//! Process-wide state lives behind two static cells: an `OnceCell` that
//! lazily builds the shared [`CacheStore`]/[`Scheduler`]/[`ProxyServer`] on
//! first use, and a couple of atomics that track the port a caller intends
//! to run on even while the listener is still binding (see DESIGN.md for
//! why "running" is set optimistically rather than only after bind
//! succeeds).

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::cache::CacheStore;
use crate::config::{Config, DEFAULT_MAX_CACHE_BYTES, DEFAULT_PORT};
use crate::errors::{ProxyError, ProxyResult};
use crate::manifest::encode_proxy_url;
use crate::scheduler::Scheduler;
use crate::server::ProxyServer;

static ACTIVE_PORT: AtomicU16 = AtomicU16::new(DEFAULT_PORT);
static RUNNING: AtomicBool = AtomicBool::new(false);
static SERVER: OnceCell<Arc<ProxyServer>> = OnceCell::const_new();

async fn server() -> Arc<ProxyServer> {
    SERVER
        .get_or_init(|| async {
            let config = Config::load().unwrap_or_else(|e| {
                warn!(error = %e, "failed to load config, using defaults");
                Config::default()
            });
            let store = Arc::new(CacheStore::new(config.server.cache_root.clone()).await);
            let scheduler = Arc::new(Scheduler::new());
            Arc::new(ProxyServer::new(store, scheduler))
        })
        .await
        .clone()
}

/// Start (or idempotently confirm) the listener. Defaults: `port=9000`,
/// `max_bytes=1 GiB`, `head_only=false`.
///
/// `active_port` is updated synchronously before the bind completes, so a
/// `convert_url` call racing with an in-flight `start_server` still embeds
/// the intended port rather than falling back to the raw remote URL.
pub async fn start_server(
    port: Option<u16>,
    max_bytes: Option<u64>,
    head_only: Option<bool>,
) -> ProxyResult<()> {
    let port = port.unwrap_or(DEFAULT_PORT);
    let max_bytes = max_bytes.unwrap_or(DEFAULT_MAX_CACHE_BYTES);
    let head_only = head_only.unwrap_or(false);

    ACTIVE_PORT.store(port, Ordering::SeqCst);
    RUNNING.store(true, Ordering::SeqCst);

    let server = server().await;
    match server.start(port, max_bytes, head_only).await {
        Ok(_) => Ok(()),
        Err(e) => {
            if !matches!(e, ProxyError::PortChangeWhileRunning { .. }) {
                RUNNING.store(false, Ordering::SeqCst);
                ACTIVE_PORT.store(DEFAULT_PORT, Ordering::SeqCst);
            }
            Err(e)
        }
    }
}

/// Stop the listener, if running. Not part of the three-call public
/// surface, but required to make `start_server` genuinely restartable in
/// tests and host applications.
pub async fn stop_server() {
    if let Some(server) = SERVER.get() {
        server.stop().await;
    }
    RUNNING.store(false, Ordering::SeqCst);
    ACTIVE_PORT.store(DEFAULT_PORT, Ordering::SeqCst);
}

/// Rewrite a remote URL into a proxied one, or pass it through unchanged.
pub fn convert_url(remote_url: &str, is_cacheable: Option<bool>) -> String {
    if !is_cacheable.unwrap_or(true) {
        return remote_url.to_string();
    }
    if !RUNNING.load(Ordering::SeqCst) {
        return remote_url.to_string();
    }
    encode_proxy_url(remote_url, ACTIVE_PORT.load(Ordering::SeqCst))
}

/// Purge every cached entry.
pub async fn clear_cache() {
    let server = server().await;
    server.clear_cache().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn convert_url_falls_back_when_not_running() {
        stop_server().await;
        let out = convert_url("http://origin/seg.ts", None);
        assert_eq!(out, "http://origin/seg.ts");
    }

    #[tokio::test]
    #[serial]
    async fn convert_url_skips_proxy_when_not_cacheable() {
        start_server(Some(19101), None, None).await.unwrap();
        let out = convert_url("http://origin/seg.ts", Some(false));
        assert_eq!(out, "http://origin/seg.ts");
        stop_server().await;
    }

    #[tokio::test]
    #[serial]
    async fn convert_url_embeds_active_port_once_running() {
        start_server(Some(19102), None, None).await.unwrap();
        let out = convert_url("http://origin/seg.ts", None);
        assert!(out.starts_with("http://127.0.0.1:19102/proxy?url="));
        stop_server().await;
    }

    #[tokio::test]
    #[serial]
    async fn restarting_on_same_port_is_idempotent() {
        start_server(Some(19103), None, None).await.unwrap();
        start_server(Some(19103), None, None).await.unwrap();
        stop_server().await;
    }

    #[tokio::test]
    #[serial]
    async fn changing_port_while_running_is_rejected() {
        start_server(Some(19104), None, None).await.unwrap();
        let err = start_server(Some(19105), None, None).await.unwrap_err();
        assert_eq!(err.code(), "PORT_CHANGE_WHILE_RUNNING");
        stop_server().await;
    }
}
