//! Error type definitions for the proxy.
//!
//! This module defines the error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;

/// Top-level, host-facing error type.
///
/// Every variant carries a stable [`code`](ProxyError::code) in addition to
/// its `Display` message so a host binding layer can switch on behavior
/// without string matching (`PORT_IN_USE`, `PORT_CHANGE_WHILE_RUNNING`, ...).
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Binding the listener socket failed (port already in use).
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    /// `start_server` was called with a different port while already running.
    #[error(
        "server is already running on port {running_port}; call stop() before changing to {requested_port}"
    )]
    PortChangeWhileRunning {
        running_port: u16,
        requested_port: u16,
    },

    /// Underlying filesystem error, surfaced only for operations the host
    /// cares about (e.g. `clear_cache`); cache maintenance never propagates
    /// these during request serving.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error for conditions that should not occur in
    /// practice but still need a typed representation at the host boundary.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Stable machine-readable code for host bindings.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::PortInUse { .. } => "PORT_IN_USE",
            ProxyError::PortChangeWhileRunning { .. } => "PORT_CHANGE_WHILE_RUNNING",
            ProxyError::Io(_) => "IO_ERROR",
            ProxyError::Internal { .. } => "INTERNAL",
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Cache layer errors. Never surfaced to the socket — always logged and
/// swallowed by the caller, since cache maintenance must never fail
/// playback.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Download scheduler / origin fetch errors, surfaced to the `DataSource`
/// via `on_complete(Some(err))`.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("origin returned status {0}")]
    BadStatus(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("task was cancelled")]
    Cancelled,
}
