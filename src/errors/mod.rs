//! Centralized error handling for the proxy.
//!
//! A public, host-facing error type with stable codes, plus internal error
//! types for the cache and scheduler that are logged and swallowed rather
//! than propagated — cache maintenance must never fail playback.

pub mod types;

pub use types::*;

/// Convenience alias for results surfaced across the host boundary.
pub type ProxyResult<T> = Result<T, ProxyError>;
