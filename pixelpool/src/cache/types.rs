//! Cache error types.

use thiserror::Error;

/// Errors reported by the buffer cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A release was attempted for an unknown key, or for an entry whose
    /// reference count was already zero.
    ///
    /// This is a precondition violation — it means reference counting is
    /// broken somewhere — and callers should treat it as fatal rather than
    /// tolerate it. Lease drops assert on it in debug builds.
    #[error("invalid release: {0}")]
    InvalidRelease(String),
}
