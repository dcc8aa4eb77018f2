//! The decode collaborator seam.
//!
//! Turning encoded bytes into pixels is not this crate's business; the
//! [`Decoder`] trait is the boundary. The executor opens the request's byte
//! source on a worker, offers the decoder a recycled storage allocation
//! when one is available, and wraps whatever comes back in a single tagged
//! [`DecodeOutcome`] — success and failure travel the same channel.

mod image;

pub use self::image::ImageDecoder;

use thiserror::Error;

use crate::buffer::{Dimensions, PooledBuffer};
use crate::request::{ByteSource, SourceError};

/// Why a decode produced no buffer.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The request key could not produce a byte source.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The decoder rejected or failed on the input.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The job was cancelled before it started.
    #[error("decode cancelled")]
    Cancelled,

    /// The decode worker panicked.
    #[error("decode worker panicked: {0}")]
    Worker(String),
}

/// The tagged result of one decode attempt.
///
/// One variant, one channel: the controller and aggregator handle success
/// and failure through a single code path instead of mirrored callbacks.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// The decode produced a buffer (reference count still zero; the
    /// controller seeds it on cache insert).
    Decoded(PooledBuffer),
    /// The decode failed; the slot transitions to `Failed`.
    Failed(DecodeError),
}

impl DecodeOutcome {
    /// Returns true for the `Decoded` variant.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Decoded(_))
    }
}

/// Decodes a byte source into a pixel buffer.
///
/// Implementations run inside the executor's blocking workers, so they may
/// block. `recycled` is a storage allocation reclaimed from the cache's
/// free pool; implementations should reuse it when present and are free to
/// ignore it.
pub trait Decoder: Send + Sync + 'static {
    /// Decodes `source` into a buffer no larger than `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Decode`] when the input cannot be decoded.
    fn decode(
        &self,
        source: ByteSource,
        target: Dimensions,
        recycled: Option<Vec<u8>>,
    ) -> Result<PooledBuffer, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Orientation;

    #[test]
    fn test_outcome_is_success() {
        let dims = Dimensions::new(1, 1);
        let buffer = PooledBuffer::new(vec![0u8; 4], dims, Orientation::Deg0);
        assert!(DecodeOutcome::Decoded(buffer).is_success());
        assert!(!DecodeOutcome::Failed(DecodeError::Cancelled).is_success());
    }

    #[test]
    fn test_source_error_converts() {
        let err: DecodeError = SourceError::Unavailable("gone".to_string()).into();
        assert_eq!(format!("{}", err), "source unavailable: gone");
    }
}
