//! Error types for completion, content and codec operations.

use std::time::Duration;

use thiserror::Error;

use crate::cause::Cause;

/// Result type alias for fallible operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// `next()` was called on a cursor whose content is closed and drained.
    #[error("no such element: content is closed")]
    NoSuchElement,

    /// A failure delivered to a callback, surfaced to a blocked caller.
    #[error("failed: {0}")]
    Failed(Cause),

    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),

    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    #[error("invalid stream id {0}: reserved bit set")]
    InvalidStreamId(u32),

    #[error("invalid window delta {0}: exceeds 2^31-1")]
    InvalidWindowDelta(u32),
}

impl Error {
    /// The callback failure behind this error, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Error::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}
