//! Error types for contigbuf.

use thiserror::Error;

/// Result type alias using contigbuf's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument is unusable (zero size, misaligned
    /// range, undersized shared buffer, missing transfer direction).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Memory or segment-table storage could not be allocated.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The validated contiguous device-address run is shorter than the
    /// requested buffer size.
    #[error("contiguous mapping too small: {got}/{need} bytes")]
    ContiguityViolation {
        /// Bytes the buffer needs.
        need: usize,
        /// Bytes the longest contiguous run actually covers.
        got: usize,
    },

    /// Device-address translation or mapping failed.
    #[error("device mapping failed: {0}")]
    Io(String),

    /// An operation was issued against a buffer in the wrong lifecycle
    /// state (double map, unmap while unmapped, export of borrowed
    /// memory). The buffer's own state is left intact.
    #[error("invalid buffer state: {0}")]
    InvalidState(&'static str),
}
