//! Error types for the erasure-coded storage core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the erasure-coded storage core.
///
/// Invariant breaches (out-of-order write completion, double completion,
/// pin leaks) are not represented here: they indicate a logic bug in the
/// core and are asserted fatally at the point of detection.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Geometry / Codec Errors
    // =========================================================================
    /// Stripe geometry rejected at construction
    #[error("invalid stripe geometry: {0}")]
    InvalidGeometry(String),

    /// Bad or inconsistent codec profile
    #[error("invalid codec profile: {0}")]
    InvalidProfile(String),

    /// Fewer shards available than the codec requires
    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Codec reported unrecoverable loss
    #[error("decode failed: {0}")]
    DecodeFailure(String),

    /// Encode attempted on a slice that is not page-aligned
    #[error("encode slice not page aligned: offset {offset}, length {length}")]
    BadAlignment { offset: u64, length: u64 },

    // =========================================================================
    // Extent / Buffer Errors
    // =========================================================================
    /// A requested byte range is not fully covered by buffers
    #[error("gap in extent range [{offset}, +{length})")]
    Gap { offset: u64, length: u64 },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// A peer read or write failed; recoverable by replanning
    #[error("backend I/O error on shard {shard}: {reason}")]
    BackendIo { shard: u8, reason: String },

    /// Hash-info attribute blob could not be decoded
    #[error("failed to decode hash info: {0}")]
    HashInfoDecode(String),

    /// Consistency check found a mismatch
    #[error("consistency mismatch on {oid}: {reason}")]
    Inconsistent { oid: String, reason: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
