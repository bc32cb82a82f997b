//! Error taxonomy for the ingestion pipeline.

use thiserror::Error;

/// Errors raised during ingestion and ledger writes.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient node or store I/O. Retried on the next tick, no state change.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// Block at `number` failed to decode. Fatal for that height; nothing was
    /// persisted, so the next tick retries from scratch.
    #[error("malformed block at {number}: {reason}")]
    MalformedBlock { number: u64, reason: String },

    /// Insert hit an already-known hash with non-abandoned status. Benign if
    /// the stored row is already authentic (replayed tick), escalated otherwise.
    #[error("duplicate hash {hash}")]
    DuplicateHash { hash: String },

    /// Attempt to mark a block authentic while its parent is not. Ordering
    /// invariant violation — fatal.
    #[error("orphan block {hash}: parent not authentic")]
    OrphanBlock { hash: String },

    /// No common ancestor within the lookback window. Fatal; ingestion halts
    /// for operator attention.
    #[error("reorg deeper than lookback window of {window} blocks (searched down to {floor})")]
    ReorgTooDeep { window: u64, floor: u64 },

    /// Store-level failure (I/O, constraint, serialization).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Returns `true` if the next tick may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Returns `true` for conditions that must halt ingestion and surface to
    /// the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OrphanBlock { .. } | Self::ReorgTooDeep { .. })
    }
}
