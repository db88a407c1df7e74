//! Shared identifiers and the crate-wide error type.

use std::fmt;

/// Maximum number of workers; bounded by the width of the 2PL read-lock
/// bitmap carried in every tuple header.
pub const MAX_WORKERS: usize = 64;

/// Identifier of a worker thread, in `0..MAX_WORKERS`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct WorkerId(pub u8);

impl WorkerId {
    /// The worker's bit in a 2PL read-lock bitmap.
    pub const fn mask(self) -> u64 {
        1u64 << self.0
    }

    /// Index into per-worker registry tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version-sequence number. Zero addresses the primary tuple of a logical
/// key; any other value addresses a secondary version.
pub type ChainSn = u64;

/// Transaction timestamp drawn from the global clock at `begin`.
pub type Tts = u64;

/// Per-worker monotonic mark of a committed transaction (equal to the
/// transaction's timestamp).
pub type CommitMark = u64;

/// Snapshot acquisition time.
pub type Sat = u64;

#[derive(thiserror::Error, Debug)]
pub enum CadenaError {
    /// Visibility or concurrency conflict; the caller must abort its
    /// transaction.
    #[error("transaction must abort")]
    AbortTx,
    /// Insert found a live, visible tuple under the same key.
    #[error("duplicate key")]
    Duplicate,
    /// Write addressed a key with no visible tuple.
    #[error("not found")]
    NotFound,
    /// The per-worker WAL ring cannot take the worst-case record.
    #[error("wal ring exhausted")]
    WalExhausted,
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, CadenaError>;
