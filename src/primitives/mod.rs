//! Low-level building blocks: the hybrid page latch and the per-worker
//! rollback log.

pub mod latch;
pub mod wal;
