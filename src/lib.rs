//! # Cadena - Multi-Version B-Tree Index
//!
//! Cadena is the multi-version concurrency core of an embedded storage
//! engine: a B-Tree whose leaves co-locate each record's primary tuple with
//! a chain of secondary versions, giving transactional key-value access
//! under Snapshot Isolation with optional Serializable behavior.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use cadena::{Config, TxRegistry, VersionedTree, Worker};
//!
//! let config = Arc::new(Config::default());
//! let registry = Arc::new(TxRegistry::new());
//! let tree = VersionedTree::new(Arc::clone(&config));
//! let mut worker = Worker::new(registry, config)?;
//!
//! tree.insert(&mut worker, b"apple", &[0x01])?;
//! assert_eq!(tree.lookup(&mut worker, b"apple")?, Some(vec![0x01]));
//! # Ok::<(), cadena::CadenaError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Tuple formats**: chained tuples (primary + delta secondaries) and fat
//!   tuples (a chain packed into one slot as a per-attribute delta list).
//! - **Reads**: optimistic primary-visible fast path, pessimistic
//!   chain-walking reconstruction otherwise.
//! - **Writes**: write-locked in-place head mutation, prior images pushed
//!   into fresh secondaries, rollback records in a per-worker WAL ring.
//! - **Garbage collection**: deferred per-write TODOs with a stamped
//!   dangling-pointer fast path, plus page-wise compaction driven by the
//!   global low-water mark.

#![forbid(unsafe_code)]

pub mod btree;
pub mod config;
pub mod mvcc;
pub mod primitives;
pub mod txn;
pub mod types;

// Re-export the main public API
pub use crate::config::{Config, IsolationLevel};
pub use crate::mvcc::gc::{GcStats, SpaceCheckResult};
pub use crate::mvcc::tuple::{DescriptorSlot, TupleFormat, UpdateDescriptor};
pub use crate::mvcc::VersionedTree;
pub use crate::txn::{TxRegistry, Worker};
pub use crate::types::{CadenaError, ChainSn, CommitMark, Result, Sat, Tts, WorkerId};
