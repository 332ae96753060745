// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Shielded: software transactional memory with snapshot isolation
//!
//! This crate lets application threads group reads and writes of shared
//! in-memory state into atomic, optimistically concurrent transactions.
//! Either all effects of a transaction become visible at once or none do;
//! conflicts are detected at commit time and retried automatically.
//!
//! The building blocks:
//!
//! - [`Shielded<T>`]: a transactional single value backed by a version chain
//! - [`ShieldedDict<K, V>`]: a transactional keyed map with per-key locks
//! - [`Shield`]: the runner, with `in_transaction`, pre-commit hooks, commutes,
//!   side effects, rollback, commit continuations
//!
//! ```
//! use shielded::{Shield, Shielded};
//!
//! let counter = Shielded::new(0u64);
//! Shield::in_transaction(|| counter.modify(|n| *n += 1)).unwrap();
//! assert_eq!(counter.read().unwrap(), 1);
//! ```

pub mod clock;
pub mod mvcc;
pub mod txn;

pub use clock::{OpenTransactions, VersionClock};
pub use mvcc::{Shielded, ShieldedDict, VersionNode};
pub use txn::{
    CommitContinuation, Participant, ParticipantId, PreCommitGuard, Shield, StmError, StmResult,
    TransContext,
};
