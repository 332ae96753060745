// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction layer: context, participant contract and the runner.
//!
//! This module provides atomic, optimistically concurrent transactions with:
//! - Snapshot isolation via the global version clock
//! - Two-phase commit with per-participant write-stamp locks
//! - Automatic retry on conflict and on explicit rollback
//! - Pre-commit hooks, commutative updates and ordered side effects
//!
//! # Key Concepts
//!
//! ## Optimistic two-phase commit
//!
//! Transaction bodies run against a fixed snapshot without blocking anyone.
//! At commit, each enlisted participant validates its reads against the
//! committed state and locks its writes under the transaction's write stamp;
//! only when every participant agrees does the runner publish. A failed
//! validation rolls everything back and reruns the body on a fresh snapshot.
//!
//! ## Flat nesting
//!
//! A transaction started inside a transaction joins it: the inner body runs
//! inline and commits or fails with the outer one. There is no independent
//! inner commit.
//!
//! # Example
//!
//! ```
//! use shielded::{Shield, Shielded};
//!
//! let account = Shielded::new(100i64);
//! let savings = Shielded::new(0i64);
//!
//! Shield::in_transaction(|| {
//!     let amount = 30;
//!     account.modify(|balance| *balance -= amount)?;
//!     savings.modify(|balance| *balance += amount)?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! assert_eq!(account.read().unwrap(), 70);
//! assert_eq!(savings.read().unwrap(), 30);
//! ```

pub(crate) mod context;
mod error;
mod participant;
mod precommit;
mod runner;

pub use context::TransContext;
pub use error::{StmError, StmResult};
pub use participant::{Participant, ParticipantId};
pub use precommit::PreCommitGuard;
pub use runner::{CommitContinuation, Shield};
