// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The shielded participant contract.

use std::sync::atomic::{AtomicU64, Ordering};

use super::context::TransContext;

/// Unique identifier of a transactional object.
///
/// Allocated once per participant instance; keys the per-transaction local
/// state and deduplicates enlistment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(u64);

static NEXT_PARTICIPANT_ID: AtomicU64 = AtomicU64::new(1);

impl ParticipantId {
    /// Allocates a fresh process-unique id.
    pub fn next() -> Self {
        Self(NEXT_PARTICIPANT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Contract every transactional object implements.
///
/// The runner drives enlisted participants through a two-phase commit:
/// `can_commit` validates read and write sets and acquires write-stamp locks,
/// `commit` publishes and releases, `rollback` discards and releases. The
/// trimmer calls `trim_copies` to retire history no open transaction needs.
pub trait Participant: Send + Sync {
    /// Returns this participant's id.
    fn id(&self) -> ParticipantId;

    /// Returns true iff this object has a non-empty write set in `ctx`.
    fn has_changes(&self, ctx: &TransContext) -> bool;

    /// Validates the read and write sets against the committed state and, on
    /// success, acquires write-stamp locks tagged with `write_stamp`.
    ///
    /// Has no effect beyond lock acquisition and is idempotent for the same
    /// `ctx` and stamp.
    fn can_commit(&self, ctx: &TransContext, write_stamp: u64) -> bool;

    /// Publishes the write set as new version-chain nodes carrying
    /// `write_stamp`, releases the matching locks and clears local state.
    ///
    /// Returns true iff any writes were published. Callers must have seen
    /// `can_commit` succeed with the same stamp.
    fn commit(&self, ctx: &mut TransContext, write_stamp: u64) -> bool;

    /// Clears local state. When `write_stamp` is given (`can_commit` had
    /// acquired locks), releases only locks tagged with that exact stamp.
    fn rollback(&self, ctx: &mut TransContext, write_stamp: Option<u64>);

    /// Drops version-chain nodes older than the newest node whose
    /// `version <= min_open`.
    fn trim_copies(&self, min_open: u64);
}
