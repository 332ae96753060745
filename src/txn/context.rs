// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Per-thread transaction context.
//!
//! The context is created on transaction entry, mutated only by its owning
//! thread, and torn down on commit or final abort. Participants stow their
//! read and write sets here, keyed by participant id; the runner drives the
//! queues at commit time.
//!
//! The context lives in a thread-local slot so transactional operations need
//! no explicit handle. User closures are never invoked while the slot is
//! borrowed: the slot is re-entered freely from inside a transaction body.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::error::StmResult;
use super::participant::{Participant, ParticipantId};

/// A deferred commutative operation, tagged with the participants its body
/// is allowed to touch.
pub(crate) struct Commute {
    pub(crate) targets: Vec<ParticipantId>,
    pub(crate) body: Box<dyn FnOnce() -> StmResult<()>>,
}

/// An after-commit callback with an optional rollback counterpart.
pub(crate) struct SideEffect {
    pub(crate) on_commit: Option<Box<dyn FnOnce()>>,
    pub(crate) on_rollback: Option<Box<dyn FnOnce()>>,
}

/// Per-thread state of one running transaction.
pub struct TransContext {
    start_stamp: u64,
    enlisted: Vec<Arc<dyn Participant>>,
    enlisted_ids: HashSet<ParticipantId>,
    locals: HashMap<ParticipantId, Box<dyn Any>>,
    commutes: Vec<Commute>,
    effects: Vec<SideEffect>,
    sync_effects: Vec<Box<dyn FnOnce()>>,
    /// When set, read paths record the participants a pre-commit predicate
    /// touches so the runner can intersect them with the write set.
    predicate_reads: Option<HashSet<ParticipantId>>,
    /// When set, a commute sub-transaction is running and may only touch the
    /// listed participants; reads inside it observe the latest committed
    /// state instead of the snapshot.
    commute_scope: Option<Vec<ParticipantId>>,
    /// Set once validation has succeeded; a sealed context accepts reads but
    /// panics on writes (sync side effects, commit continuations).
    sealed: bool,
}

impl TransContext {
    pub(crate) fn new(start_stamp: u64) -> Self {
        Self {
            start_stamp,
            enlisted: Vec::new(),
            enlisted_ids: HashSet::new(),
            locals: HashMap::new(),
            commutes: Vec::new(),
            effects: Vec::new(),
            sync_effects: Vec::new(),
            predicate_reads: None,
            commute_scope: None,
            sealed: false,
        }
    }

    /// Returns the version-clock value sampled when this transaction began.
    #[inline]
    pub fn start_stamp(&self) -> u64 {
        self.start_stamp
    }

    /// Registers a participant with this transaction. Deduplicated; iteration
    /// order is first-touch order.
    pub fn enlist(&mut self, participant: Arc<dyn Participant>) {
        if self.enlisted_ids.insert(participant.id()) {
            self.enlisted.push(participant);
        }
    }

    /// Returns the enlisted participants in first-touch order.
    #[inline]
    pub(crate) fn participants(&self) -> Vec<Arc<dyn Participant>> {
        self.enlisted.clone()
    }

    /// Returns true if the participant with `id` has changes in this context.
    pub(crate) fn has_changes_for(&self, id: ParticipantId) -> bool {
        self.enlisted
            .iter()
            .find(|p| p.id() == id)
            .is_some_and(|p| p.has_changes(self))
    }

    /// Returns this participant's local state, creating it if absent.
    pub fn local_mut<L: Default + 'static>(&mut self, id: ParticipantId) -> &mut L {
        self.locals
            .entry(id)
            .or_insert_with(|| Box::new(L::default()))
            .downcast_mut::<L>()
            .expect("participant local state type mismatch")
    }

    /// Returns this participant's local state, if any was created.
    pub fn local<L: 'static>(&self, id: ParticipantId) -> Option<&L> {
        self.locals
            .get(&id)
            .map(|b| b.downcast_ref::<L>().expect("participant local state type mismatch"))
    }

    /// Removes and returns this participant's local state.
    pub fn take_local<L: 'static>(&mut self, id: ParticipantId) -> Option<L> {
        self.locals.remove(&id).map(|b| {
            *b.downcast::<L>()
                .ok()
                .expect("participant local state type mismatch")
        })
    }

    /// Removes this participant's local state without inspecting it.
    pub fn remove_local(&mut self, id: ParticipantId) {
        self.locals.remove(&id);
    }

    // Commute queue.

    pub(crate) fn queue_commute(&mut self, commute: Commute) {
        self.commutes.push(commute);
    }

    /// Returns true if any queued commute targets `id`.
    pub(crate) fn has_commutes_for(&self, id: ParticipantId) -> bool {
        self.commutes.iter().any(|c| c.targets.contains(&id))
    }

    /// Removes the queued commutes targeting `id`, preserving queue order.
    pub(crate) fn take_commutes_for(&mut self, id: ParticipantId) -> Vec<Commute> {
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for commute in std::mem::take(&mut self.commutes) {
            if commute.targets.contains(&id) {
                taken.push(commute);
            } else {
                kept.push(commute);
            }
        }
        self.commutes = kept;
        taken
    }

    /// Removes every queued commute, preserving queue order.
    pub(crate) fn drain_commutes(&mut self) -> Vec<Commute> {
        std::mem::take(&mut self.commutes)
    }

    // Side-effect queues.

    pub(crate) fn push_effect(&mut self, effect: SideEffect) {
        self.effects.push(effect);
    }

    pub(crate) fn push_sync_effect(&mut self, effect: Box<dyn FnOnce()>) {
        self.sync_effects.push(effect);
    }

    pub(crate) fn take_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn take_sync_effects(&mut self) -> Vec<Box<dyn FnOnce()>> {
        std::mem::take(&mut self.sync_effects)
    }

    // Pre-commit predicate read tracking.

    pub(crate) fn begin_predicate_reads(&mut self) {
        self.predicate_reads = Some(HashSet::new());
    }

    pub(crate) fn end_predicate_reads(&mut self) -> HashSet<ParticipantId> {
        self.predicate_reads.take().unwrap_or_default()
    }

    /// Records a read made while a pre-commit predicate is being evaluated.
    #[inline]
    pub(crate) fn note_predicate_read(&mut self, id: ParticipantId) {
        if let Some(reads) = self.predicate_reads.as_mut() {
            reads.insert(id);
        }
    }

    // Commute sub-transaction scope.

    pub(crate) fn enter_commute_scope(&mut self, targets: Vec<ParticipantId>) {
        self.commute_scope = Some(targets);
    }

    pub(crate) fn exit_commute_scope(&mut self) {
        self.commute_scope = None;
    }

    /// Returns true if a commute sub-transaction is running.
    #[inline]
    pub(crate) fn in_commute_scope(&self) -> bool {
        self.commute_scope.is_some()
    }

    /// Checks that an access to `id` is legal in the current commute scope.
    ///
    /// # Panics
    ///
    /// Panics if a commute body touches a participant it did not declare.
    pub(crate) fn check_commute_scope(&self, id: ParticipantId) {
        if let Some(scope) = &self.commute_scope {
            assert!(
                scope.contains(&id),
                "commute body touched a participant it did not declare"
            );
        }
    }

    // Sealing (post-validation phase).

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// Checks that the context still accepts writes.
    ///
    /// # Panics
    ///
    /// Panics if validation has already succeeded for this context.
    pub(crate) fn check_unsealed(&self) {
        assert!(
            !self.sealed,
            "transaction is sealed for commit; writes are no longer allowed"
        );
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<TransContext>> = const { RefCell::new(None) };
}

/// Runs `f` against the current transaction context, if one is active.
///
/// Callers must not invoke user closures from within `f`; the slot is held
/// borrowed for the duration.
pub(crate) fn with_active<R>(f: impl FnOnce(&mut TransContext) -> R) -> Option<R> {
    CONTEXT.with(|slot| slot.borrow_mut().as_mut().map(f))
}

/// Returns true if the calling thread is inside a transaction.
pub(crate) fn is_active() -> bool {
    CONTEXT.with(|slot| slot.borrow().is_some())
}

/// Installs `ctx` as the calling thread's transaction.
///
/// # Panics
///
/// Panics if a transaction is already installed.
pub(crate) fn install(ctx: TransContext) {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(slot.is_none(), "a transaction is already running on this thread");
        *slot = Some(ctx);
    });
}

/// Removes and returns the calling thread's transaction, if any.
pub(crate) fn take() -> Option<TransContext> {
    CONTEXT.with(|slot| slot.borrow_mut().take())
}
