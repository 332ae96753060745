// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The transaction runner.
//!
//! `Shield::in_transaction` drives the full lifecycle: install a fresh
//! context, run the body, evaluate pre-commits, resolve commutes, then
//! two-phase commit across every enlisted participant. A conflict or an
//! explicit rollback unwinds the attempt and retries with a new snapshot;
//! retries are unbounded. Any other error rolls back and propagates.
//!
//! Commit sequence for an attempt with changes:
//!
//! 1. `next_write_stamp`, then `can_commit` on each participant in
//!    enlistment order: validation plus write-stamp lock acquisition.
//! 2. Sync side effects, while every lock is still held and nothing is
//!    published: an outside observer still sees the old state, the effect
//!    itself reads the transaction's own view.
//! 3. `commit` on each participant: publish and unlock.
//! 4. Unregister the start stamp, tear down the context, run ordinary side
//!    effects, trigger a trim pass.

use std::cell::Cell;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::clock;

use super::context::{self, SideEffect, TransContext};
use super::error::{StmError, StmResult};
use super::participant::Participant;
use super::precommit::{self, PreCommitGuard};

/// Entry points of the transactional runtime.
///
/// All state is process-global or thread-local; `Shield` is a namespace, not
/// an instance.
pub struct Shield;

impl Shield {
    /// Runs `body` atomically, retrying on conflict, and returns its value
    /// once a commit succeeds.
    ///
    /// A nested call joins the enclosing transaction (flat nesting): the
    /// inner body runs inline and commits together with the outer one.
    ///
    /// `Err(StmError::Conflict)` and `Err(StmError::RolledBack)` returned by
    /// the body trigger a retry with a fresh snapshot; any other error rolls
    /// the attempt back and is returned to the caller.
    pub fn in_transaction<T>(mut body: impl FnMut() -> StmResult<T>) -> StmResult<T> {
        if context::is_active() {
            return body();
        }
        let Validated {
            value,
            write_stamp,
            participants,
            start,
            guard,
        } = Self::run_until_validated(&mut body)?;
        Self::finish_commit(write_stamp, &participants, start, guard);
        Ok(value)
    }

    /// Returns true if the calling thread is inside a transaction.
    #[inline]
    pub fn is_in_transaction() -> bool {
        context::is_active()
    }

    /// Returns the current transaction's start stamp, or `None` outside a
    /// transaction.
    #[inline]
    pub fn current_start_stamp() -> Option<u64> {
        context::with_active(|ctx| ctx.start_stamp())
    }

    /// Registers a participant with the current transaction.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn enlist(participant: Arc<dyn Participant>) {
        context::with_active(|ctx| ctx.enlist(participant))
            .expect("participants can only be enlisted inside a transaction");
    }

    /// Installs a process-wide pre-commit hook.
    ///
    /// Every committing transaction evaluates `predicate` against its own
    /// view between body execution and validation; `action` runs iff the
    /// predicate returns true and read at least one participant this
    /// transaction has changes to. The hook stays installed until the
    /// returned guard is dropped.
    pub fn pre_commit(
        predicate: impl Fn() -> StmResult<bool> + Send + Sync + 'static,
        action: impl Fn() -> StmResult<()> + Send + Sync + 'static,
    ) -> PreCommitGuard {
        precommit::register(predicate, action)
    }

    /// Queues `f` to run after this transaction commits. Dropped if the
    /// attempt rolls back.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn side_effect(f: impl FnOnce() + 'static) {
        context::with_active(|ctx| {
            ctx.push_effect(SideEffect {
                on_commit: Some(Box::new(f)),
                on_rollback: None,
            })
        })
        .expect("side effects can only be queued inside a transaction");
    }

    /// Queues `f` to run if the current attempt rolls back: on conflict,
    /// explicit rollback or error. Dropped on commit.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn rollback_effect(f: impl FnOnce() + 'static) {
        context::with_active(|ctx| {
            ctx.push_effect(SideEffect {
                on_commit: None,
                on_rollback: Some(Box::new(f)),
            })
        })
        .expect("side effects can only be queued inside a transaction");
    }

    /// Queues `f` to run after this transaction validates, while its
    /// write-stamp locks are still held and before anything is published.
    ///
    /// Across threads, sync side effects run in commit order. In a read-only
    /// transaction there are no locks and the effect runs like an ordinary
    /// side effect. The callback may read shielded state (it sees the
    /// transaction's own writes) but must not write or start transactions.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn sync_side_effect(f: impl FnOnce() + 'static) {
        context::with_active(|ctx| ctx.push_sync_effect(Box::new(f)))
            .expect("side effects can only be queued inside a transaction");
    }

    /// Returns the signal that aborts the current attempt; the runner
    /// retries with a fresh snapshot.
    ///
    /// ```ignore
    /// return Err(Shield::rollback());
    /// ```
    #[inline]
    pub fn rollback() -> StmError {
        StmError::RolledBack
    }

    /// Runs `body` up to the point of no return and stops: the transaction
    /// is validated and its write-stamp locks are held, but nothing is
    /// published. The returned continuation finishes the commit, rolls it
    /// back, or inspects the transaction view.
    ///
    /// Conflicts while running the body are retried exactly as in
    /// [`in_transaction`](Self::in_transaction).
    ///
    /// # Panics
    ///
    /// Panics when called inside a transaction.
    pub fn run_to_commit<T>(
        mut body: impl FnMut() -> StmResult<T>,
    ) -> StmResult<(T, CommitContinuation)> {
        assert!(
            !context::is_active(),
            "run_to_commit cannot join a running transaction"
        );
        let Validated {
            value,
            write_stamp,
            participants,
            start,
            guard,
        } = Self::run_until_validated(&mut body)?;
        guard.disarm();
        let ctx = context::take().expect("transaction context vanished");
        Ok((
            value,
            CommitContinuation {
                state: Some(ContState {
                    ctx,
                    participants,
                    write_stamp,
                    start,
                }),
            },
        ))
    }

    /// Retries attempts until one validates; the context is left installed
    /// and, if the transaction has changes, its locks are held.
    fn run_until_validated<T>(
        body: &mut impl FnMut() -> StmResult<T>,
    ) -> StmResult<Validated<T>> {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let start = clock::current();
            clock::register(start);
            context::install(TransContext::new(start));
            let guard = AbortGuard::new();

            match Self::stage(body, &guard) {
                Ok((value, write_stamp, participants)) => {
                    trace!(start_stamp = start, ?write_stamp, "transaction validated");
                    return Ok(Validated {
                        value,
                        write_stamp,
                        participants,
                        start,
                        guard,
                    });
                }
                Err(err) => {
                    let stamp = guard.write_stamp();
                    guard.disarm();
                    Self::abort_attempt(stamp);
                    if err.is_retry() {
                        debug!(attempt, "transaction attempt rolled back, retrying");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One attempt: body, pre-commits, commutes, validation.
    fn stage<T>(
        body: &mut impl FnMut() -> StmResult<T>,
        guard: &AbortGuard,
    ) -> StmResult<(T, Option<u64>, Vec<Arc<dyn Participant>>)> {
        let value = body()?;
        Self::run_pre_commits()?;
        Self::resolve_commutes()?;

        let participants =
            context::with_active(|ctx| ctx.participants()).expect("transaction context vanished");
        let changed = context::with_active(|ctx| {
            participants.iter().any(|p| p.has_changes(ctx))
        })
        .expect("transaction context vanished");

        // Read-only fast path: no stamp, no locks, no publication.
        if !changed {
            context::with_active(|ctx| ctx.seal());
            return Ok((value, None, participants));
        }

        let write_stamp = clock::next_write_stamp();
        guard.set_write_stamp(write_stamp);
        let valid = context::with_active(|ctx| {
            participants.iter().all(|p| p.can_commit(ctx, write_stamp))
        })
        .expect("transaction context vanished");
        if !valid {
            return Err(StmError::Conflict);
        }
        context::with_active(|ctx| ctx.seal());
        Ok((value, Some(write_stamp), participants))
    }

    /// Evaluates every registered pre-commit hook against the current view.
    fn run_pre_commits() -> StmResult<()> {
        for hook in precommit::snapshot() {
            context::with_active(|ctx| ctx.begin_predicate_reads())
                .expect("transaction context vanished");
            let verdict = (hook.predicate)();
            let reads = context::with_active(|ctx| ctx.end_predicate_reads())
                .expect("transaction context vanished");
            if !verdict? {
                continue;
            }
            let watches_changes = context::with_active(|ctx| {
                reads.iter().any(|id| ctx.has_changes_for(*id))
            })
            .expect("transaction context vanished");
            if watches_changes {
                (hook.action)()?;
            }
        }
        Ok(())
    }

    /// Runs the queued commutes, each in a sub-transaction restricted to its
    /// declared participants and reading the latest committed state.
    fn resolve_commutes() -> StmResult<()> {
        let commutes = context::with_active(|ctx| ctx.drain_commutes())
            .expect("transaction context vanished");
        for commute in commutes {
            context::with_active(|ctx| ctx.enter_commute_scope(commute.targets));
            let result = (commute.body)();
            context::with_active(|ctx| ctx.exit_commute_scope());
            result?;
        }
        Ok(())
    }

    /// Publishes a validated attempt and tears the transaction down.
    fn finish_commit(
        write_stamp: Option<u64>,
        participants: &[Arc<dyn Participant>],
        start: u64,
        guard: AbortGuard,
    ) {
        // Locks held, nothing published: sync side effects observe the
        // transaction's own writes while outside readers still see the old
        // state, and their cross-thread order equals commit order.
        let sync_effects = context::with_active(|ctx| ctx.take_sync_effects())
            .expect("transaction context vanished");
        for effect in sync_effects {
            effect();
        }

        if let Some(stamp) = write_stamp {
            context::with_active(|ctx| {
                for participant in participants {
                    participant.commit(ctx, stamp);
                }
            });
            trace!(write_stamp = stamp, "transaction committed");
        }
        guard.disarm();
        clock::unregister(start);

        // Ordinary side effects run outside any transaction.
        let effects = context::take()
            .map(|mut ctx| ctx.take_effects())
            .unwrap_or_default();
        for effect in effects {
            if let Some(f) = effect.on_commit {
                f();
            }
        }

        let min_open = clock::min_open().unwrap_or_else(clock::current);
        for participant in participants {
            participant.trim_copies(min_open);
        }
    }

    /// Rolls the current attempt back: participants release their locks and
    /// local state, the start stamp is unregistered, rollback effects run.
    fn abort_attempt(write_stamp: Option<u64>) {
        let participants = context::with_active(|ctx| ctx.participants()).unwrap_or_default();
        let start = context::with_active(|ctx| {
            for participant in &participants {
                participant.rollback(ctx, write_stamp);
            }
            ctx.start_stamp()
        });
        if let Some(start) = start {
            clock::unregister(start);
        }
        let effects = context::take()
            .map(|mut ctx| ctx.take_effects())
            .unwrap_or_default();
        for effect in effects {
            if let Some(f) = effect.on_rollback {
                f();
            }
        }
    }
}

/// A validated attempt: context installed, locks held if `write_stamp` is
/// set, nothing published yet.
struct Validated<T> {
    value: T,
    write_stamp: Option<u64>,
    participants: Vec<Arc<dyn Participant>>,
    start: u64,
    guard: AbortGuard,
}

/// Rolls the attempt back on unwind unless disarmed.
struct AbortGuard {
    write_stamp: Cell<Option<u64>>,
    armed: Cell<bool>,
}

impl AbortGuard {
    fn new() -> Self {
        Self {
            write_stamp: Cell::new(None),
            armed: Cell::new(true),
        }
    }

    fn set_write_stamp(&self, stamp: u64) {
        self.write_stamp.set(Some(stamp));
    }

    fn write_stamp(&self) -> Option<u64> {
        self.write_stamp.get()
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed.get() {
            Shield::abort_attempt(self.write_stamp.get());
        }
    }
}

struct ContState {
    ctx: TransContext,
    participants: Vec<Arc<dyn Participant>>,
    write_stamp: Option<u64>,
    start: u64,
}

/// A transaction held at the point of no return.
///
/// Produced by [`Shield::run_to_commit`]: validation has succeeded and the
/// write-stamp locks are held, so the commit can no longer fail, but
/// nothing is visible to other threads until [`commit`](Self::commit).
/// Dropping an unfinalized continuation rolls the transaction back.
///
/// The continuation is bound to the creating thread.
pub struct CommitContinuation {
    state: Option<ContState>,
}

impl CommitContinuation {
    /// Publishes the transaction. Fails with
    /// [`StmError::ContinuationCompleted`] if already finalized.
    pub fn commit(&mut self) -> StmResult<()> {
        let state = self.state.take().ok_or(StmError::ContinuationCompleted)?;
        context::install(state.ctx);
        let guard = AbortGuard::new();
        if let Some(stamp) = state.write_stamp {
            guard.set_write_stamp(stamp);
        }
        Shield::finish_commit(state.write_stamp, &state.participants, state.start, guard);
        Ok(())
    }

    /// Abandons the transaction, releasing its locks. Fails with
    /// [`StmError::ContinuationCompleted`] if already finalized.
    pub fn rollback(&mut self) -> StmResult<()> {
        let state = self.state.take().ok_or(StmError::ContinuationCompleted)?;
        context::install(state.ctx);
        Shield::abort_attempt(state.write_stamp);
        Ok(())
    }

    /// Runs `f` with the held transaction's context installed, so shielded
    /// reads observe the validated view, buffered writes included.
    ///
    /// The context is sealed: attempting to write panics.
    pub fn in_context<R>(&mut self, f: impl FnOnce() -> R) -> StmResult<R> {
        let state = self.state.take().ok_or(StmError::ContinuationCompleted)?;
        let ContState {
            ctx,
            participants,
            write_stamp,
            start,
        } = state;
        context::install(ctx);
        let _restore = RestoreContext {
            slot: &mut self.state,
            participants: Some(participants),
            write_stamp,
            start,
        };
        Ok(f())
    }

    /// Returns true once the continuation has committed or rolled back.
    pub fn is_completed(&self) -> bool {
        self.state.is_none()
    }
}

impl Drop for CommitContinuation {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            context::install(state.ctx);
            Shield::abort_attempt(state.write_stamp);
        }
    }
}

/// Returns the context from the thread-local slot to the continuation, even
/// if the inspected closure panics.
struct RestoreContext<'a> {
    slot: &'a mut Option<ContState>,
    participants: Option<Vec<Arc<dyn Participant>>>,
    write_stamp: Option<u64>,
    start: u64,
}

impl Drop for RestoreContext<'_> {
    fn drop(&mut self) {
        let ctx = context::take().expect("continuation context vanished");
        *self.slot = Some(ContState {
            ctx,
            participants: self.participants.take().expect("context restored twice"),
            write_stamp: self.write_stamp,
            start: self.start,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::Shielded;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_commit_returns_body_value() {
        let cell = Shielded::new(1);
        let out = Shield::in_transaction(|| {
            cell.assign(2)?;
            Ok("done")
        })
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(cell.read().unwrap(), 2);
    }

    #[test]
    fn test_queries_outside_transaction() {
        assert!(!Shield::is_in_transaction());
        assert_eq!(Shield::current_start_stamp(), None);
    }

    #[test]
    fn test_nested_transaction_joins() {
        let cell = Shielded::new(0);
        let out = Shield::in_transaction(|| {
            assert!(Shield::is_in_transaction());
            let outer = Shield::current_start_stamp();
            Shield::in_transaction(|| {
                assert_eq!(Shield::current_start_stamp(), outer);
                cell.assign(3)
            })?;
            cell.read()
        })
        .unwrap();
        assert_eq!(out, 3);
    }

    #[test]
    fn test_explicit_rollback_retries() {
        let cell = Shielded::new(0);
        let attempts = AtomicU64::new(0);
        Shield::in_transaction(|| {
            cell.assign(1)?;
            if attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(Shield::rollback());
            }
            Ok(())
        })
        .unwrap();
        assert!(attempts.load(Ordering::Relaxed) >= 2);
        assert_eq!(cell.read().unwrap(), 1);
    }

    #[test]
    fn test_user_error_rolls_back_and_propagates() {
        let cell = Shielded::new(5);
        let committed = Arc::new(AtomicBool::new(false));
        let rolled_back = Arc::new(AtomicBool::new(false));

        let c = Arc::clone(&committed);
        let r = Arc::clone(&rolled_back);
        let result: StmResult<()> = Shield::in_transaction(move || {
            cell.assign(6)?;
            let c = Arc::clone(&c);
            let r = Arc::clone(&r);
            Shield::side_effect(move || c.store(true, Ordering::Relaxed));
            Shield::rollback_effect(move || r.store(true, Ordering::Relaxed));
            Err(StmError::user("fatal"))
        });

        assert!(result.is_err());
        assert!(!committed.load(Ordering::Relaxed));
        assert!(rolled_back.load(Ordering::Relaxed));
    }

    #[test]
    fn test_read_only_transaction_runs_effects_in_order() {
        let cell = Shielded::new(9);
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        Shield::in_transaction(|| {
            let _ = cell.read()?;
            let l1 = Arc::clone(&l1);
            let l2 = Arc::clone(&l2);
            Shield::sync_side_effect(move || l1.lock().unwrap().push("sync"));
            Shield::side_effect(move || l2.lock().unwrap().push("after"));
            Ok(())
        })
        .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["sync", "after"]);
    }

    #[test]
    fn test_counter_parallel_increments() {
        let cell = Arc::new(Shielded::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..125 {
                        Shield::in_transaction(|| cell.modify(|n| *n += 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(cell.read().unwrap(), 1000);
    }

    #[test]
    fn test_commuted_counter_parallel_increments() {
        let cell = Arc::new(Shielded::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..125 {
                        Shield::in_transaction(|| cell.commute(|n| *n += 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(cell.read().unwrap(), 1000);
    }

    #[test]
    fn test_snapshot_read_forces_retry() {
        let cell = Arc::new(Shielded::new(0u64));
        let attempts = AtomicU64::new(0);

        let interfering = Arc::clone(&cell);
        Shield::in_transaction(|| {
            let seen = cell.read()?;
            if attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                // A concurrent writer commits between our read and commit.
                let interfering = Arc::clone(&interfering);
                thread::spawn(move || {
                    Shield::in_transaction(|| interfering.assign(1)).unwrap()
                })
                .join()
                .expect("writer thread panicked");
            }
            cell.assign(seen + 10)
        })
        .unwrap();

        assert!(attempts.load(Ordering::Relaxed) >= 2);
        assert_eq!(cell.read().unwrap(), 11);
    }

    #[test]
    fn test_no_odds_pre_commit() {
        let cell = Arc::new(Shielded::new(0i64));

        let watched = Arc::clone(&cell);
        let _guard = Shield::pre_commit(
            move || Ok(watched.read()? & 1 == 1),
            || Err(StmError::user("odd total rejected")),
        );

        let failures = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..10)
            .map(|chunk| {
                let cell = Arc::clone(&cell);
                let failures = Arc::clone(&failures);
                thread::spawn(move || {
                    for i in (chunk * 10 + 1)..=(chunk * 10 + 10) {
                        let result = Shield::in_transaction(|| cell.modify(|n| *n += i));
                        if result.is_err() {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(failures.load(Ordering::Relaxed), 50);
        assert_eq!(cell.read().unwrap(), 2550);
    }

    #[test]
    fn test_conservation_pre_commit() {
        let list1 = Arc::new(Shielded::new((1..=100).collect::<Vec<i32>>()));
        let list2 = Arc::new(Shielded::new(Vec::<i32>::new()));

        let w1 = Arc::clone(&list1);
        let w2 = Arc::clone(&list2);
        let _guard = Shield::pre_commit(
            move || Ok(w1.read()?.len() + w2.read()?.len() != 100),
            || Err(StmError::user("conservation violated")),
        );

        let failures = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let list1 = Arc::clone(&list1);
                let list2 = Arc::clone(&list2);
                let failures = Arc::clone(&failures);
                thread::spawn(move || {
                    let result = Shield::in_transaction(|| {
                        let mut from = list1.read()?;
                        let moved = from.remove(0);
                        list1.assign(from)?;
                        if i != 99 {
                            list2.modify(|to| to.push(moved))?;
                        }
                        Ok(())
                    });
                    if result.is_err() {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(failures.load(Ordering::Relaxed), 1);
        assert_eq!(list1.read().unwrap().len(), 1);
        assert_eq!(list2.read().unwrap().len(), 99);
    }

    #[test]
    fn test_sync_side_effect_ordering() {
        let cell = Arc::new(Shielded::new(0u64));
        let log = Arc::new(Mutex::new(Vec::with_capacity(10_000)));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        Shield::in_transaction(|| {
                            let old = cell.read()?;
                            cell.assign(old + 1)?;
                            let log = Arc::clone(&log);
                            Shield::sync_side_effect(move || {
                                log.lock().unwrap().push(old)
                            });
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        let recorded = log.lock().unwrap();
        assert_eq!(recorded.len(), 10_000);
        assert!(
            recorded.windows(2).all(|w| w[0] < w[1]),
            "sync side effects must run in commit order"
        );
        assert_eq!(recorded[0], 0);
        assert_eq!(recorded[9_999], 9_999);
    }

    #[test]
    fn test_commute_degenerates_under_pre_commit() {
        let test_field = Arc::new(Shielded::new(0i64));
        let effect_field = Arc::new(Shielded::new(0i64));
        let violated = Arc::new(AtomicBool::new(false));

        let watched = Arc::clone(&effect_field);
        let checked = Arc::clone(&test_field);
        let flag = Arc::clone(&violated);
        let _guard = Shield::pre_commit(
            move || Ok(watched.read()? > 0),
            move || {
                if checked.read()? % 2 != 0 {
                    flag.store(true, Ordering::Relaxed);
                }
                Ok(())
            },
        );

        let commuter = {
            let test_field = Arc::clone(&test_field);
            let effect_field = Arc::clone(&effect_field);
            thread::spawn(move || {
                for _ in 0..1000 {
                    Shield::in_transaction(|| {
                        if test_field.read()? % 2 == 0 {
                            effect_field.commute(|n| *n += 1)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                }
            })
        };
        let mutator = {
            let test_field = Arc::clone(&test_field);
            thread::spawn(move || {
                for _ in 0..1000 {
                    Shield::in_transaction(|| test_field.modify(|n| *n += 1)).unwrap();
                }
            })
        };
        commuter.join().expect("commuter panicked");
        mutator.join().expect("mutator panicked");

        assert!(
            !violated.load(Ordering::Relaxed),
            "pre-commit action observed an odd value through a commute"
        );
        assert_eq!(test_field.read().unwrap(), 1000);
    }

    #[test]
    fn test_sync_side_effect_sees_unpublished_state() {
        let cell = Arc::new(Shielded::new(0));

        let inner = Arc::clone(&cell);
        Shield::in_transaction(move || {
            inner.assign(10)?;
            let inner = Arc::clone(&inner);
            Shield::sync_side_effect(move || {
                let outside = {
                    let probe = Arc::clone(&inner);
                    thread::spawn(move || probe.read().unwrap())
                        .join()
                        .expect("probe thread panicked")
                };
                assert_eq!(outside, 0, "commit must not be visible before publication");
                assert_eq!(inner.read().unwrap(), 10, "own writes must be visible");
            });
            Ok(())
        })
        .unwrap();

        assert_eq!(cell.read().unwrap(), 10);
    }

    #[test]
    fn test_run_to_commit_holds_publication() {
        let cell = Shielded::new(0);

        let writer = cell.clone();
        let (value, mut cont) = Shield::run_to_commit(move || {
            writer.assign(5)?;
            Ok(7)
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(cell.read().unwrap(), 0);
        assert!(!cont.is_completed());

        let reader = cell.clone();
        let seen = cont.in_context(move || reader.read().unwrap()).unwrap();
        assert_eq!(seen, 5);

        cont.commit().unwrap();
        assert!(cont.is_completed());
        assert_eq!(cell.read().unwrap(), 5);

        assert!(matches!(
            cont.commit(),
            Err(StmError::ContinuationCompleted)
        ));
        assert!(matches!(
            cont.rollback(),
            Err(StmError::ContinuationCompleted)
        ));
        let reader = cell.clone();
        assert!(matches!(
            cont.in_context(move || reader.read().unwrap()),
            Err(StmError::ContinuationCompleted)
        ));
    }

    #[test]
    fn test_run_to_commit_rollback_releases_locks() {
        let cell = Shielded::new(1);

        let writer = cell.clone();
        let (_, mut cont) = Shield::run_to_commit(move || writer.assign(2)).unwrap();
        cont.rollback().unwrap();
        assert_eq!(cell.read().unwrap(), 1);

        // The lock must be free again for the next writer.
        Shield::in_transaction(|| cell.assign(3)).unwrap();
        assert_eq!(cell.read().unwrap(), 3);
    }

    #[test]
    fn test_dropping_continuation_rolls_back() {
        let cell = Shielded::new(1);
        {
            let writer = cell.clone();
            let _cont = Shield::run_to_commit(move || writer.assign(9)).unwrap();
        }
        assert_eq!(cell.read().unwrap(), 1);
        Shield::in_transaction(|| cell.assign(4)).unwrap();
        assert_eq!(cell.read().unwrap(), 4);
    }

    #[test]
    fn test_isolation_overlapping_writers() {
        use std::sync::Barrier;

        // Two transactions read and write the same cell from the same
        // snapshot; at most one commit survives per round, the other
        // retries, so no increment is ever lost.
        let cell = Arc::new(Shielded::new(0u64));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    for _ in 0..100 {
                        barrier.wait();
                        Shield::in_transaction(|| {
                            let v = cell.read()?;
                            cell.assign(v + 1)
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(cell.read().unwrap(), 200);
    }
}
