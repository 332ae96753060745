// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The shielded cell: a single-variable MVCC register.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::txn::context::{self, Commute};
use crate::txn::{Participant, ParticipantId, StmResult, TransContext};

use super::chain::{self, VersionNode};
use super::spin::Backoff;

/// Per-transaction local state of one cell.
struct CellLocal<T> {
    /// Head version observed when the committed chain was first consulted.
    /// Validation requires it unchanged and not past the snapshot, which
    /// also catches a writer that was still between validation and
    /// publication when we read.
    read_version: Option<u64>,
    /// Head version observed by a commute sub-transaction; validation
    /// requires the head unchanged at commit.
    commute_version: Option<u64>,
    /// Buffered new value, if the transaction wrote the cell.
    value: Option<T>,
}

impl<T> Default for CellLocal<T> {
    fn default() -> Self {
        Self {
            read_version: None,
            commute_version: None,
            value: None,
        }
    }
}

struct CellState<T> {
    id: ParticipantId,
    /// Head of the version chain. Never empty: the cell is born with a
    /// version-0 node holding the initial value.
    head: RwLock<Arc<VersionNode<T>>>,
    /// Pending writer's stamp; 0 means unlocked. At most one in-flight
    /// writer per cell.
    write_stamp: AtomicU64,
}

/// A transactionally shielded single value.
///
/// Reads inside a transaction observe the snapshot fixed by the transaction's
/// start stamp; writes are buffered and published atomically at commit.
/// Reading outside a transaction returns the latest committed value.
///
/// Handles are cheap to clone and share the same underlying cell.
///
/// # Example
///
/// ```
/// use shielded::{Shield, Shielded};
///
/// let counter = Shielded::new(0);
/// let n = Shield::in_transaction(|| {
///     counter.modify(|n| *n += 1)?;
///     counter.read()
/// })
/// .unwrap();
/// assert_eq!(n, 1);
/// ```
pub struct Shielded<T> {
    inner: Arc<CellState<T>>,
}

impl<T> Clone for Shielded<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum ReadPlan<T> {
    Buffered(T),
    Snapshot(u64),
    Latest,
}

impl<T: Clone + Send + Sync + 'static> Shielded<T> {
    /// Creates a cell holding `initial`.
    ///
    /// The initial value is visible to every transaction, however old its
    /// snapshot: it is published at version 0.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(CellState {
                id: ParticipantId::next(),
                head: RwLock::new(Arc::new(VersionNode::new(0, initial, None))),
                write_stamp: AtomicU64::new(0),
            }),
        }
    }

    /// Reads the cell.
    ///
    /// Inside a transaction this observes the transaction's snapshot and
    /// records the read for commit-time validation; a value written earlier
    /// in the same transaction is returned instead (read-your-writes).
    /// Outside a transaction it returns the latest committed value.
    pub fn read(&self) -> StmResult<T> {
        if !context::is_active() {
            return Ok(self.inner.committed_head().value().clone());
        }
        self.prepare_access()?;

        let plan = context::with_active(|ctx| {
            ctx.note_predicate_read(self.inner.id);
            let start = ctx.start_stamp();
            let in_scope = ctx.in_commute_scope();
            let local = ctx.local_mut::<CellLocal<T>>(self.inner.id);
            if let Some(value) = &local.value {
                ReadPlan::Buffered(value.clone())
            } else if in_scope {
                ReadPlan::Latest
            } else {
                ReadPlan::Snapshot(start)
            }
        })
        .expect("transaction context vanished during read");

        match plan {
            ReadPlan::Buffered(value) => Ok(value),
            ReadPlan::Snapshot(stamp) => {
                let head = self.inner.committed_head();
                let node = chain::visible_in(&head, stamp)
                    .expect("version chain trimmed past an open reader");
                let value = node.value().clone();
                context::with_active(|ctx| {
                    let local = ctx.local_mut::<CellLocal<T>>(self.inner.id);
                    if local.read_version.is_none() {
                        local.read_version = Some(head.version());
                    }
                });
                Ok(value)
            }
            ReadPlan::Latest => {
                // Commute sub-transaction: read the latest committed value
                // and remember the observed head version for validation.
                let head = self.inner.committed_head();
                context::with_active(|ctx| {
                    let local = ctx.local_mut::<CellLocal<T>>(self.inner.id);
                    if local.commute_version.is_none() {
                        local.commute_version = Some(head.version());
                    }
                });
                Ok(head.value().clone())
            }
        }
    }

    /// Alias for [`read`](Self::read).
    #[inline]
    pub fn value(&self) -> StmResult<T> {
        self.read()
    }

    /// Buffers `value` as the cell's new content.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn assign(&self, value: T) -> StmResult<()> {
        assert!(
            context::is_active(),
            "shielded cells can only be written inside a transaction"
        );
        self.prepare_access()?;
        context::with_active(|ctx| {
            ctx.check_unsealed();
            ctx.local_mut::<CellLocal<T>>(self.inner.id).value = Some(value);
        });
        Ok(())
    }

    /// Applies `f` to the cell's current content and buffers the result.
    ///
    /// Reads the cell first, so the transaction validates against concurrent
    /// writers of the old value.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn modify(&self, f: impl FnOnce(&mut T)) -> StmResult<()> {
        assert!(
            context::is_active(),
            "shielded cells can only be written inside a transaction"
        );
        let mut current = self.read()?;
        f(&mut current);
        context::with_active(|ctx| {
            ctx.check_unsealed();
            ctx.local_mut::<CellLocal<T>>(self.inner.id).value = Some(current);
        });
        Ok(())
    }

    /// Queues `f` as a commutative update of this cell.
    ///
    /// The transaction body does not read the cell; `f` runs in a commute
    /// sub-transaction immediately before validation, against the latest
    /// committed value. Commuted updates on the same cell therefore do not
    /// conflict with each other. If the cell has already been touched by this
    /// transaction, or is touched later (including by a pre-commit
    /// predicate), the commute degenerates into an ordinary read and write.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn commute(&self, f: impl Fn(&mut T) + 'static) -> StmResult<()> {
        assert!(
            context::is_active(),
            "shielded cells can only be commuted inside a transaction"
        );
        let degenerate = context::with_active(|ctx| {
            ctx.check_unsealed();
            ctx.check_commute_scope(self.inner.id);
            ctx.local::<CellLocal<T>>(self.inner.id).is_some_and(|local| {
                local.read_version.is_some()
                    || local.value.is_some()
                    || local.commute_version.is_some()
            })
        })
        .expect("transaction context vanished during commute");

        if degenerate {
            return self.modify(|v| f(v));
        }

        let handle = self.clone();
        context::with_active(|ctx| {
            ctx.enlist(self.inner.clone() as Arc<dyn Participant>);
            ctx.queue_commute(Commute {
                targets: vec![self.inner.id],
                body: Box::new(move || handle.modify(|v| f(v))),
            });
        });
        Ok(())
    }

    /// Checks the commute scope, runs any commutes this access degenerates,
    /// waits out a conflicting pending writer and enlists the cell.
    fn prepare_access(&self) -> StmResult<()> {
        let id = self.inner.id;
        let pending = context::with_active(|ctx| {
            ctx.check_commute_scope(id);
            if !ctx.in_commute_scope() && ctx.has_commutes_for(id) {
                ctx.take_commutes_for(id)
            } else {
                Vec::new()
            }
        })
        .expect("shielded access outside a transaction");

        // Degenerated commutes run as ordinary operations, in queue order,
        // before the access that displaced them.
        for commute in pending {
            (commute.body)()?;
        }

        let (start, in_scope) = context::with_active(|ctx| (ctx.start_stamp(), ctx.in_commute_scope()))
            .expect("transaction context vanished");

        // A pending writer ordered before our snapshot blocks us: once it
        // publishes, its version belongs in our view. A commute read waits
        // for any writer, since it is about to observe the latest commit.
        let mut backoff = Backoff::new();
        loop {
            let stamp = self.inner.write_stamp.load(Ordering::Acquire);
            let blocked = stamp != 0 && (in_scope || stamp <= start);
            if !blocked {
                break;
            }
            backoff.snooze();
        }

        context::with_active(|ctx| ctx.enlist(self.inner.clone() as Arc<dyn Participant>));
        Ok(())
    }
}

impl<T> CellState<T> {
    fn committed_head(&self) -> Arc<VersionNode<T>> {
        self.head.read().clone()
    }
}

impl<T: Clone + Send + Sync + 'static> Participant for CellState<T> {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn has_changes(&self, ctx: &TransContext) -> bool {
        ctx.local::<CellLocal<T>>(self.id)
            .is_some_and(|local| local.value.is_some())
    }

    fn can_commit(&self, ctx: &TransContext, write_stamp: u64) -> bool {
        let Some(local) = ctx.local::<CellLocal<T>>(self.id) else {
            return true;
        };
        let head_version = self.head.read().version();
        // A changed head means a commit landed since we read, whether we saw
        // its writer coming or not; a head past the snapshot means the value
        // we read has been overwritten.
        if let Some(observed) = local.read_version {
            if head_version != observed || head_version > ctx.start_stamp() {
                return false;
            }
        }
        if let Some(observed) = local.commute_version {
            if head_version != observed {
                return false;
            }
        }
        if local.value.is_some() {
            match self
                .write_stamp
                .compare_exchange(0, write_stamp, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => true,
                // Idempotent re-validation of the same context.
                Err(current) => current == write_stamp,
            }
        } else {
            true
        }
    }

    fn commit(&self, ctx: &mut TransContext, write_stamp: u64) -> bool {
        let Some(local) = ctx.take_local::<CellLocal<T>>(self.id) else {
            return false;
        };
        let Some(value) = local.value else {
            return false;
        };
        {
            let mut head = self.head.write();
            *head = Arc::new(VersionNode::new(write_stamp, value, Some(head.clone())));
        }
        // Publish before unlocking, so a reader spinning on the lock finds
        // the new version once it proceeds.
        self.write_stamp
            .compare_exchange(write_stamp, 0, Ordering::AcqRel, Ordering::Acquire)
            .expect("cell write-stamp lock lost during commit");
        true
    }

    fn rollback(&self, ctx: &mut TransContext, write_stamp: Option<u64>) {
        ctx.remove_local(self.id);
        if let Some(stamp) = write_stamp {
            let _ = self
                .write_stamp
                .compare_exchange(stamp, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn trim_copies(&self, min_open: u64) {
        let head = self.committed_head();
        chain::trim(&head, min_open);
    }
}

impl<T: Clone + Send + Sync + Default + 'static> Default for Shielded<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
