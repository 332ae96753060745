// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The shielded dictionary: a keyed MVCC map.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::txn::context;
use crate::txn::{Participant, ParticipantId, StmError, StmResult, TransContext};

use super::chain::{self, VersionNode};
use super::spin::Backoff;

/// Per-transaction local state of one dictionary.
struct DictLocal<K, V> {
    /// Keys read from the committed state, each with the head version
    /// observed at first read. Validation requires the head unchanged and
    /// not past the snapshot, which also catches a writer that was still
    /// between validation and publication when we read. Version 0 records
    /// a key that had never been written.
    reads: HashMap<K, u64>,
    /// Buffered writes; `None` buffers a removal.
    writes: HashMap<K, Option<V>>,
}

impl<K, V> Default for DictLocal<K, V> {
    fn default() -> Self {
        Self {
            reads: HashMap::new(),
            writes: HashMap::new(),
        }
    }
}

struct DictState<K, V> {
    id: ParticipantId,
    /// Per-key version chains. A chain value of `None` records the key as
    /// absent at that version (a removal), mirroring tombstone entries.
    entries: DashMap<K, Arc<VersionNode<Option<V>>>>,
    /// Per-key pending writer stamps; a key is present only between a
    /// successful `can_commit` and the owning `commit`/`rollback`.
    write_stamps: DashMap<K, u64>,
    /// Keys whose chain grew recently, tagged with the committing stamp, so
    /// the trimmer knows where to look.
    recently_written: DashMap<K, u64>,
}

/// A transactionally shielded keyed map.
///
/// Each key carries its own version chain and its own write-stamp lock, so
/// transactions touching disjoint keys commit without conflicting. Reads
/// inside a transaction observe the snapshot fixed by the start stamp;
/// absent keys read as `None`. Reading outside a transaction returns the
/// latest committed value; writing outside a transaction panics.
///
/// Handles are cheap to clone and share the same underlying map.
pub struct ShieldedDict<K, V> {
    inner: Arc<DictState<K, V>>,
}

impl<K, V> Clone for ShieldedDict<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum ReadPlan<V> {
    Buffered(Option<V>),
    Snapshot(u64),
}

impl<K, V> ShieldedDict<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DictState {
                id: ParticipantId::next(),
                entries: DashMap::new(),
                write_stamps: DashMap::new(),
                recently_written: DashMap::new(),
            }),
        }
    }

    /// Reads the value under `key`; `None` when absent.
    ///
    /// Inside a transaction this observes the snapshot and records the read.
    /// A key written earlier in the same transaction returns the buffered
    /// value, but still fails with a conflict if a newer version committed
    /// since the snapshot (a writable read cannot be validated later, so it
    /// is checked here).
    pub fn get(&self, key: &K) -> StmResult<Option<V>> {
        if !context::is_active() {
            return Ok(self.inner.committed_value(key));
        }
        self.prepare_access(key)?;

        let plan = context::with_active(|ctx| {
            ctx.note_predicate_read(self.inner.id);
            let start = ctx.start_stamp();
            let local = ctx.local_mut::<DictLocal<K, V>>(self.inner.id);
            if let Some(buffered) = local.writes.get(key) {
                ReadPlan::Buffered(buffered.clone())
            } else {
                ReadPlan::Snapshot(start)
            }
        })
        .expect("transaction context vanished during read");

        match plan {
            ReadPlan::Buffered(value) => {
                let start = context::with_active(|ctx| ctx.start_stamp())
                    .expect("transaction context vanished");
                if self.inner.head_version(key) > start {
                    return Err(StmError::Conflict);
                }
                Ok(value)
            }
            ReadPlan::Snapshot(stamp) => {
                let head = self.inner.head(key);
                let observed = head.as_ref().map_or(0, |node| node.version());
                let value = head
                    .and_then(|h| chain::visible_in(&h, stamp))
                    .and_then(|node| node.value().clone());
                context::with_active(|ctx| {
                    ctx.local_mut::<DictLocal<K, V>>(self.inner.id)
                        .reads
                        .entry(key.clone())
                        .or_insert(observed);
                });
                Ok(value)
            }
        }
    }

    /// Returns true if `key` maps to a value.
    pub fn contains_key(&self, key: &K) -> StmResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Buffers `value` under `key`.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn insert(&self, key: K, value: V) -> StmResult<()> {
        self.write(key, Some(value))
    }

    /// Buffers a removal of `key`.
    ///
    /// # Panics
    ///
    /// Panics outside a transaction.
    pub fn remove(&self, key: &K) -> StmResult<()> {
        self.write(key.clone(), None)
    }

    fn write(&self, key: K, value: Option<V>) -> StmResult<()> {
        assert!(
            context::is_active(),
            "shielded dictionaries can only be written inside a transaction"
        );
        self.prepare_access(&key)?;
        context::with_active(|ctx| {
            ctx.check_unsealed();
            ctx.local_mut::<DictLocal<K, V>>(self.inner.id)
                .writes
                .insert(key, value);
        });
        Ok(())
    }

    /// Waits out a conflicting pending writer on `key` and enlists the
    /// dictionary with the current transaction.
    fn prepare_access(&self, key: &K) -> StmResult<()> {
        let start = context::with_active(|ctx| {
            ctx.check_commute_scope(self.inner.id);
            ctx.start_stamp()
        })
        .expect("shielded access outside a transaction");

        let mut backoff = Backoff::new();
        loop {
            let pending = self.inner.write_stamps.get(key).map(|entry| *entry.value());
            match pending {
                Some(stamp) if stamp <= start => backoff.snooze(),
                _ => break,
            }
        }

        context::with_active(|ctx| ctx.enlist(self.inner.clone() as Arc<dyn Participant>));
        Ok(())
    }
}

impl<K, V> Default for ShieldedDict<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DictState<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn head(&self, key: &K) -> Option<Arc<VersionNode<Option<V>>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Version of the newest committed node for `key`; 0 when the key has
    /// never been written.
    fn head_version(&self, key: &K) -> u64 {
        self.entries.get(key).map_or(0, |entry| entry.value().version())
    }

    fn committed_value(&self, key: &K) -> Option<V> {
        self.head(key).and_then(|node| node.value().clone())
    }
}

impl<K, V> Participant for DictState<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn has_changes(&self, ctx: &TransContext) -> bool {
        ctx.local::<DictLocal<K, V>>(self.id)
            .is_some_and(|local| !local.writes.is_empty())
    }

    fn can_commit(&self, ctx: &TransContext, write_stamp: u64) -> bool {
        let Some(local) = ctx.local::<DictLocal<K, V>>(self.id) else {
            return true;
        };
        let start = ctx.start_stamp();

        for (key, observed) in &local.reads {
            // A foreign pending stamp means another writer is between
            // validation and publication on this key; our stamp is the
            // idempotent re-validation case.
            if self
                .write_stamps
                .get(key)
                .is_some_and(|entry| *entry.value() != write_stamp)
            {
                return false;
            }
            let head_version = self.head_version(key);
            if head_version != *observed || head_version > start {
                return false;
            }
        }

        for key in local.writes.keys() {
            match self.write_stamps.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(write_stamp);
                }
                Entry::Occupied(slot) => {
                    // First locker wins a write-write race; the loser rolls
                    // back and retries. Our own stamp means re-validation.
                    if *slot.get() != write_stamp {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn commit(&self, ctx: &mut TransContext, write_stamp: u64) -> bool {
        let Some(mut local) = ctx.take_local::<DictLocal<K, V>>(self.id) else {
            return false;
        };
        let changed = !local.writes.is_empty();

        for (key, value) in local.writes.drain() {
            match self.entries.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let older = Arc::clone(entry.get());
                    *entry.get_mut() =
                        Arc::new(VersionNode::new(write_stamp, value, Some(older)));
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(VersionNode::new(write_stamp, value, None)));
                }
            }
            self.recently_written.insert(key.clone(), write_stamp);

            let released = self.write_stamps.remove(&key);
            assert!(
                matches!(released, Some((_, stamp)) if stamp == write_stamp),
                "dictionary write-stamp lock lost during commit"
            );
        }
        changed
    }

    fn rollback(&self, ctx: &mut TransContext, write_stamp: Option<u64>) {
        let Some(local) = ctx.take_local::<DictLocal<K, V>>(self.id) else {
            return;
        };
        if let Some(stamp) = write_stamp {
            for key in local.writes.keys() {
                self.write_stamps.remove_if(key, |_, held| *held == stamp);
            }
        }
    }

    fn trim_copies(&self, min_open: u64) {
        let stale: Vec<K> = self
            .recently_written
            .iter()
            .filter(|entry| *entry.value() <= min_open)
            .map(|entry| entry.key().clone())
            .collect();

        for key in stale {
            if let Some(head) = self.head(&key) {
                chain::trim(&head, min_open);
            }
            // A newer write may have raced in since the scan; keep its tag.
            self.recently_written
                .remove_if(&key, |_, stamp| *stamp <= min_open);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Shield;

    #[test]
    fn test_absent_key_reads_none() {
        let dict: ShieldedDict<String, u32> = ShieldedDict::new();
        assert_eq!(dict.get(&"missing".to_string()).unwrap(), None);
        let inside =
            Shield::in_transaction(|| dict.get(&"missing".to_string())).unwrap();
        assert_eq!(inside, None);
    }

    #[test]
    fn test_insert_get_remove() {
        let dict = ShieldedDict::new();
        Shield::in_transaction(|| dict.insert("a", 1)).unwrap();
        assert_eq!(dict.get(&"a").unwrap(), Some(1));
        assert!(dict.contains_key(&"a").unwrap());

        Shield::in_transaction(|| dict.remove(&"a")).unwrap();
        assert_eq!(dict.get(&"a").unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "inside a transaction")]
    fn test_write_outside_transaction_panics() {
        let dict = ShieldedDict::new();
        let _ = dict.insert("a", 1);
    }

    #[test]
    fn test_read_your_writes_per_key() {
        let dict = ShieldedDict::new();
        let (buffered, other) = Shield::in_transaction(|| {
            dict.insert("k", 10)?;
            Ok((dict.get(&"k")?, dict.get(&"other")?))
        })
        .unwrap();
        assert_eq!(buffered, Some(10));
        assert_eq!(other, None);
    }

    #[test]
    fn test_remove_buffer_reads_as_absent() {
        let dict = ShieldedDict::new();
        Shield::in_transaction(|| dict.insert("k", 1)).unwrap();
        let seen = Shield::in_transaction(|| {
            dict.remove(&"k")?;
            dict.get(&"k")
        })
        .unwrap();
        assert_eq!(seen, None);
        assert_eq!(dict.get(&"k").unwrap(), None);
    }

    #[test]
    fn test_aborted_writes_not_visible() {
        let dict = ShieldedDict::new();
        let result: StmResult<()> = Shield::in_transaction(|| {
            dict.insert("k", 5)?;
            Err(StmError::user("abandon"))
        });
        assert!(result.is_err());
        assert_eq!(dict.get(&"k").unwrap(), None);
    }

    #[test]
    fn test_disjoint_keys_commit_in_parallel() {
        use std::sync::Arc;
        use std::thread;

        let dict = Arc::new(ShieldedDict::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dict = Arc::clone(&dict);
                thread::spawn(move || {
                    for n in 0..100 {
                        Shield::in_transaction(|| dict.insert((i, n), n)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        for i in 0..8 {
            for n in 0..100 {
                assert_eq!(dict.get(&(i, n)).unwrap(), Some(n));
            }
        }
    }

    #[test]
    fn test_trim_bookkeeping_clears_settled_keys() {
        let dict = ShieldedDict::new();
        Shield::in_transaction(|| dict.insert("k", 1)).unwrap();
        Shield::in_transaction(|| dict.insert("k", 2)).unwrap();

        dict.inner.trim_copies(u64::MAX);
        assert!(dict.inner.recently_written.is_empty());
        assert_eq!(dict.get(&"k").unwrap(), Some(2));
        // Exactly one version survives a full trim.
        let head = dict.inner.head(&"k").unwrap();
        assert!(head.older().is_none());
    }

    #[test]
    fn test_concurrent_transfers_conserve_sum() {
        use std::sync::Arc;
        use std::thread;

        let dict = Arc::new(ShieldedDict::new());
        Shield::in_transaction(|| {
            dict.insert("from", 1000)?;
            dict.insert("to", 0)
        })
        .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dict = Arc::clone(&dict);
                thread::spawn(move || {
                    for _ in 0..50 {
                        Shield::in_transaction(|| {
                            let from = dict.get(&"from")?.unwrap();
                            let to = dict.get(&"to")?.unwrap();
                            dict.insert("from", from - 1)?;
                            dict.insert("to", to + 1)
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(dict.get(&"from").unwrap(), Some(800));
        assert_eq!(dict.get(&"to").unwrap(), Some(200));
    }
}
