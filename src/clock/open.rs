// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Registry of open transaction start stamps.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Multiset of start stamps held by currently running transactions.
///
/// Two threads that begin in the same clock tick share a stamp, so each stamp
/// carries a count. The smallest open stamp bounds version trimming: a chain
/// node visible to `min_open()` may still be read and must survive.
pub struct OpenTransactions {
    stamps: Mutex<BTreeMap<u64, usize>>,
}

impl OpenTransactions {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            stamps: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records one transaction running with the given start stamp.
    pub fn register(&self, stamp: u64) {
        *self.stamps.lock().entry(stamp).or_insert(0) += 1;
    }

    /// Removes one transaction running with the given start stamp.
    ///
    /// # Panics
    ///
    /// Panics if the stamp was never registered; the runner registers and
    /// unregisters in strict pairs.
    pub fn unregister(&self, stamp: u64) {
        let mut stamps = self.stamps.lock();
        match stamps.entry(stamp) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > 1 {
                    *entry.get_mut() -= 1;
                } else {
                    entry.remove();
                }
            }
            Entry::Vacant(_) => panic!("unregistering start stamp {} that is not open", stamp),
        }
    }

    /// Returns the smallest open start stamp, if any transaction is running.
    pub fn min_open(&self) -> Option<u64> {
        self.stamps.lock().keys().next().copied()
    }
}

impl Default for OpenTransactions {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry shared by every transaction in the process.
static OPEN: OpenTransactions = OpenTransactions::new();

/// Records a running transaction in the global registry.
#[inline]
pub fn register(stamp: u64) {
    OPEN.register(stamp);
}

/// Removes a running transaction from the global registry.
#[inline]
pub fn unregister(stamp: u64) {
    OPEN.unregister(stamp);
}

/// Returns the smallest globally open start stamp.
#[inline]
pub fn min_open() -> Option<u64> {
    OPEN.min_open()
}
