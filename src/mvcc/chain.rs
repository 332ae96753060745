// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Singly linked version chains.
//!
//! Each committed write prepends a node carrying its write stamp; versions
//! strictly decrease along `older`. A transaction with start stamp `S` reads
//! the first node with `version <= S`. Nodes are reclaimed by reference
//! counting: the trimmer severs `older` links, and a reader that still holds
//! an `Arc` into the tail keeps it alive until the read completes.

use std::sync::Arc;

use parking_lot::Mutex;

/// One committed version of a value.
pub struct VersionNode<T> {
    version: u64,
    value: T,
    older: Mutex<Option<Arc<VersionNode<T>>>>,
}

impl<T> VersionNode<T> {
    /// Creates a node carrying `version`, linked in front of `older`.
    pub fn new(version: u64, value: T, older: Option<Arc<VersionNode<T>>>) -> Self {
        debug_assert!(
            older.as_ref().map_or(true, |o| o.version < version),
            "versions must strictly decrease along the chain"
        );
        Self {
            version,
            value,
            older: Mutex::new(older),
        }
    }

    /// The write stamp this node was published under.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The committed value.
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The next older node, if not yet trimmed.
    pub fn older(&self) -> Option<Arc<VersionNode<T>>> {
        self.older.lock().clone()
    }
}

/// Walks the chain from `head` to the first node visible at `stamp`.
///
/// Returns `None` when every node in the chain is newer than `stamp`
/// (the value did not exist at that snapshot).
pub fn visible_in<T>(head: &Arc<VersionNode<T>>, stamp: u64) -> Option<Arc<VersionNode<T>>> {
    let mut node = Arc::clone(head);
    loop {
        if node.version <= stamp {
            return Some(node);
        }
        node = node.older()?;
    }
}

/// Severs the chain below the newest node with `version <= min_open`.
///
/// Every node with `version > min_open` is retained, along with exactly one
/// node at or below `min_open`, the one the oldest open transaction can
/// still read. Anything older is unreachable from the head and is dropped
/// once the last concurrent reader releases its `Arc`.
pub fn trim<T>(head: &Arc<VersionNode<T>>, min_open: u64) {
    let mut node = Arc::clone(head);
    loop {
        if node.version <= min_open {
            *node.older.lock() = None;
            return;
        }
        match node.older() {
            Some(older) => node = older,
            None => return,
        }
    }
}
