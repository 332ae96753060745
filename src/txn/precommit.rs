// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Process-wide pre-commit hooks.
//!
//! A pre-commit is a `(predicate, action)` pair evaluated by every
//! transaction between body execution and validation. The predicate runs
//! inside the transaction and sees its current view, buffered writes
//! included; the runner records which participants it reads and invokes the
//! action only when the transaction has changes to at least one of them.
//! Actions may veto the commit by returning an error: a rollback signal
//! retries the transaction, any other error aborts it and propagates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::StmResult;

pub(crate) struct Hook {
    id: u64,
    pub(crate) predicate: Box<dyn Fn() -> StmResult<bool> + Send + Sync>,
    pub(crate) action: Box<dyn Fn() -> StmResult<()> + Send + Sync>,
}

static REGISTRY: RwLock<Vec<Arc<Hook>>> = RwLock::new(Vec::new());
static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Keeps a pre-commit hook registered; dropping the guard unregisters it.
#[must_use = "dropping the guard unregisters the pre-commit hook"]
pub struct PreCommitGuard {
    id: u64,
}

impl Drop for PreCommitGuard {
    fn drop(&mut self) {
        REGISTRY.write().retain(|hook| hook.id != self.id);
    }
}

pub(crate) fn register(
    predicate: impl Fn() -> StmResult<bool> + Send + Sync + 'static,
    action: impl Fn() -> StmResult<()> + Send + Sync + 'static,
) -> PreCommitGuard {
    let id = NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed);
    REGISTRY.write().push(Arc::new(Hook {
        id,
        predicate: Box::new(predicate),
        action: Box::new(action),
    }));
    PreCommitGuard { id }
}

/// Returns the currently registered hooks, in registration order.
pub(crate) fn snapshot() -> Vec<Arc<Hook>> {
    REGISTRY.read().clone()
}
