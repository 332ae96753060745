// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction error types.

/// Errors that can occur in transactional operations.
///
/// `Conflict` and `RolledBack` are control-flow signals: the runner catches
/// them, rolls the attempt back and retries, so `Shield::in_transaction`
/// never returns them. `User` carries an application error out of the
/// transaction after rollback.
#[derive(Debug, thiserror::Error)]
pub enum StmError {
    #[error("transaction conflict detected")]
    Conflict,

    #[error("transaction rolled back")]
    RolledBack,

    #[error("commit continuation already completed")]
    ContinuationCompleted,

    #[error(transparent)]
    User(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StmError {
    /// Wraps an application error for propagation out of a transaction.
    pub fn user(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StmError::User(err.into())
    }

    /// Returns true if the runner handles this error by retrying.
    #[inline]
    pub(crate) fn is_retry(&self) -> bool {
        matches!(self, StmError::Conflict | StmError::RolledBack)
    }
}

/// Result type returned by every transactional operation.
pub type StmResult<T> = Result<T, StmError>;
