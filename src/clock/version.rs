// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The global version clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide monotonic version counter.
///
/// Every transaction samples the clock once at begin (its *start stamp*) and,
/// if it has changes to publish, bumps it once at commit to obtain a *write
/// stamp*. Write stamps are unique, strictly positive and totally ordered, so
/// `0` doubles as the "no pending writer" sentinel in write-stamp slots.
pub struct VersionClock {
    counter: AtomicU64,
}

impl VersionClock {
    /// Creates a clock starting at version 0.
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the current clock value. Used for start stamps.
    #[inline]
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Allocates the next write stamp.
    ///
    /// # Panics
    ///
    /// Panics if the counter reaches `u64::MAX` (overflow).
    pub fn next_write_stamp(&self) -> u64 {
        self.counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .expect("version clock overflow: u64::MAX reached")
            + 1
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The clock shared by every transaction in the process.
static CLOCK: VersionClock = VersionClock::new();

/// Returns the current global clock value.
#[inline]
pub fn current() -> u64 {
    CLOCK.current()
}

/// Allocates the next global write stamp.
#[inline]
pub fn next_write_stamp() -> u64 {
    CLOCK.next_write_stamp()
}
