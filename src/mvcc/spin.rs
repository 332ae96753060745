// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Bounded spin-wait for write-stamp locks.

/// Exponential spin that falls back to yielding.
///
/// The waits in this crate are short by construction: a reader only waits for
/// a conflicting writer that is already past validation, so the lock is
/// released as soon as that writer publishes or aborts. Spinning with the
/// CPU pause hint covers the common case; yielding after a few rounds avoids
/// priority inversion when the writer is descheduled.
pub(crate) struct Backoff {
    step: u32,
}

const SPIN_LIMIT: u32 = 6;

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}
