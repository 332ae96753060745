// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! MVCC primitives: version chains and the shielded cell and dictionary.
//!
//! Every committed write prepends a `(version, value)` node to a singly
//! linked chain; a transaction with start stamp `S` reads the first node with
//! `version <= S`, so writers never disturb concurrent readers. The cell
//! guards one chain with one write-stamp lock; the dictionary guards one
//! chain and one lock per key. Old nodes are reclaimed by the trimmer once
//! no open transaction can still observe them.

pub mod chain;
mod cell;
mod dict;
mod spin;

pub use cell::Shielded;
pub use chain::VersionNode;
pub use dict::ShieldedDict;
