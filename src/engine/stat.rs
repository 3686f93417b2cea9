// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Datapath counters.
//!
//! Counters come in two stores: per-table lookup/match counts and
//! per-entry packet/byte counts. Increments happen on the packet
//! path, so everything here is a lock-free atomic; snapshots are
//! taken by the read-only stat accessors.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::Relaxed;

use serde::Deserialize;
use serde::Serialize;

use super::time::Moment;

/// Per-table counters.
#[derive(Debug, Default)]
pub struct TableStats {
    /// The number of packets that have probed this table, match or
    /// miss.
    lookups: AtomicU64,

    /// The number of packets that matched an entry in this table.
    matches: AtomicU64,
}

impl TableStats {
    pub fn lookup(&self) {
        self.lookups.fetch_add(1, Relaxed);
    }

    pub fn matched(&self) {
        self.matches.fetch_add(1, Relaxed);
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn snap(&self) -> TableStatsSnap {
        TableStatsSnap {
            lookups: self.lookups.load(Relaxed),
            matches: self.matches.load(Relaxed),
        }
    }
}

/// A point-in-time copy of [`TableStats`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct TableStatsSnap {
    pub lookups: u64,
    pub matches: u64,
}

/// Per-entry counters. One record exists per installed flow entry,
/// created at add time and dropped with the entry.
#[derive(Debug)]
pub struct EntryStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    install_time: Moment,
}

impl EntryStats {
    /// Account one matched packet of `bytes` length.
    pub fn hit(&self, bytes: u64) {
        self.packets.fetch_add(1, Relaxed);
        self.bytes.fetch_add(bytes, Relaxed);
    }

    pub fn install_time(&self) -> Moment {
        self.install_time
    }

    pub fn new(install_time: Moment) -> Self {
        Self {
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            install_time,
        }
    }

    pub fn snap(&self) -> EntryStatsSnap {
        EntryStatsSnap {
            packets: self.packets.load(Relaxed),
            bytes: self.bytes.load(Relaxed),
            duration_millis: Moment::now().delta_as_millis(self.install_time),
        }
    }
}

/// A point-in-time copy of [`EntryStats`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct EntryStatsSnap {
    pub packets: u64,
    pub bytes: u64,
    pub duration_millis: u64,
}
