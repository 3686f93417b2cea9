// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The flow table: a priority-ordered collection of flow entries
//! with add/modify/delete semantics and a miss policy.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::instruction::Instruction;
use super::oxm::FieldSet;
use super::oxm::FlowMatch;
use super::stat::EntryStats;
use super::stat::TableStats;
use super::time::Moment;
use crate::api::FlowModError;
use crate::api::FlowModFlags;
use crate::api::MissConfig;
use crate::api::TableId;

/// A stable synthetic identity assigned to an entry at add time.
/// Counter records key off of it, so modifying an entry's
/// instructions preserves its counters without structural hashing.
pub type EntryId = u64;

/// The attributes a flow-mod supplies for a new entry.
#[derive(Clone, Debug, Default)]
pub struct FlowEntryParams {
    pub priority: u16,
    pub cookie: u64,
    pub flags: FlowModFlags,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub pattern: FlowMatch,
    pub instructions: Vec<Instruction>,
}

/// An installed flow entry.
///
/// Entries are immutable once installed; a modify command replaces
/// the `Arc` wholesale so that in-flight traversals keep a coherent
/// view. The counter record rides along in its own `Arc` and
/// survives instruction replacement.
#[derive(Clone, Debug)]
pub struct FlowEntry {
    id: EntryId,
    priority: u16,
    cookie: u64,
    flags: FlowModFlags,
    idle_timeout: u16,
    hard_timeout: u16,
    pattern: FlowMatch,
    instructions: Vec<Instruction>,
    stats: Arc<EntryStats>,
}

impl FlowEntry {
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn flags(&self) -> FlowModFlags {
        self.flags
    }

    pub fn hard_timeout(&self) -> u16 {
        self.hard_timeout
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn idle_timeout(&self) -> u16 {
        self.idle_timeout
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn new(id: EntryId, params: FlowEntryParams) -> Self {
        Self {
            id,
            priority: params.priority,
            cookie: params.cookie,
            flags: params.flags,
            idle_timeout: params.idle_timeout,
            hard_timeout: params.hard_timeout,
            pattern: params.pattern,
            instructions: params.instructions,
            stats: Arc::new(EntryStats::new(Moment::now())),
        }
    }

    pub fn pattern(&self) -> &FlowMatch {
        &self.pattern
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn stats(&self) -> &Arc<EntryStats> {
        &self.stats
    }

    /// The replacement entry a modify command installs: same
    /// identity and attributes, new instructions. Counters carry
    /// over unless the command asked for a reset, in which case a
    /// fresh record keeps the original install time.
    fn with_instructions(
        &self,
        instructions: Vec<Instruction>,
        reset_counts: bool,
    ) -> Self {
        let stats = if reset_counts {
            Arc::new(EntryStats::new(self.stats.install_time()))
        } else {
            self.stats.clone()
        };

        Self {
            id: self.id,
            priority: self.priority,
            cookie: self.cookie,
            flags: self.flags,
            idle_timeout: self.idle_timeout,
            hard_timeout: self.hard_timeout,
            pattern: self.pattern.clone(),
            instructions,
            stats,
        }
    }
}

/// Selects existing entries for the modify and delete commands.
#[derive(Clone, Copy, Debug)]
pub struct EntrySelector<'a> {
    pub pattern: &'a FlowMatch,
    pub priority: u16,
    pub cookie: u64,
    pub cookie_mask: u64,
}

impl EntrySelector<'_> {
    pub(crate) fn selects(&self, entry: &FlowEntry, strict: bool) -> bool {
        if self.cookie_mask != 0
            && entry.cookie & self.cookie_mask != self.cookie & self.cookie_mask
        {
            return false;
        }

        if strict {
            self.priority == entry.priority
                && self.pattern.same_fields(&entry.pattern)
        } else {
            self.pattern.covers(&entry.pattern)
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum TablePlace {
    Insert(usize),
    End,
}

/// A single flow table.
///
/// The entries list is sorted by non-increasing priority at all
/// times, ties broken by insertion order. Readers walk it under the
/// read half of the lock, so a traversal sees one coherent list per
/// table; flow-mods take the write half and appear atomic.
#[derive(Debug)]
pub struct FlowTable {
    id: TableId,
    entries: RwLock<Vec<Arc<FlowEntry>>>,
    miss_config: RwLock<MissConfig>,
    stats: TableStats,
}

impl FlowTable {
    /// Install a new entry.
    ///
    /// With `CHECK_OVERLAP` the add is refused if any existing entry
    /// shares the priority; the table is left untouched. An existing
    /// entry with the identical (match, priority) pair is superseded,
    /// dropping its counter record.
    pub fn add(&self, entry: FlowEntry) -> Result<(), FlowModError> {
        let mut entries = self.entries.write();

        if entry.flags.contains(FlowModFlags::CHECK_OVERLAP)
            && entries.iter().any(|e| e.priority == entry.priority)
        {
            return Err(FlowModError::Overlap);
        }

        if let Some(idx) = entries.iter().position(|e| {
            e.priority == entry.priority && e.pattern.same_fields(&entry.pattern)
        }) {
            entries[idx] = Arc::new(entry);
            return Ok(());
        }

        match Self::find_pos(&entries, entry.priority) {
            TablePlace::End => entries.push(Arc::new(entry)),
            TablePlace::Insert(idx) => entries.insert(idx, Arc::new(entry)),
        }

        Ok(())
    }

    /// Remove the entries the selector picks out, returning them so
    /// the caller can issue flow-removed notifications.
    pub fn delete(
        &self,
        sel: &EntrySelector,
        strict: bool,
    ) -> Vec<Arc<FlowEntry>> {
        let mut entries = self.entries.write();
        let mut removed = Vec::new();

        entries.retain(|e| {
            if sel.selects(e, strict) {
                removed.push(e.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// A point-in-time copy of the entries list, in priority order.
    pub fn entries_snapshot(&self) -> Vec<Arc<FlowEntry>> {
        self.entries.read().clone()
    }

    /// Walk the entries in priority order and return the first whose
    /// match is satisfied by `fields`. Counters are the caller's
    /// business; this is a pure probe.
    pub fn find_match(&self, fields: &FieldSet) -> Option<Arc<FlowEntry>> {
        let entries = self.entries.read();

        for entry in entries.iter() {
            if entry.pattern.matches(fields) {
                trace!(
                    table = self.id,
                    entry = entry.id,
                    priority = entry.priority,
                    "rule match"
                );
                return Some(entry.clone());
            }
        }

        trace!(table = self.id, "rule no match");
        None
    }

    // Find the position at which to insert an entry of the given
    // priority: before the first strictly-lower priority, which
    // keeps equal-priority entries in insertion order.
    fn find_pos(entries: &[Arc<FlowEntry>], priority: u16) -> TablePlace {
        for (i, e) in entries.iter().enumerate() {
            if e.priority < priority {
                return TablePlace::Insert(i);
            }
        }

        TablePlace::End
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn miss_config(&self) -> MissConfig {
        *self.miss_config.read()
    }

    /// Replace the instructions of the entries the selector picks
    /// out. Returns how many entries were touched.
    pub fn modify(
        &self,
        sel: &EntrySelector,
        instructions: &[Instruction],
        strict: bool,
        reset_counts: bool,
    ) -> usize {
        let mut entries = self.entries.write();
        let mut touched = 0;

        for slot in entries.iter_mut() {
            if sel.selects(slot, strict) {
                *slot = Arc::new(
                    slot.with_instructions(instructions.to_vec(), reset_counts),
                );
                touched += 1;
            }
        }

        touched
    }

    pub fn new(id: TableId, miss_config: MissConfig) -> Self {
        Self {
            id,
            entries: RwLock::new(Vec::new()),
            miss_config: RwLock::new(miss_config),
            stats: TableStats::new(),
        }
    }

    pub fn num_entries(&self) -> usize {
        self.entries.read().len()
    }

    pub fn set_miss_config(&self, miss_config: MissConfig) {
        *self.miss_config.write() = miss_config;
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::oxm::OxmField;
    use crate::engine::oxm::OxmTlv;

    fn entry(id: EntryId, priority: u16, pattern: FlowMatch) -> FlowEntry {
        FlowEntry::new(
            id,
            FlowEntryParams { priority, pattern, ..Default::default() },
        )
    }

    fn in_port_match(port: u32) -> FlowMatch {
        FlowMatch::new(vec![OxmTlv::exact(
            OxmField::InPort,
            port.to_be_bytes(),
        )])
    }

    fn priorities(ft: &FlowTable) -> Vec<u16> {
        ft.entries_snapshot().iter().map(|e| e.priority()).collect()
    }

    #[test]
    fn insert_keeps_priority_order() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        ft.add(entry(1, 100, in_port_match(1))).unwrap();
        ft.add(entry(2, 300, in_port_match(2))).unwrap();
        ft.add(entry(3, 200, in_port_match(3))).unwrap();
        assert_eq!(priorities(&ft), vec![300, 200, 100]);
    }

    #[test]
    fn equal_priority_keeps_insertion_order() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        ft.add(entry(1, 50, in_port_match(1))).unwrap();
        ft.add(entry(2, 50, in_port_match(2))).unwrap();
        ft.add(entry(3, 50, in_port_match(3))).unwrap();

        let ids: Vec<EntryId> =
            ft.entries_snapshot().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn check_overlap_rejects_shared_priority() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        ft.add(entry(1, 50, in_port_match(1))).unwrap();

        let mut clashing = FlowEntryParams {
            priority: 50,
            pattern: in_port_match(2),
            flags: FlowModFlags::CHECK_OVERLAP,
            ..Default::default()
        };
        let res = ft.add(FlowEntry::new(2, clashing.clone()));
        assert_eq!(res, Err(FlowModError::Overlap));
        assert_eq!(ft.num_entries(), 1);

        // A different priority is fine even with the flag set.
        clashing.priority = 60;
        ft.add(FlowEntry::new(3, clashing)).unwrap();
        assert_eq!(ft.num_entries(), 2);
    }

    #[test]
    fn identical_add_supersedes() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        let first = entry(1, 50, in_port_match(1));
        first.stats().hit(100);
        ft.add(first).unwrap();
        ft.add(entry(2, 50, in_port_match(1))).unwrap();

        let snap = ft.entries_snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id(), 2);
        // Fresh counter record.
        assert_eq!(snap[0].stats().snap().packets, 0);
    }

    #[test]
    fn strict_selection_needs_exact_pattern_and_priority() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        ft.add(entry(1, 50, in_port_match(1))).unwrap();
        ft.add(entry(2, 60, in_port_match(1))).unwrap();

        let pattern = in_port_match(1);
        let sel = EntrySelector {
            pattern: &pattern,
            priority: 50,
            cookie: 0,
            cookie_mask: 0,
        };
        let removed = ft.delete(&sel, true);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), 1);
        assert_eq!(ft.num_entries(), 1);
    }

    #[test]
    fn loose_delete_uses_covers() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        ft.add(entry(1, 50, in_port_match(1))).unwrap();
        ft.add(entry(2, 60, in_port_match(2))).unwrap();
        let wider = FlowMatch::new(vec![
            OxmTlv::exact(OxmField::InPort, 1u32.to_be_bytes()),
            OxmTlv::exact(OxmField::IpProto, [6]),
        ]);
        ft.add(entry(3, 70, wider)).unwrap();

        // The in_port=1 filter covers entries 1 and 3, not 2.
        let pattern = in_port_match(1);
        let sel = EntrySelector {
            pattern: &pattern,
            priority: 0,
            cookie: 0,
            cookie_mask: 0,
        };
        let removed = ft.delete(&sel, false);
        let mut ids: Vec<EntryId> = removed.iter().map(|e| e.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(ft.num_entries(), 1);
    }

    #[test]
    fn empty_filter_deletes_all() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        ft.add(entry(1, 50, in_port_match(1))).unwrap();
        ft.add(entry(2, 60, in_port_match(2))).unwrap();

        let pattern = FlowMatch::default();
        let sel = EntrySelector {
            pattern: &pattern,
            priority: 0,
            cookie: 0,
            cookie_mask: 0,
        };
        assert_eq!(ft.delete(&sel, false).len(), 2);
        assert_eq!(ft.num_entries(), 0);
    }

    #[test]
    fn cookie_filter_narrows_selection() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        let mut params = FlowEntryParams {
            priority: 50,
            pattern: in_port_match(1),
            cookie: 0xdead,
            ..Default::default()
        };
        ft.add(FlowEntry::new(1, params.clone())).unwrap();
        params.cookie = 0xbeef;
        params.pattern = in_port_match(2);
        ft.add(FlowEntry::new(2, params)).unwrap();

        let pattern = FlowMatch::default();
        let sel = EntrySelector {
            pattern: &pattern,
            priority: 0,
            cookie: 0xdead,
            cookie_mask: u64::MAX,
        };
        let removed = ft.delete(&sel, false);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), 1);
    }

    #[test]
    fn modify_preserves_counters() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        let e = entry(1, 50, in_port_match(1));
        e.stats().hit(42);
        ft.add(e).unwrap();

        let pattern = in_port_match(1);
        let sel = EntrySelector {
            pattern: &pattern,
            priority: 50,
            cookie: 0,
            cookie_mask: 0,
        };
        let touched = ft.modify(
            &sel,
            &[Instruction::GotoTable(1)],
            true,
            false,
        );
        assert_eq!(touched, 1);

        let snap = ft.entries_snapshot();
        assert_eq!(snap[0].instructions(), &[Instruction::GotoTable(1)][..]);
        assert_eq!(snap[0].stats().snap().bytes, 42);
        assert_eq!(snap[0].id(), 1);
    }

    #[test]
    fn modify_reset_counts() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        let e = entry(1, 50, in_port_match(1));
        e.stats().hit(42);
        ft.add(e).unwrap();

        let pattern = in_port_match(1);
        let sel = EntrySelector {
            pattern: &pattern,
            priority: 50,
            cookie: 0,
            cookie_mask: 0,
        };
        ft.modify(&sel, &[], true, true);
        assert_eq!(ft.entries_snapshot()[0].stats().snap().packets, 0);
    }

    #[test]
    fn find_match_honors_priority() {
        let ft = FlowTable::new(0, MissConfig::Drop);
        ft.add(entry(1, 100, FlowMatch::default())).unwrap();
        ft.add(entry(2, 200, FlowMatch::default())).unwrap();

        let fields = FieldSet::new();
        let hit = ft.find_match(&fields).unwrap();
        assert_eq!(hit.id(), 2);
    }
}
