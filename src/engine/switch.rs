// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The pipeline driver and the control-plane surface.

use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;

use super::flow_table::EntrySelector;
use super::flow_table::FlowEntry;
use super::flow_table::FlowEntryParams;
use super::flow_table::FlowTable;
use super::instruction::run_instructions;
use super::instruction::validate_instructions;
use super::instruction::NextStep;
use super::ioctl;
use super::ioctl::FlowMod;
use super::ioctl::FlowRemoved;
use super::ioctl::TableMod;
use super::packet::Packet;
use super::DEF_NUM_TABLES;
use crate::api::FlowModCommand;
use crate::api::FlowModError;
use crate::api::FlowModFlags;
use crate::api::FlowRemovedReason;
use crate::api::MissConfig;
use crate::api::PacketInReason;
use crate::api::TableId;
use crate::ControllerProvider;
use crate::EgressProvider;
use crate::ExecCtx;

/// The ultimate disposition of one packet traversal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// The packet was dropped; the reason says why.
    Drop(DropReason),

    /// The packet was handed to the controller by a miss policy.
    Controller,

    /// An output action ran for the packet, immediately via
    /// apply-actions or from its action set at termination.
    Output,
}

impl Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Drop(reason) => write!(f, "drop({})", reason),
            Self::Controller => write!(f, "controller"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// The reason a traversal ended in a drop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// A table miss with a drop miss policy, or a continue policy
    /// that ran off the end of the pipeline.
    MissPolicy,

    /// The pipeline was directed at a table that does not exist.
    NoTable,

    /// A goto named a table at or before the current one.
    BadGoto,

    /// The pipeline terminated without any output action having run.
    NoOutput,
}

impl Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::MissPolicy => "miss policy",
            Self::NoTable => "no such table",
            Self::BadGoto => "bad goto",
            Self::NoOutput => "no output action",
        };
        write!(f, "{}", s)
    }
}

/// Used to build a [`Switch`].
///
/// The initial table layout and collaborator wiring are done through
/// the builder; once [`SwitchBuilder::create()`] runs, the set of
/// tables is fixed and all further configuration flows through
/// [`Switch::modify_flow()`] and [`Switch::modify_table()`].
pub struct SwitchBuilder {
    name: String,
    num_tables: usize,
    miss_config: Vec<(TableId, MissConfig)>,
    ectx: ExecCtx,
}

impl SwitchBuilder {
    /// Wire the controller collaborator.
    pub fn controller(mut self, controller: Arc<dyn ControllerProvider>) -> Self {
        self.ectx.controller = controller;
        self
    }

    pub fn create(self) -> Switch {
        let mut tables = Vec::with_capacity(self.num_tables);
        for id in 0..self.num_tables {
            tables.push(Arc::new(FlowTable::new(
                id as TableId,
                MissConfig::default(),
            )));
        }

        for (id, miss) in self.miss_config {
            if let Some(table) = tables.get(usize::from(id)) {
                table.set_miss_config(miss);
            }
        }

        Switch {
            name: self.name,
            ectx: self.ectx,
            tables,
            next_entry_id: AtomicU64::new(0),
            mod_lock: Mutex::new(()),
        }
    }

    /// Wire the egress collaborator.
    pub fn egress(mut self, egress: Arc<dyn EgressProvider>) -> Self {
        self.ectx.egress = egress;
        self
    }

    /// Pre-seed a table's miss policy. Unknown table ids are ignored.
    pub fn miss_config(mut self, id: TableId, miss: MissConfig) -> Self {
        self.miss_config.push((id, miss));
        self
    }

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            num_tables: DEF_NUM_TABLES,
            miss_config: Vec::new(),
            ectx: ExecCtx::default(),
        }
    }

    /// The number of flow tables, clamped to `1..=256`. Table 0
    /// always exists.
    pub fn num_tables(mut self, n: usize) -> Self {
        self.num_tables = n.clamp(1, DEF_NUM_TABLES);
        self
    }
}

/// A software switch datapath: the table registry, the pipeline
/// driver, and the flow-mod machinery.
///
/// Packet traversals run concurrently with each other and with
/// control-plane changes. Each table hands a traversal a coherent
/// entries snapshot; flow-mods serialize against each other on a
/// single lock and are atomic with respect to readers.
pub struct Switch {
    name: String,
    ectx: ExecCtx,
    tables: Vec<Arc<FlowTable>>,
    next_entry_id: AtomicU64,
    mod_lock: Mutex<()>,
}

impl Switch {
    pub fn builder(name: &str) -> SwitchBuilder {
        SwitchBuilder::new(name)
    }

    /// Apply a flow-mod.
    ///
    /// A refused flow-mod leaves the targeted table untouched; all
    /// validation happens before any mutation.
    pub fn modify_flow(&self, fm: &FlowMod) -> Result<(), FlowModError> {
        let _guard = self.mod_lock.lock();

        let table = self
            .table(fm.table_id)
            .ok_or(FlowModError::BadTableId(fm.table_id))?;

        fm.pattern.validate()?;

        match fm.command {
            FlowModCommand::Add
            | FlowModCommand::Modify
            | FlowModCommand::ModifyStrict => {
                validate_instructions(
                    &fm.instructions,
                    fm.table_id,
                    self.tables.len(),
                )?;
            }

            FlowModCommand::Delete | FlowModCommand::DeleteStrict => (),
        }

        let sel = EntrySelector {
            pattern: &fm.pattern,
            priority: fm.priority,
            cookie: fm.cookie,
            cookie_mask: fm.cookie_mask,
        };

        match fm.command {
            FlowModCommand::Add => {
                let id = self.next_entry_id.fetch_add(1, Relaxed);
                let entry = FlowEntry::new(
                    id,
                    FlowEntryParams {
                        priority: fm.priority,
                        cookie: fm.cookie,
                        flags: fm.flags,
                        idle_timeout: fm.idle_timeout,
                        hard_timeout: fm.hard_timeout,
                        pattern: fm.pattern.clone(),
                        instructions: fm.instructions.clone(),
                    },
                );
                table.add(entry)?;
                debug!(
                    switch = %self.name,
                    table = fm.table_id,
                    entry = id,
                    priority = fm.priority,
                    "flow added"
                );
                Ok(())
            }

            FlowModCommand::Modify | FlowModCommand::ModifyStrict => {
                let strict = fm.command == FlowModCommand::ModifyStrict;
                let touched = table.modify(
                    &sel,
                    &fm.instructions,
                    strict,
                    fm.flags.contains(FlowModFlags::RESET_COUNTS),
                );
                debug!(
                    switch = %self.name,
                    table = fm.table_id,
                    touched,
                    "flow modified"
                );
                Ok(())
            }

            FlowModCommand::Delete | FlowModCommand::DeleteStrict => {
                let strict = fm.command == FlowModCommand::DeleteStrict;
                let removed = table.delete(&sel, strict);
                debug!(
                    switch = %self.name,
                    table = fm.table_id,
                    removed = removed.len(),
                    "flow deleted"
                );

                for entry in &removed {
                    if entry.flags().contains(FlowModFlags::SEND_FLOW_REM) {
                        self.ectx.controller.flow_removed(
                            FlowRemoved::from_entry(
                                fm.table_id,
                                entry,
                                FlowRemovedReason::Delete,
                            ),
                        );
                    }
                }

                Ok(())
            }
        }
    }

    /// Set a table's miss policy.
    pub fn modify_table(&self, tm: &TableMod) -> Result<(), FlowModError> {
        let _guard = self.mod_lock.lock();

        let table = self
            .table(tm.table_id)
            .ok_or(FlowModError::BadTableId(tm.table_id))?;
        table.set_miss_config(tm.miss_config);
        debug!(
            switch = %self.name,
            table = tm.table_id,
            miss = %tm.miss_config,
            "table modified"
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// Send one packet through the pipeline, starting at table 0,
    /// and return its disposition. The packet is exclusively owned
    /// by this traversal; output actions emit clones.
    pub fn route(&self, pkt: &mut Packet) -> Disposition {
        trace!(switch = %self.name, in_port = pkt.in_port(), "route");
        let res = self.route_inner(pkt);
        trace!(switch = %self.name, result = %res, "route return");
        res
    }

    fn route_inner(&self, pkt: &mut Packet) -> Disposition {
        let mut table_id: TableId = 0;

        loop {
            let Some(table) = self.table(table_id) else {
                return Disposition::Drop(DropReason::NoTable);
            };

            table.stats().lookup();

            let Some(entry) = table.find_match(pkt.fields()) else {
                match table.miss_config() {
                    MissConfig::Drop => {
                        return Disposition::Drop(DropReason::MissPolicy);
                    }

                    MissConfig::Controller => {
                        self.ectx
                            .controller
                            .send(PacketInReason::NoMatch, pkt.clone());
                        return Disposition::Controller;
                    }

                    MissConfig::Continue => {
                        // Running off the end of the pipeline behaves
                        // like a drop policy.
                        match table_id.checked_add(1) {
                            Some(next)
                                if usize::from(next) < self.tables.len() =>
                            {
                                table_id = next;
                                continue;
                            }
                            _ => {
                                return Disposition::Drop(
                                    DropReason::MissPolicy,
                                );
                            }
                        }
                    }
                }
            };

            table.stats().matched();
            entry.stats().hit(pkt.len());

            match run_instructions(entry.instructions(), pkt, &self.ectx) {
                NextStep::Goto(next) => {
                    if next <= table_id
                        || usize::from(next) >= self.tables.len()
                    {
                        return Disposition::Drop(DropReason::BadGoto);
                    }
                    table_id = next;
                }

                NextStep::Output => {
                    let set = pkt.take_action_set();
                    set.execute(pkt, &self.ectx);
                    return if pkt.emitted() {
                        Disposition::Output
                    } else {
                        Disposition::Drop(DropReason::NoOutput)
                    };
                }
            }
        }
    }

    pub fn table(&self, id: TableId) -> Option<Arc<FlowTable>> {
        self.tables.get(usize::from(id)).cloned()
    }

    // ============================================================
    // Read-only stat accessors. These take point-in-time snapshots
    // from the counter stores; none of them perturb the datapath.
    // ============================================================

    pub fn aggregate_stats(
        &self,
        req: &ioctl::FlowStatsReq,
    ) -> ioctl::AggregateStatsResp {
        let mut resp = ioctl::AggregateStatsResp::default();

        for entry in self.select_flows(req) {
            let snap = entry.1.stats().snap();
            resp.packet_count += snap.packets;
            resp.byte_count += snap.bytes;
            resp.flow_count += 1;
        }

        resp
    }

    pub fn desc_stats(&self) -> ioctl::DescStatsResp {
        ioctl::DescStatsResp {
            mfr_desc: "Oxide Computer Company".to_string(),
            hw_desc: "userspace datapath".to_string(),
            sw_desc: format!("ofswitch {}", env!("CARGO_PKG_VERSION")),
            serial_num: String::new(),
            dp_desc: self.name.clone(),
        }
    }

    pub fn dump_table(
        &self,
        id: TableId,
    ) -> Result<ioctl::DumpTableResp, FlowModError> {
        let table = self.table(id).ok_or(FlowModError::BadTableId(id))?;

        let entries = table
            .entries_snapshot()
            .iter()
            .map(|e| ioctl::FlowEntryDump::from_entry(e))
            .collect();

        Ok(ioctl::DumpTableResp {
            table_id: id,
            miss_config: table.miss_config(),
            stats: table.stats().snap(),
            entries,
        })
    }

    pub fn flow_stats(&self, req: &ioctl::FlowStatsReq) -> ioctl::FlowStatsResp {
        let flows = self
            .select_flows(req)
            .into_iter()
            .map(|(table_id, entry)| {
                let snap = entry.stats().snap();
                ioctl::FlowStatsEntry {
                    table_id,
                    entry_id: entry.id(),
                    priority: entry.priority(),
                    cookie: entry.cookie(),
                    idle_timeout: entry.idle_timeout(),
                    hard_timeout: entry.hard_timeout(),
                    duration_millis: snap.duration_millis,
                    packet_count: snap.packets,
                    byte_count: snap.bytes,
                    pattern: entry.pattern().clone(),
                    instructions: entry.instructions().to_vec(),
                }
            })
            .collect();

        ioctl::FlowStatsResp { flows }
    }

    pub fn group_desc_stats(&self) -> ioctl::GroupDescStatsResp {
        ioctl::GroupDescStatsResp::default()
    }

    pub fn group_features(&self) -> ioctl::GroupFeaturesResp {
        ioctl::GroupFeaturesResp::default()
    }

    pub fn group_stats(&self) -> ioctl::GroupStatsResp {
        ioctl::GroupStatsResp::default()
    }

    pub fn port_stats(&self) -> ioctl::PortStatsResp {
        ioctl::PortStatsResp::default()
    }

    pub fn queue_stats(&self) -> ioctl::QueueStatsResp {
        ioctl::QueueStatsResp::default()
    }

    pub fn table_stats(&self) -> ioctl::TableStatsResp {
        let tables = self
            .tables
            .iter()
            .map(|t| {
                let snap = t.stats().snap();
                ioctl::TableStatsEntry {
                    table_id: t.id(),
                    active_count: t.num_entries() as u64,
                    lookups: snap.lookups,
                    matches: snap.matches,
                }
            })
            .collect();

        ioctl::TableStatsResp { tables }
    }

    fn select_flows(
        &self,
        req: &ioctl::FlowStatsReq,
    ) -> Vec<(TableId, Arc<FlowEntry>)> {
        let sel = EntrySelector {
            pattern: &req.pattern,
            priority: 0,
            cookie: req.cookie,
            cookie_mask: req.cookie_mask,
        };

        let mut out = Vec::new();
        for table in &self.tables {
            if let Some(want) = req.table_id {
                if want != table.id() {
                    continue;
                }
            }

            for entry in table.entries_snapshot() {
                if sel.selects(&entry, false) {
                    out.push((table.id(), entry));
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::instruction::Instruction;
    use crate::engine::oxm::FieldSet;
    use crate::engine::oxm::FlowMatch;

    fn catch_all(instructions: Vec<Instruction>) -> FlowMod {
        FlowMod {
            priority: 0,
            pattern: FlowMatch::default(),
            instructions,
            ..Default::default()
        }
    }

    #[test]
    fn bad_table_id() {
        let sw = Switch::builder("t").num_tables(4).create();
        let mut fm = catch_all(vec![]);
        fm.table_id = 4;
        assert_eq!(sw.modify_flow(&fm), Err(FlowModError::BadTableId(4)));
    }

    #[test]
    fn goto_chain_spans_tables() {
        let sw = Switch::builder("t").num_tables(4).create();
        let mut fm = catch_all(vec![Instruction::GotoTable(2)]);
        sw.modify_flow(&fm).unwrap();
        fm.table_id = 2;
        fm.instructions = vec![Instruction::GotoTable(3)];
        sw.modify_flow(&fm).unwrap();
        fm.table_id = 3;
        fm.instructions = vec![];
        sw.modify_flow(&fm).unwrap();

        let mut pkt = Packet::new(1, FieldSet::new(), vec![0; 10]);
        // 0 -> 2 -> 3, terminating with an empty action set.
        assert_eq!(
            sw.route(&mut pkt),
            Disposition::Drop(DropReason::NoOutput)
        );
        let stats = sw.table_stats();
        assert_eq!(stats.tables[0].matches, 1);
        assert_eq!(stats.tables[1].matches, 0);
        assert_eq!(stats.tables[2].matches, 1);
        assert_eq!(stats.tables[3].matches, 1);
    }

    #[test]
    fn continue_runs_off_the_end() {
        let sw = Switch::builder("t").num_tables(2).create();
        for id in 0..2 {
            sw.modify_table(&TableMod {
                table_id: id,
                miss_config: MissConfig::Continue,
            })
            .unwrap();
        }

        let mut pkt = Packet::new(1, FieldSet::new(), vec![0; 10]);
        assert_eq!(
            sw.route(&mut pkt),
            Disposition::Drop(DropReason::MissPolicy)
        );
        let stats = sw.table_stats();
        assert_eq!(stats.tables[0].lookups, 1);
        assert_eq!(stats.tables[1].lookups, 1);
    }
}
