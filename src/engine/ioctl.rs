// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The control-plane command and snapshot types.
//!
//! These are the structures a controller-facing transport decodes
//! into and encodes out of. Wire framing is not this engine's
//! concern; everything here is plain data with serde derives so a
//! harness can marshal it however it likes.

use serde::Deserialize;
use serde::Serialize;

use super::flow_table::EntryId;
use super::flow_table::FlowEntry;
use super::instruction::Instruction;
use super::oxm::FlowMatch;
use super::stat::EntryStatsSnap;
use super::stat::TableStatsSnap;
use crate::api::FlowModCommand;
use crate::api::FlowModFlags;
use crate::api::FlowRemovedReason;
use crate::api::MissConfig;
use crate::api::PortNo;
use crate::api::TableId;

/// A flow-table modification command from the controller.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowMod {
    pub table_id: TableId,
    pub command: FlowModCommand,
    pub priority: u16,
    pub cookie: u64,

    /// Restricts modify and delete to entries whose cookie agrees
    /// under this mask. Zero selects everything.
    pub cookie_mask: u64,

    /// Carried on the entry and reported in stats; expiry is the
    /// business of an out-of-engine reaper that deletes through
    /// [`crate::engine::switch::Switch::modify_flow()`].
    pub idle_timeout: u16,
    pub hard_timeout: u16,

    pub flags: FlowModFlags,
    pub pattern: FlowMatch,
    pub instructions: Vec<Instruction>,
}

impl Default for FlowMod {
    fn default() -> Self {
        Self {
            table_id: 0,
            command: FlowModCommand::Add,
            priority: 0,
            cookie: 0,
            cookie_mask: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            flags: FlowModFlags::default(),
            pattern: FlowMatch::default(),
            instructions: Vec::new(),
        }
    }
}

/// Sets a table's miss policy.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TableMod {
    pub table_id: TableId,
    pub miss_config: MissConfig,
}

/// The notification handed to the controller provider when an entry
/// installed with `SEND_FLOW_REM` is deleted.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowRemoved {
    pub table_id: TableId,
    pub pattern: FlowMatch,
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub duration_millis: u64,
    pub packet_count: u64,
    pub byte_count: u64,
}

impl FlowRemoved {
    pub fn from_entry(
        table_id: TableId,
        entry: &FlowEntry,
        reason: FlowRemovedReason,
    ) -> Self {
        let snap = entry.stats().snap();
        Self {
            table_id,
            pattern: entry.pattern().clone(),
            cookie: entry.cookie(),
            priority: entry.priority(),
            reason,
            idle_timeout: entry.idle_timeout(),
            hard_timeout: entry.hard_timeout(),
            duration_millis: snap.duration_millis,
            packet_count: snap.packets,
            byte_count: snap.bytes,
        }
    }
}

/// Selects the flows a flow or aggregate stats request covers: an
/// optional table restriction, a loose match filter, and a cookie
/// filter. The default request covers every installed entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FlowStatsReq {
    pub table_id: Option<TableId>,
    pub pattern: FlowMatch,
    pub cookie: u64,
    pub cookie_mask: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowStatsEntry {
    pub table_id: TableId,
    pub entry_id: EntryId,
    pub priority: u16,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub duration_millis: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub pattern: FlowMatch,
    pub instructions: Vec<Instruction>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FlowStatsResp {
    pub flows: Vec<FlowStatsEntry>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AggregateStatsResp {
    pub packet_count: u64,
    pub byte_count: u64,
    pub flow_count: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DescStatsResp {
    pub mfr_desc: String,
    pub hw_desc: String,
    pub sw_desc: String,
    pub serial_num: String,
    pub dp_desc: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TableStatsEntry {
    pub table_id: TableId,
    pub active_count: u64,
    pub lookups: u64,
    pub matches: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TableStatsResp {
    pub tables: Vec<TableStatsEntry>,
}

/// A debugging dump of one table: its policy, counters, and full
/// entry list in priority order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpTableResp {
    pub table_id: TableId,
    pub miss_config: MissConfig,
    pub stats: TableStatsSnap,
    pub entries: Vec<FlowEntryDump>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowEntryDump {
    pub id: EntryId,
    pub priority: u16,
    pub cookie: u64,
    pub flags: FlowModFlags,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub pattern: FlowMatch,
    pub instructions: Vec<Instruction>,
    pub stats: EntryStatsSnap,
}

impl FlowEntryDump {
    pub fn from_entry(entry: &FlowEntry) -> Self {
        Self {
            id: entry.id(),
            priority: entry.priority(),
            cookie: entry.cookie(),
            flags: entry.flags(),
            idle_timeout: entry.idle_timeout(),
            hard_timeout: entry.hard_timeout(),
            pattern: entry.pattern().clone(),
            instructions: entry.instructions().to_vec(),
            stats: entry.stats().snap(),
        }
    }
}

// ============================================================
// Stats shells for the collaborator-owned subsystems. Ports,
// queues, and groups live outside this engine; their stats replies
// exist so a transport can answer the requests, and are always
// empty here.
// ============================================================

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct PortStatsEntry {
    pub port_no: PortNo,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PortStatsResp {
    pub ports: Vec<PortStatsEntry>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct QueueStatsEntry {
    pub port_no: PortNo,
    pub queue_id: u32,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueueStatsResp {
    pub queues: Vec<QueueStatsEntry>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct GroupStatsEntry {
    pub group_id: u32,
    pub ref_count: u32,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GroupStatsResp {
    pub groups: Vec<GroupStatsEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GroupDescStatsResp {
    pub groups: Vec<GroupStatsEntry>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct GroupFeaturesResp {
    pub types: u32,
    pub capabilities: u32,
    pub max_groups: [u32; 4],
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flow_mod_default_is_add() {
        let fm = FlowMod::default();
        assert_eq!(fm.command, FlowModCommand::Add);
        assert_eq!(fm.table_id, 0);
        assert!(fm.pattern.is_empty());
    }

    #[test]
    fn dump_serializes() {
        let resp = DumpTableResp {
            table_id: 0,
            miss_config: MissConfig::Drop,
            stats: TableStatsSnap::default(),
            entries: vec![],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: DumpTableResp = serde_json::from_str(&json).unwrap();
        assert_eq!(back.table_id, 0);
        assert_eq!(back.miss_config, MissConfig::Drop);
    }
}
