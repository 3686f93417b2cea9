// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Shared fixtures for the end-to-end pipeline tests.

use std::sync::Arc;

use parking_lot::Mutex;

use ofswitch::api::FlowModFlags;
use ofswitch::api::MissConfig;
use ofswitch::api::PacketInReason;
use ofswitch::api::PortNo;
use ofswitch::api::TableId;
use ofswitch::engine::instruction::Instruction;
use ofswitch::engine::ioctl::FlowMod;
use ofswitch::engine::ioctl::FlowRemoved;
use ofswitch::engine::oxm::FieldSet;
use ofswitch::engine::oxm::FlowMatch;
use ofswitch::engine::oxm::OxmField;
use ofswitch::engine::oxm::OxmTlv;
use ofswitch::engine::packet::Packet;
use ofswitch::engine::switch::Switch;
use ofswitch::ControllerProvider;
use ofswitch::EgressProvider;

/// Records every packet the datapath emits.
#[derive(Default)]
pub struct CaptureEgress {
    pub emits: Mutex<Vec<(PortNo, Packet)>>,
}

impl CaptureEgress {
    pub fn count(&self) -> usize {
        self.emits.lock().len()
    }

    pub fn last(&self) -> (PortNo, Packet) {
        self.emits.lock().last().expect("an emitted packet").clone()
    }
}

impl EgressProvider for CaptureEgress {
    fn emit(&self, port: PortNo, pkt: Packet) {
        self.emits.lock().push((port, pkt));
    }
}

/// Records every packet-in and flow-removed the datapath produces.
#[derive(Default)]
pub struct CaptureController {
    pub packet_ins: Mutex<Vec<(PacketInReason, Packet)>>,
    pub removed: Mutex<Vec<FlowRemoved>>,
}

impl ControllerProvider for CaptureController {
    fn send(&self, reason: PacketInReason, pkt: Packet) {
        self.packet_ins.lock().push((reason, pkt));
    }

    fn flow_removed(&self, removed: FlowRemoved) {
        self.removed.lock().push(removed);
    }
}

/// A small switch with every table set to drop on miss, wired to
/// capture sinks.
pub fn test_switch(
    num_tables: usize,
) -> (Switch, Arc<CaptureEgress>, Arc<CaptureController>) {
    let egress = Arc::new(CaptureEgress::default());
    let controller = Arc::new(CaptureController::default());

    let mut builder = Switch::builder("test")
        .num_tables(num_tables)
        .egress(egress.clone())
        .controller(controller.clone());
    for id in 0..num_tables {
        builder = builder.miss_config(id as TableId, MissConfig::Drop);
    }

    (builder.create(), egress, controller)
}

/// A TCP/IPv4 packet arriving on `in_port`, 100 bytes on the wire.
pub fn tcp_pkt(in_port: PortNo) -> Packet {
    let fields = FieldSet::from(vec![
        OxmTlv::exact(OxmField::EthSrc, [0x02, 0x08, 0x20, 0xd8, 0x35, 0xcf]),
        OxmTlv::exact(OxmField::EthDst, [0x78, 0x23, 0xae, 0x5d, 0x4f, 0x0d]),
        OxmTlv::exact(OxmField::EthType, 0x0800u16.to_be_bytes()),
        OxmTlv::exact(OxmField::Ipv4Src, [10, 0, 0, 77]),
        OxmTlv::exact(OxmField::Ipv4Dst, [52, 10, 128, 69]),
        OxmTlv::exact(OxmField::IpProto, [6]),
        OxmTlv::exact(OxmField::TcpSrc, 5555u16.to_be_bytes()),
        OxmTlv::exact(OxmField::TcpDst, 443u16.to_be_bytes()),
    ]);

    Packet::new(in_port, fields, vec![0xa; 100]).with_nw_ttl(64)
}

pub fn in_port_match(port: PortNo) -> FlowMatch {
    FlowMatch::new(vec![OxmTlv::exact(OxmField::InPort, port.to_be_bytes())])
}

/// Install a flow the way a decoded controller add would.
pub fn add_flow(
    sw: &Switch,
    table_id: TableId,
    priority: u16,
    pattern: FlowMatch,
    instructions: Vec<Instruction>,
) {
    sw.modify_flow(&FlowMod {
        table_id,
        priority,
        pattern,
        instructions,
        ..Default::default()
    })
    .expect("flow add accepted");
}

/// Like [`add_flow`] with explicit flags, returning the result.
pub fn add_flow_flags(
    sw: &Switch,
    table_id: TableId,
    priority: u16,
    pattern: FlowMatch,
    instructions: Vec<Instruction>,
    flags: FlowModFlags,
) -> Result<(), ofswitch::api::FlowModError> {
    sw.modify_flow(&FlowMod {
        table_id,
        priority,
        pattern,
        instructions,
        flags,
        ..Default::default()
    })
}
