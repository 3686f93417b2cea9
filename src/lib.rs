// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! A userspace OpenFlow-compatible software switch datapath.
//!
//! This crate implements the flow-table pipeline and flow-mod
//! machinery of an OpenFlow 1.2 style switch: prioritized flow
//! tables, masked OXM matching, the instruction walk, the deferred
//! action set, and per-table and per-entry counters. Port I/O and the
//! controller transport are collaborators plugged in as providers;
//! the engine itself never touches a socket.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use std::sync::Arc;

pub mod api;
pub mod engine;

use api::PacketInReason;
use api::PortNo;
use engine::ioctl::FlowRemoved;
use engine::packet::Packet;

// ================================================================
// Providers
//
// Providers allow the engine to work in different contexts by
// letting the surrounding process plug in implementations of the
// services the datapath depends on. A production harness would wire
// these to real NIC queues and an OpenFlow channel; unit tests wire
// them to capture buffers. If an abstraction doesn't have at least
// two obvious implementations it probably doesn't need to be a
// provider.
// ================================================================

/// The egress provider consumes packets the datapath has decided to
/// emit. Implementations are allowed to block.
pub trait EgressProvider: Send + Sync {
    /// Submit a snapshot of the packet for transmission on `port`.
    fn emit(&self, port: PortNo, pkt: Packet);
}

/// The controller provider consumes packets and notifications bound
/// for the OpenFlow controller. Implementations are allowed to block.
pub trait ControllerProvider: Send + Sync {
    /// Submit a packet-in snapshot.
    fn send(&self, reason: PacketInReason, pkt: Packet);

    /// Notify the controller that a flow entry was removed. Only
    /// entries installed with `SEND_FLOW_REM` generate this call.
    fn flow_removed(&self, _removed: FlowRemoved) {}
}

/// An egress provider that discards everything handed to it.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardEgress;

impl EgressProvider for DiscardEgress {
    fn emit(&self, _port: PortNo, _pkt: Packet) {}
}

/// A controller provider that discards everything handed to it.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardController;

impl ControllerProvider for DiscardController {
    fn send(&self, _reason: PacketInReason, _pkt: Packet) {}
}

/// The execution context handed through the pipeline; holds the
/// collaborator sinks the datapath emits into.
#[derive(Clone)]
pub struct ExecCtx {
    pub egress: Arc<dyn EgressProvider>,
    pub controller: Arc<dyn ControllerProvider>,
}

impl Default for ExecCtx {
    fn default() -> Self {
        Self {
            egress: Arc::new(DiscardEgress),
            controller: Arc::new(DiscardController),
        }
    }
}
