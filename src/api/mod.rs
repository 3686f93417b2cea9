// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Shared vocabulary between the engine and its control-plane
//! callers: table and port identifiers, flow-mod commands and flags,
//! and the flow-mod error taxonomy.

use core::fmt;
use core::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// A flow table identifier. Tables are numbered from zero; table 0
/// always exists and is where every packet enters the pipeline.
pub type TableId = u8;

/// A switch port number.
pub type PortNo = u32;

/// The highest port number usable for a physical or logical port.
pub const PORT_MAX: PortNo = 0xffff_ff00;
/// Flood to all standard ports except the ingress port.
pub const PORT_ALL: PortNo = 0xffff_fffc;
/// Send to the controller as a packet-in.
pub const PORT_CONTROLLER: PortNo = 0xffff_fffd;
/// The switch-local stack.
pub const PORT_LOCAL: PortNo = 0xffff_fffe;
/// Wildcard port, only meaningful in requests.
pub const PORT_ANY: PortNo = 0xffff_ffff;

/// What a table does with a packet that matches none of its entries.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum MissConfig {
    /// Drop the packet.
    Drop,

    /// Hand the packet to the controller as a packet-in.
    #[default]
    Controller,

    /// Continue matching at the next table.
    Continue,
}

impl Display for MissConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Drop => "drop",
            Self::Controller => "controller",
            Self::Continue => "continue",
        };
        write!(f, "{}", s)
    }
}

/// The kind of modification a flow-mod requests.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowModCommand {
    Add,
    Modify,
    ModifyStrict,
    Delete,
    DeleteStrict,
}

bitflags::bitflags! {
    /// Flags carried on a flow-mod and retained on the installed
    /// entry.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    pub struct FlowModFlags: u16 {
        /// Generate a flow-removed notification when the entry is
        /// deleted.
        const SEND_FLOW_REM = 0b0000_0001;

        /// Refuse the add if it collides with an existing entry.
        const CHECK_OVERLAP = 0b0000_0010;

        /// Start the entry's counters from zero on modify.
        const RESET_COUNTS = 0b0000_0100;

        /// Don't keep a packet count for this entry.
        const NO_PKT_COUNTS = 0b0000_1000;

        /// Don't keep a byte count for this entry.
        const NO_BYT_COUNTS = 0b0001_0000;
    }
}

impl Default for FlowModFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Why a flow entry was removed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
}

/// Why a packet was handed to the controller.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PacketInReason {
    /// A table miss with a controller miss policy.
    NoMatch,

    /// An explicit output action addressed to the controller port.
    Action,
}

/// The ways a flow-mod can be refused.
///
/// A refused flow-mod leaves the targeted table untouched; the caller
/// is responsible for turning the error into an OpenFlow error
/// message on the wire.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
pub enum FlowModError {
    #[error("flow overlaps an existing entry")]
    Overlap,

    #[error("no such table: {0}")]
    BadTableId(TableId),

    #[error("bad instruction: {0}")]
    BadInstruction(String),

    #[error("bad action: {0}")]
    BadAction(String),

    #[error("bad match: {0}")]
    BadMatch(String),
}
