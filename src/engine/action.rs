// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Actions: the immediate list evaluator and the deferred action set.

use core::fmt;
use core::fmt::Display;
use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::oxm::OxmField;
use super::oxm::OxmTlv;
use super::packet::Packet;
use crate::api::FlowModError;
use crate::api::PacketInReason;
use crate::api::PortNo;
use crate::api::PORT_CONTROLLER;
use crate::ExecCtx;

/// A single datapath action.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Action {
    /// Emit a snapshot of the packet on the given port. The
    /// controller port routes to the controller provider instead of
    /// egress.
    Output(PortNo),

    /// Process through a group. Group tables live outside this
    /// engine; accepted without effect.
    Group(u32),

    /// Assign a transmit queue. Queues live outside this engine;
    /// accepted without effect.
    SetQueue(u32),

    SetMplsTtl(u8),
    DecMplsTtl,
    SetNwTtl(u8),
    DecNwTtl,
    CopyTtlOut,
    CopyTtlIn,
    PushVlan(u16),
    PopVlan,
    PushMpls(u16),
    PopMpls(u16),

    /// Overwrite a header field, adding it if absent.
    SetField(OxmTlv),

    /// Vendor extension; a no-op here.
    Experimenter(u32),
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Output(_) => ActionType::Output,
            Self::Group(_) => ActionType::Group,
            Self::SetQueue(_) => ActionType::SetQueue,
            Self::SetMplsTtl(_) => ActionType::SetMplsTtl,
            Self::DecMplsTtl => ActionType::DecMplsTtl,
            Self::SetNwTtl(_) => ActionType::SetNwTtl,
            Self::DecNwTtl => ActionType::DecNwTtl,
            Self::CopyTtlOut => ActionType::CopyTtlOut,
            Self::CopyTtlIn => ActionType::CopyTtlIn,
            Self::PushVlan(_) => ActionType::PushVlan,
            Self::PopVlan => ActionType::PopVlan,
            Self::PushMpls(_) => ActionType::PushMpls,
            Self::PopMpls(_) => ActionType::PopMpls,
            Self::SetField(_) => ActionType::SetField,
            Self::Experimenter(_) => ActionType::Experimenter,
        }
    }

    /// Structural validation, applied at flow-mod admission only.
    /// The packet path accepts anything.
    pub fn validate(&self) -> Result<(), FlowModError> {
        match self {
            Self::PushVlan(tpid) if *tpid != 0x8100 && *tpid != 0x88a8 => {
                Err(FlowModError::BadAction(format!(
                    "push_vlan with non-VLAN EtherType 0x{:04x}",
                    tpid
                )))
            }

            Self::PushMpls(et) if *et != 0x8847 && *et != 0x8848 => {
                Err(FlowModError::BadAction(format!(
                    "push_mpls with non-MPLS EtherType 0x{:04x}",
                    et
                )))
            }

            Self::SetField(tlv) => {
                match tlv.field {
                    OxmField::InPort
                    | OxmField::InPhyPort
                    | OxmField::Metadata => {
                        return Err(FlowModError::BadAction(format!(
                            "set_field cannot write {}",
                            tlv.field
                        )));
                    }
                    _ => (),
                }

                tlv.validate().map_err(|e| {
                    FlowModError::BadAction(format!("set_field: {}", e))
                })
            }

            _ => Ok(()),
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Output(port) => write!(f, "output({})", port),
            Self::Group(id) => write!(f, "group({})", id),
            Self::SetQueue(id) => write!(f, "set_queue({})", id),
            Self::SetMplsTtl(ttl) => write!(f, "set_mpls_ttl({})", ttl),
            Self::DecMplsTtl => write!(f, "dec_mpls_ttl"),
            Self::SetNwTtl(ttl) => write!(f, "set_nw_ttl({})", ttl),
            Self::DecNwTtl => write!(f, "dec_nw_ttl"),
            Self::CopyTtlOut => write!(f, "copy_ttl_out"),
            Self::CopyTtlIn => write!(f, "copy_ttl_in"),
            Self::PushVlan(tpid) => write!(f, "push_vlan(0x{:04x})", tpid),
            Self::PopVlan => write!(f, "pop_vlan"),
            Self::PushMpls(et) => write!(f, "push_mpls(0x{:04x})", et),
            Self::PopMpls(et) => write!(f, "pop_mpls(0x{:04x})", et),
            Self::SetField(tlv) => write!(f, "set_field({})", tlv),
            Self::Experimenter(id) => write!(f, "experimenter({})", id),
        }
    }
}

/// The action-set slot an action occupies. Declaration order is the
/// canonical execution order; output runs last.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum ActionType {
    CopyTtlIn,
    PopVlan,
    PopMpls,
    PushMpls,
    PushVlan,
    CopyTtlOut,
    DecMplsTtl,
    DecNwTtl,
    SetMplsTtl,
    SetNwTtl,
    SetField,
    SetQueue,
    Group,
    Experimenter,
    Output,
}

/// Run an action list in list order, mutating the packet in place.
///
/// This never fails: an output just emits a snapshot and evaluation
/// continues with the packet unchanged.
pub fn run_action_list(actions: &[Action], pkt: &mut Packet, ectx: &ExecCtx) {
    for action in actions {
        run_action(action, pkt, ectx);
    }
}

fn run_action(action: &Action, pkt: &mut Packet, ectx: &ExecCtx) {
    match action {
        Action::Output(port) => {
            pkt.mark_emitted();
            if *port == PORT_CONTROLLER {
                ectx.controller.send(PacketInReason::Action, pkt.clone());
            } else {
                ectx.egress.emit(*port, pkt.clone());
            }
        }

        Action::Group(_) | Action::SetQueue(_) | Action::Experimenter(_) => (),

        Action::SetMplsTtl(ttl) => pkt.set_mpls_ttl(*ttl),
        Action::DecMplsTtl => pkt.dec_mpls_ttl(),
        Action::SetNwTtl(ttl) => pkt.set_nw_ttl(*ttl),
        Action::DecNwTtl => pkt.dec_nw_ttl(),
        Action::CopyTtlOut => pkt.copy_ttl_out(),
        Action::CopyTtlIn => pkt.copy_ttl_in(),
        Action::PushVlan(tpid) => pkt.push_vlan(*tpid),
        Action::PopVlan => pkt.pop_vlan(),
        Action::PushMpls(et) => pkt.push_mpls(*et),
        Action::PopMpls(et) => pkt.pop_mpls(*et),
        Action::SetField(tlv) => pkt.set_field(tlv.clone()),
    }
}

/// The deferred action set carried with a packet: at most one action
/// per [`ActionType`], executed in canonical order at pipeline
/// termination.
#[derive(Clone, Debug, Default)]
pub struct ActionSet {
    set: BTreeMap<ActionType, Action>,
}

impl ActionSet {
    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Run the set in canonical order. Returns whether an output
    /// action was present.
    pub fn execute(&self, pkt: &mut Packet, ectx: &ExecCtx) -> bool {
        for action in self.set.values() {
            run_action(action, pkt, ectx);
        }

        self.has_output()
    }

    pub fn has_output(&self) -> bool {
        self.set.contains_key(&ActionType::Output)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// The merge half of write-actions: each incoming action replaces
    /// any existing action of the same type, otherwise it is
    /// inserted.
    pub fn write(&mut self, actions: &[Action]) {
        for action in actions {
            self.set.insert(action.action_type(), action.clone());
        }
    }
}
