// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The in-flight packet.
//!
//! A packet enters the pipeline carrying its opaque payload, the bag
//! of OXM fields the I/O layer decoded from its headers, a zeroed
//! 64-bit metadata register, and an empty action set. Only the action
//! and instruction evaluators mutate it, and it is owned by exactly
//! one traversal from entry to disposition.

use serde::Deserialize;
use serde::Serialize;

use super::action::ActionSet;
use super::oxm::FieldSet;
use super::oxm::OxmClass;
use super::oxm::OxmField;
use super::oxm::OxmTlv;
use crate::api::PortNo;

/// An 802.1Q tag somewhere in the packet's header stack.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VlanTag {
    pub pcp: u8,
    pub vid: u16,

    // The EtherType this tag displaced when it was pushed; restored
    // on pop.
    ethertype: u16,
}

/// An MPLS shim header somewhere in the packet's header stack.
///
/// Unlike a VLAN tag, popping a shim names the EtherType it exposes,
/// so nothing about the displaced payload needs to be remembered.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MplsHeader {
    pub label: u32,
    pub tc: u8,
    pub bos: bool,
    pub ttl: u8,
}

#[derive(Clone, Debug)]
pub struct Packet {
    in_port: PortNo,
    len: u64,
    metadata: u64,
    fields: FieldSet,

    // Outermost tag/header last.
    vlan: Vec<VlanTag>,
    mpls: Vec<MplsHeader>,

    // The IP TTL, when the packet carries an IP header. Not
    // matchable, so it lives outside the field bag.
    nw_ttl: Option<u8>,

    // Whether any output action has run for this packet, immediately
    // or from the action set. Decides the terminal disposition.
    emitted: bool,

    action_set: ActionSet,
    body: Vec<u8>,
}

impl Packet {
    pub fn action_set(&self) -> &ActionSet {
        &self.action_set
    }

    pub fn action_set_mut(&mut self) -> &mut ActionSet {
        &mut self.action_set
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Copy the TTL of the outermost TTL-bearing header inwards, to
    /// the next one below it.
    pub fn copy_ttl_in(&mut self) {
        let n = self.mpls.len();
        if n >= 2 {
            let outer = self.mpls[n - 1].ttl;
            self.mpls[n - 2].ttl = outer;
        } else if n == 1 && self.nw_ttl.is_some() {
            self.nw_ttl = Some(self.mpls[0].ttl);
        }
    }

    /// Copy the TTL of the next-to-outermost TTL-bearing header
    /// outwards, to the outermost one.
    pub fn copy_ttl_out(&mut self) {
        let n = self.mpls.len();
        if n >= 2 {
            let inner = self.mpls[n - 2].ttl;
            self.mpls[n - 1].ttl = inner;
        } else if n == 1 {
            if let Some(ttl) = self.nw_ttl {
                self.mpls[0].ttl = ttl;
            }
        }
    }

    pub fn dec_mpls_ttl(&mut self) {
        if let Some(hdr) = self.mpls.last_mut() {
            hdr.ttl = hdr.ttl.saturating_sub(1);
        }
    }

    pub fn dec_nw_ttl(&mut self) {
        if let Some(ttl) = self.nw_ttl {
            self.nw_ttl = Some(ttl.saturating_sub(1));
        }
    }

    /// Whether an output action has run for this packet.
    pub fn emitted(&self) -> bool {
        self.emitted
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn in_port(&self) -> PortNo {
        self.in_port
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn mark_emitted(&mut self) {
        self.emitted = true;
    }

    pub fn metadata(&self) -> u64 {
        self.metadata
    }

    pub fn mpls(&self) -> &[MplsHeader] {
        &self.mpls
    }

    /// Build a fresh packet as the I/O layer would hand it to the
    /// pipeline. The ingress port and a zeroed metadata register are
    /// mirrored into the field bag so that entries can match on them.
    pub fn new(in_port: PortNo, fields: FieldSet, body: Vec<u8>) -> Self {
        let len = body.len() as u64;
        let mut fields = fields;
        fields.set(OxmTlv::exact(OxmField::InPort, in_port.to_be_bytes()));
        fields.set(OxmTlv::exact(OxmField::Metadata, 0u64.to_be_bytes()));

        Self {
            in_port,
            len,
            metadata: 0,
            fields,
            vlan: Vec::new(),
            mpls: Vec::new(),
            nw_ttl: None,
            emitted: false,
            action_set: ActionSet::new(),
            body,
        }
    }

    pub fn nw_ttl(&self) -> Option<u8> {
        self.nw_ttl
    }

    /// Pop the outermost MPLS header; `ethertype` names the payload
    /// that is exposed underneath.
    pub fn pop_mpls(&mut self, ethertype: u16) {
        if self.mpls.pop().is_none() {
            return;
        }

        self.set_raw(OxmField::EthType, ethertype.to_be_bytes().to_vec());
        self.sync_mpls_fields();
    }

    /// Pop the outermost VLAN tag, restoring the EtherType it
    /// displaced.
    pub fn pop_vlan(&mut self) {
        let Some(tag) = self.vlan.pop() else {
            return;
        };

        self.set_raw(OxmField::EthType, tag.ethertype.to_be_bytes().to_vec());
        self.sync_vlan_fields();
    }

    /// Push a new MPLS header with the given EtherType. Fields are
    /// inherited from the existing outermost MPLS header when there
    /// is one, otherwise the label starts at zero and the TTL comes
    /// from the IP header.
    pub fn push_mpls(&mut self, ethertype: u16) {
        let hdr = match self.mpls.last() {
            Some(outer) => MplsHeader {
                label: outer.label,
                tc: outer.tc,
                bos: false,
                ttl: outer.ttl,
            },
            None => MplsHeader {
                label: 0,
                tc: 0,
                bos: true,
                ttl: self.nw_ttl.unwrap_or(0),
            },
        };

        self.mpls.push(hdr);
        self.set_raw(OxmField::EthType, ethertype.to_be_bytes().to_vec());
        self.sync_mpls_fields();
    }

    /// Push a new VLAN tag with the given TPID. The VID and PCP are
    /// inherited from the existing outermost tag when there is one.
    pub fn push_vlan(&mut self, tpid: u16) {
        let displaced = self.ethertype().unwrap_or(0);
        let tag = match self.vlan.last() {
            Some(outer) => VlanTag {
                pcp: outer.pcp,
                vid: outer.vid,
                ethertype: displaced,
            },
            None => VlanTag { pcp: 0, vid: 0, ethertype: displaced },
        };

        self.vlan.push(tag);
        self.set_raw(OxmField::EthType, tpid.to_be_bytes().to_vec());
        self.sync_vlan_fields();
    }

    /// Overwrite the named field, inserting it if absent. Header
    /// stack state is kept in agreement for the stack-backed fields.
    pub fn set_field(&mut self, tlv: OxmTlv) {
        match tlv.field {
            OxmField::VlanVid => {
                if let (Some(tag), Some(vid)) =
                    (self.vlan.last_mut(), be16(&tlv.value))
                {
                    tag.vid = vid & 0x0fff;
                }
            }
            OxmField::VlanPcp => {
                if let (Some(tag), Some(&pcp)) =
                    (self.vlan.last_mut(), tlv.value.first())
                {
                    tag.pcp = pcp & 0x07;
                }
            }
            OxmField::MplsLabel => {
                if let (Some(hdr), Some(label)) =
                    (self.mpls.last_mut(), be32(&tlv.value))
                {
                    hdr.label = label & 0x000f_ffff;
                }
            }
            OxmField::MplsTc => {
                if let (Some(hdr), Some(&tc)) =
                    (self.mpls.last_mut(), tlv.value.first())
                {
                    hdr.tc = tc & 0x07;
                }
            }
            _ => (),
        }

        self.fields.set(tlv);
    }

    pub fn set_mpls_ttl(&mut self, ttl: u8) {
        if let Some(hdr) = self.mpls.last_mut() {
            hdr.ttl = ttl;
        }
    }

    pub fn set_nw_ttl(&mut self, ttl: u8) {
        if self.nw_ttl.is_some() {
            self.nw_ttl = Some(ttl);
        }
    }

    /// Replace the packet's action set with an empty one, returning
    /// the old set. The pipeline driver uses this at termination so
    /// the set can be executed against the packet it rode in on.
    pub fn take_action_set(&mut self) -> ActionSet {
        core::mem::take(&mut self.action_set)
    }

    pub fn vlan(&self) -> &[VlanTag] {
        &self.vlan
    }

    /// Declare the decoded IP TTL. Intended for the I/O layer when it
    /// parses an IP header; the TTL actions are no-ops without it.
    pub fn with_nw_ttl(mut self, ttl: u8) -> Self {
        self.nw_ttl = Some(ttl);
        self
    }

    /// `metadata := (metadata & !mask) | (value & mask)`
    pub fn write_metadata(&mut self, value: u64, mask: u64) {
        self.metadata = (self.metadata & !mask) | (value & mask);
        self.set_raw(OxmField::Metadata, self.metadata.to_be_bytes().to_vec());
    }

    fn ethertype(&self) -> Option<u16> {
        self.fields
            .get(OxmClass::OpenflowBasic, OxmField::EthType)
            .and_then(|tlv| be16(&tlv.value))
    }

    fn set_raw(&mut self, field: OxmField, value: Vec<u8>) {
        self.fields.set(OxmTlv::exact(field, value));
    }

    fn sync_mpls_fields(&mut self) {
        match self.mpls.last().copied() {
            Some(hdr) => {
                self.set_raw(
                    OxmField::MplsLabel,
                    hdr.label.to_be_bytes().to_vec(),
                );
                self.set_raw(OxmField::MplsTc, vec![hdr.tc]);
            }
            None => {
                self.fields
                    .remove(OxmClass::OpenflowBasic, OxmField::MplsLabel);
                self.fields.remove(OxmClass::OpenflowBasic, OxmField::MplsTc);
            }
        }
    }

    fn sync_vlan_fields(&mut self) {
        match self.vlan.last().copied() {
            Some(tag) => {
                self.set_raw(
                    OxmField::VlanVid,
                    tag.vid.to_be_bytes().to_vec(),
                );
                self.set_raw(OxmField::VlanPcp, vec![tag.pcp]);
            }
            None => {
                self.fields.remove(OxmClass::OpenflowBasic, OxmField::VlanVid);
                self.fields.remove(OxmClass::OpenflowBasic, OxmField::VlanPcp);
            }
        }
    }
}

fn be16(bytes: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(bytes.try_into().ok()?))
}

fn be32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip_pkt() -> Packet {
        let fields = FieldSet::from(vec![
            OxmTlv::exact(OxmField::EthType, 0x0800u16.to_be_bytes()),
            OxmTlv::exact(OxmField::Ipv4Src, [10, 0, 0, 1]),
        ]);
        Packet::new(7, fields, vec![0xa; 64]).with_nw_ttl(64)
    }

    #[test]
    fn ctor_mirrors_in_port_and_metadata() {
        let pkt = ip_pkt();
        assert_eq!(pkt.len(), 64);
        assert_eq!(
            pkt.fields()
                .get(OxmClass::OpenflowBasic, OxmField::InPort)
                .unwrap()
                .value,
            7u32.to_be_bytes().to_vec()
        );
        assert_eq!(
            pkt.fields()
                .get(OxmClass::OpenflowBasic, OxmField::Metadata)
                .unwrap()
                .value,
            vec![0; 8]
        );
    }

    #[test]
    fn metadata_write_is_masked() {
        let mut pkt = ip_pkt();
        pkt.write_metadata(0xffff, 0x00ff);
        assert_eq!(pkt.metadata(), 0x00ff);
        pkt.write_metadata(0x0000, 0x000f);
        assert_eq!(pkt.metadata(), 0x00f0);
        assert_eq!(
            pkt.fields()
                .get(OxmClass::OpenflowBasic, OxmField::Metadata)
                .unwrap()
                .value,
            0x00f0u64.to_be_bytes().to_vec()
        );
    }

    #[test]
    fn vlan_push_pop() {
        let mut pkt = ip_pkt();
        pkt.push_vlan(0x8100);
        assert_eq!(pkt.vlan().len(), 1);
        assert_eq!(
            pkt.fields()
                .get(OxmClass::OpenflowBasic, OxmField::EthType)
                .unwrap()
                .value,
            0x8100u16.to_be_bytes().to_vec()
        );

        pkt.set_field(OxmTlv::exact(OxmField::VlanVid, 100u16.to_be_bytes()));
        assert_eq!(pkt.vlan()[0].vid, 100);

        // A second push inherits the outer tag's VID.
        pkt.push_vlan(0x88a8);
        assert_eq!(pkt.vlan().len(), 2);
        assert_eq!(pkt.vlan()[1].vid, 100);

        pkt.pop_vlan();
        pkt.pop_vlan();
        assert!(pkt.vlan().is_empty());
        assert_eq!(
            pkt.fields()
                .get(OxmClass::OpenflowBasic, OxmField::EthType)
                .unwrap()
                .value,
            0x0800u16.to_be_bytes().to_vec()
        );
        assert!(pkt
            .fields()
            .get(OxmClass::OpenflowBasic, OxmField::VlanVid)
            .is_none());
    }

    #[test]
    fn mpls_ttl_ops() {
        let mut pkt = ip_pkt();
        pkt.push_mpls(0x8847);
        // Bottom-of-stack TTL comes from the IP header.
        assert_eq!(pkt.mpls()[0].ttl, 64);
        assert!(pkt.mpls()[0].bos);

        pkt.set_mpls_ttl(2);
        pkt.dec_mpls_ttl();
        pkt.dec_mpls_ttl();
        pkt.dec_mpls_ttl();
        // Clamped at zero.
        assert_eq!(pkt.mpls()[0].ttl, 0);

        pkt.copy_ttl_in();
        assert_eq!(pkt.nw_ttl(), Some(0));
    }

    #[test]
    fn nw_ttl_absent_is_noop() {
        let mut pkt = Packet::new(1, FieldSet::new(), vec![]);
        pkt.dec_nw_ttl();
        pkt.set_nw_ttl(10);
        assert_eq!(pkt.nw_ttl(), None);
    }

    #[test]
    fn copy_ttl_between_mpls_headers() {
        let mut pkt = ip_pkt();
        pkt.push_mpls(0x8847);
        pkt.set_mpls_ttl(33);
        pkt.push_mpls(0x8847);
        pkt.set_mpls_ttl(9);

        pkt.copy_ttl_out();
        assert_eq!(pkt.mpls()[1].ttl, 33);

        pkt.set_mpls_ttl(5);
        pkt.copy_ttl_in();
        assert_eq!(pkt.mpls()[0].ttl, 5);
    }
}
