// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The OXM field model and the match evaluator.
//!
//! A flow entry's match is a bag of OXM TLVs; a packet carries a bag
//! of the same shape holding its decoded header fields. Matching is
//! purely set membership with optional bytewise masks. There are no
//! side effects anywhere in this module.

use core::fmt;
use core::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::api::FlowModError;

/// An OXM class.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum OxmClass {
    Nxm0,
    Nxm1,
    OpenflowBasic,
    Experimenter,
}

impl From<OxmClass> for u16 {
    fn from(class: OxmClass) -> u16 {
        match class {
            OxmClass::Nxm0 => 0x0000,
            OxmClass::Nxm1 => 0x0001,
            OxmClass::OpenflowBasic => 0x8000,
            OxmClass::Experimenter => 0xffff,
        }
    }
}

impl Display for OxmClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Nxm0 => "NXM_0",
            Self::Nxm1 => "NXM_1",
            Self::OpenflowBasic => "OPENFLOW_BASIC",
            Self::Experimenter => "EXPERIMENTER",
        };
        write!(f, "{}", s)
    }
}

/// The OpenFlow 1.2 basic match fields.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum OxmField {
    InPort,
    InPhyPort,
    Metadata,
    EthDst,
    EthSrc,
    EthType,
    VlanVid,
    VlanPcp,
    IpDscp,
    IpEcn,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    SctpSrc,
    SctpDst,
    Icmpv4Type,
    Icmpv4Code,
    ArpOp,
    ArpSpa,
    ArpTpa,
    ArpSha,
    ArpTha,
    Ipv6Src,
    Ipv6Dst,
    Ipv6Flabel,
    Icmpv6Type,
    Icmpv6Code,
    NdTarget,
    NdSll,
    NdTll,
    MplsLabel,
    MplsTc,
}

impl OxmField {
    /// The payload width, in bytes, this field carries on the wire.
    pub fn value_len(&self) -> usize {
        use OxmField::*;

        match self {
            InPort | InPhyPort => 4,
            Metadata => 8,
            EthDst | EthSrc => 6,
            EthType => 2,
            VlanVid => 2,
            VlanPcp => 1,
            IpDscp | IpEcn | IpProto => 1,
            Ipv4Src | Ipv4Dst => 4,
            TcpSrc | TcpDst | UdpSrc | UdpDst | SctpSrc | SctpDst => 2,
            Icmpv4Type | Icmpv4Code => 1,
            ArpOp => 2,
            ArpSpa | ArpTpa => 4,
            ArpSha | ArpTha => 6,
            Ipv6Src | Ipv6Dst => 16,
            Ipv6Flabel => 4,
            Icmpv6Type | Icmpv6Code => 1,
            NdTarget => 16,
            NdSll | NdTll => 6,
            MplsLabel => 4,
            MplsTc => 1,
        }
    }
}

impl Display for OxmField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single OXM TLV: a typed field with a value and an optional
/// bytewise mask.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OxmTlv {
    pub class: OxmClass,
    pub field: OxmField,
    pub value: Vec<u8>,
    pub mask: Option<Vec<u8>>,
}

impl OxmTlv {
    /// Build an unmasked `OPENFLOW_BASIC` TLV.
    pub fn exact(field: OxmField, value: impl Into<Vec<u8>>) -> Self {
        Self {
            class: OxmClass::OpenflowBasic,
            field,
            value: value.into(),
            mask: None,
        }
    }

    /// Does the packet-side TLV `pkt` satisfy this entry-side TLV?
    ///
    /// Class and field must agree. If this TLV carries a mask the
    /// comparison is bytewise under that mask, otherwise it is exact
    /// equality.
    pub fn field_eq(&self, pkt: &OxmTlv) -> bool {
        if self.class != pkt.class || self.field != pkt.field {
            return false;
        }

        if self.value.len() != pkt.value.len() {
            return false;
        }

        match &self.mask {
            None => self.value == pkt.value,
            Some(mask) => {
                if mask.len() != self.value.len() {
                    return false;
                }
                self.value
                    .iter()
                    .zip(&pkt.value)
                    .zip(mask)
                    .all(|((e, p), m)| e & m == p & m)
            }
        }
    }

    pub fn key(&self) -> (OxmClass, OxmField) {
        (self.class, self.field)
    }

    /// Build a masked `OPENFLOW_BASIC` TLV.
    pub fn masked(
        field: OxmField,
        value: impl Into<Vec<u8>>,
        mask: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            class: OxmClass::OpenflowBasic,
            field,
            value: value.into(),
            mask: Some(mask.into()),
        }
    }

    /// Structural validation, applied at flow-mod admission. The
    /// packet path never calls this; a malformed TLV that somehow
    /// reaches matching simply fails to match.
    pub fn validate(&self) -> Result<(), FlowModError> {
        let want = self.field.value_len();

        if self.value.len() != want {
            return Err(FlowModError::BadMatch(format!(
                "{} wants a {}-byte value, got {}",
                self.field,
                want,
                self.value.len()
            )));
        }

        if let Some(mask) = &self.mask {
            if mask.len() != want {
                return Err(FlowModError::BadMatch(format!(
                    "{} wants a {}-byte mask, got {}",
                    self.field,
                    want,
                    mask.len()
                )));
            }
        }

        Ok(())
    }
}

impl Display for OxmTlv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.mask {
            None => {
                write!(f, "{}={:02x?}", self.field, self.value)
            }
            Some(mask) => {
                write!(f, "{}={:02x?}/{:02x?}", self.field, self.value, mask)
            }
        }
    }
}

/// The bag of decoded header fields a packet carries through the
/// pipeline. At most one TLV per (class, field); packet-side TLVs
/// never carry masks.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FieldSet {
    fields: Vec<OxmTlv>,
}

impl FieldSet {
    pub fn get(&self, class: OxmClass, field: OxmField) -> Option<&OxmTlv> {
        self.fields.iter().find(|tlv| tlv.key() == (class, field))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OxmTlv> {
        self.fields.iter()
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(
        &mut self,
        class: OxmClass,
        field: OxmField,
    ) -> Option<OxmTlv> {
        let idx =
            self.fields.iter().position(|tlv| tlv.key() == (class, field))?;
        Some(self.fields.remove(idx))
    }

    /// Overwrite the field named by `tlv`, inserting it if absent.
    pub fn set(&mut self, tlv: OxmTlv) {
        match self.fields.iter_mut().find(|have| have.key() == tlv.key()) {
            Some(have) => *have = tlv,
            None => self.fields.push(tlv),
        }
    }
}

impl From<Vec<OxmTlv>> for FieldSet {
    fn from(fields: Vec<OxmTlv>) -> Self {
        let mut set = Self::new();
        for tlv in fields {
            set.set(tlv);
        }
        set
    }
}

/// A flow entry's match set.
///
/// An empty match is the wildcard: it is satisfied by every packet.
/// Tables express their miss behavior through an explicit
/// lowest-priority catch-all entry rather than any special casing
/// here.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowMatch {
    fields: Vec<OxmTlv>,
}

impl FlowMatch {
    /// Every TLV in `self`, under its own mask, agrees with a
    /// counterpart in `other`, and `other` constrains at least the
    /// bits `self` constrains. Used to select entries for the loose
    /// modify and delete commands: the filter covers any entry at
    /// least as specific as itself, and the empty filter covers
    /// everything.
    pub fn covers(&self, other: &FlowMatch) -> bool {
        self.fields.iter().all(|f| {
            other.fields.iter().any(|g| Self::tlv_covers(f, g))
        })
    }

    pub fn fields(&self) -> &[OxmTlv] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The match decision: every TLV this entry specifies has a
    /// field-equal counterpart in the packet's field bag.
    pub fn matches(&self, pkt: &FieldSet) -> bool {
        self.fields.iter().all(|f| {
            pkt.iter().any(|g| f.field_eq(g))
        })
    }

    pub fn new(fields: Vec<OxmTlv>) -> Self {
        Self { fields }
    }

    /// Field-set equality irrespective of TLV order; the strict
    /// command selector and the per-table uniqueness check.
    pub fn same_fields(&self, other: &FlowMatch) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|f| other.fields.iter().any(|g| f == g))
    }

    fn tlv_covers(filter: &OxmTlv, entry: &OxmTlv) -> bool {
        if filter.key() != entry.key()
            || filter.value.len() != entry.value.len()
        {
            return false;
        }

        let len = filter.value.len();
        let ones = vec![0xffu8; len];
        let fmask = filter.mask.as_deref().unwrap_or(&ones);
        let emask = entry.mask.as_deref().unwrap_or(&ones);

        if emask.len() != len || fmask.len() != len {
            return false;
        }

        for i in 0..len {
            // The entry must fix every bit the filter cares about.
            if emask[i] & fmask[i] != fmask[i] {
                return false;
            }
            if filter.value[i] & fmask[i] != entry.value[i] & fmask[i] {
                return false;
            }
        }

        true
    }

    /// Structural validation, applied at flow-mod admission.
    pub fn validate(&self) -> Result<(), FlowModError> {
        for (i, tlv) in self.fields.iter().enumerate() {
            tlv.validate()?;

            if self.fields[..i].iter().any(|prev| prev.key() == tlv.key()) {
                return Err(FlowModError::BadMatch(format!(
                    "duplicate field: {}",
                    tlv.field
                )));
            }
        }

        Ok(())
    }
}

impl Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.fields.is_empty() {
            return write!(f, "any");
        }

        let s = self
            .fields
            .iter()
            .map(|tlv| tlv.to_string())
            .collect::<Vec<String>>()
            .join(",");
        write!(f, "{}", s)
    }
}
