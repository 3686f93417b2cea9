// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The datapath engine: matching, actions, instructions, flow
//! tables, and the pipeline driver.

pub mod action;
pub mod flow_table;
pub mod instruction;
pub mod ioctl;
pub mod oxm;
pub mod packet;
pub mod stat;
pub mod switch;
pub mod time;

/// The default number of flow tables a switch carries, and the upper
/// bound on a [`crate::api::TableId`].
pub const DEF_NUM_TABLES: usize = 256;
