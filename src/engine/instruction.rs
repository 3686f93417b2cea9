// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The instruction walk performed for a matched flow entry.

use core::fmt;
use core::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use super::action::run_action_list;
use super::action::Action;
use super::packet::Packet;
use crate::api::FlowModError;
use crate::api::TableId;
use crate::ExecCtx;

/// A flow entry instruction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Instruction {
    /// Run the action list immediately, in list order.
    ApplyActions(Vec<Action>),

    /// Empty the packet's action set.
    ClearActions,

    /// Merge the action list into the packet's action set.
    WriteActions(Vec<Action>),

    /// `metadata := (metadata & !mask) | (value & mask)`
    WriteMetadata { value: u64, mask: u64 },

    /// Continue matching at a strictly higher-numbered table.
    GotoTable(TableId),

    /// Meter tables live outside this engine; a no-op here.
    Meter(u32),

    /// Vendor extension; a no-op here.
    Experimenter(u32),
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ApplyActions(actions) => {
                write!(f, "apply_actions[{}]", list(actions))
            }
            Self::ClearActions => write!(f, "clear_actions"),
            Self::WriteActions(actions) => {
                write!(f, "write_actions[{}]", list(actions))
            }
            Self::WriteMetadata { value, mask } => {
                write!(f, "write_metadata(0x{:x}/0x{:x})", value, mask)
            }
            Self::GotoTable(id) => write!(f, "goto_table({})", id),
            Self::Meter(id) => write!(f, "meter({})", id),
            Self::Experimenter(id) => write!(f, "experimenter({})", id),
        }
    }
}

fn list(actions: &[Action]) -> String {
    actions
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

/// Where the pipeline goes after an entry's instructions have run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NextStep {
    /// Terminate the pipeline and execute the action set.
    Output,

    /// Continue matching at the given table.
    Goto(TableId),
}

/// Walk an entry's instructions in entry order, mutating the packet
/// and tracking the next-step decision. The default is to terminate;
/// a goto overrides it. This never fails; unrecognized instructions
/// were already reduced to no-op variants upstream.
pub fn run_instructions(
    instructions: &[Instruction],
    pkt: &mut Packet,
    ectx: &ExecCtx,
) -> NextStep {
    let mut next = NextStep::Output;

    for instruction in instructions {
        match instruction {
            Instruction::ApplyActions(actions) => {
                run_action_list(actions, pkt, ectx);
            }

            Instruction::ClearActions => pkt.action_set_mut().clear(),

            Instruction::WriteActions(actions) => {
                pkt.action_set_mut().write(actions);
            }

            Instruction::WriteMetadata { value, mask } => {
                pkt.write_metadata(*value, *mask);
            }

            Instruction::GotoTable(id) => next = NextStep::Goto(*id),

            Instruction::Meter(_) | Instruction::Experimenter(_) => (),
        }
    }

    next
}

/// Structural validation of an instruction list, applied at flow-mod
/// admission. `table_id` is the table the entry is destined for;
/// a goto must name a strictly later table that can exist.
pub fn validate_instructions(
    instructions: &[Instruction],
    table_id: TableId,
    num_tables: usize,
) -> Result<(), FlowModError> {
    for instruction in instructions {
        match instruction {
            Instruction::GotoTable(id) => {
                if *id <= table_id {
                    return Err(FlowModError::BadInstruction(format!(
                        "goto_table({}) from table {} goes backwards",
                        id, table_id
                    )));
                }

                if usize::from(*id) >= num_tables {
                    return Err(FlowModError::BadInstruction(format!(
                        "goto_table({}) names a table that cannot exist",
                        id
                    )));
                }
            }

            Instruction::ApplyActions(actions)
            | Instruction::WriteActions(actions) => {
                for action in actions {
                    action.validate()?;
                }
            }

            Instruction::ClearActions
            | Instruction::WriteMetadata { .. }
            | Instruction::Meter(_)
            | Instruction::Experimenter(_) => (),
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::oxm::FieldSet;

    fn pkt() -> Packet {
        Packet::new(1, FieldSet::new(), vec![0; 60])
    }

    #[test]
    fn default_step_is_output() {
        let mut p = pkt();
        let next = run_instructions(&[], &mut p, &ExecCtx::default());
        assert_eq!(next, NextStep::Output);
    }

    #[test]
    fn goto_overrides_output() {
        let mut p = pkt();
        let instrs = vec![
            Instruction::WriteActions(vec![Action::Output(2)]),
            Instruction::GotoTable(3),
        ];
        let next = run_instructions(&instrs, &mut p, &ExecCtx::default());
        assert_eq!(next, NextStep::Goto(3));
        assert!(p.action_set().has_output());
    }

    #[test]
    fn clear_after_write_empties_set() {
        let mut p = pkt();
        let instrs = vec![
            Instruction::WriteActions(vec![
                Action::Output(2),
                Action::DecNwTtl,
            ]),
            Instruction::ClearActions,
        ];
        run_instructions(&instrs, &mut p, &ExecCtx::default());
        assert!(p.action_set().is_empty());
    }

    #[test]
    fn metadata_same_mask_overwrites() {
        let mut p = pkt();
        run_instructions(
            &[Instruction::WriteMetadata { value: 0xaaaa, mask: 0xffff }],
            &mut p,
            &ExecCtx::default(),
        );
        run_instructions(
            &[Instruction::WriteMetadata { value: 0x5555, mask: 0xffff }],
            &mut p,
            &ExecCtx::default(),
        );
        assert_eq!(p.metadata(), 0x5555);
    }

    #[test]
    fn validate_goto_direction() {
        let backwards = vec![Instruction::GotoTable(1)];
        assert!(matches!(
            validate_instructions(&backwards, 1, 256),
            Err(FlowModError::BadInstruction(_))
        ));
        assert!(matches!(
            validate_instructions(&backwards, 2, 256),
            Err(FlowModError::BadInstruction(_))
        ));
        assert!(validate_instructions(&backwards, 0, 256).is_ok());

        let too_far = vec![Instruction::GotoTable(4)];
        assert!(matches!(
            validate_instructions(&too_far, 0, 4),
            Err(FlowModError::BadInstruction(_))
        ));
    }

    #[test]
    fn validate_reaches_nested_actions() {
        let instrs =
            vec![Instruction::ApplyActions(vec![Action::PushMpls(0x0800)])];
        assert!(matches!(
            validate_instructions(&instrs, 0, 256),
            Err(FlowModError::BadAction(_))
        ));
    }
}
