//! Shared test utilities for the code-motion transforms.
//!
//! Consolidates factory functions and IR sanity checks used across the
//! transform and driver tests. Only compiled in test builds.

use crate::ir::{BlockId, Function, Terminator, ValueId};

/// Shorthand for `ValueId::new(n)`.
pub(crate) fn v(n: u32) -> ValueId {
    ValueId::new(n)
}

/// Shorthand for `BlockId::new(n)`.
pub(crate) fn b(n: u32) -> BlockId {
    BlockId::new(n)
}

/// Count retains (`StrongRetain` + `RetainValue`) in a block.
pub(crate) fn count_block_retains(func: &Function, block_idx: usize) -> usize {
    func.blocks[block_idx]
        .body
        .iter()
        .filter(|i| i.is_retain())
        .count()
}

/// Count releases (`StrongRelease` + `ReleaseValue`) in a block.
pub(crate) fn count_releases(func: &Function, block_idx: usize) -> usize {
    func.blocks[block_idx]
        .body
        .iter()
        .filter(|i| i.is_release())
        .count()
}

/// Count all RC operations across the entire function.
pub(crate) fn count_rc_ops(func: &Function) -> usize {
    func.blocks
        .iter()
        .flat_map(|bl| bl.body.iter())
        .filter(|i| i.is_retain() || i.is_release())
        .count()
}

/// Assert basic IR sanity after a transform:
///
/// - every instruction operand references a defined value;
/// - every value a terminator reads is at least registered (undef values
///   live only in terminator argument slots and have no defining site);
/// - branch argument arity matches the target's parameter list.
pub(crate) fn assert_valid(func: &Function) {
    for block in &func.blocks {
        for (i, instr) in block.body.iter().enumerate() {
            for op in instr.operands() {
                assert!(
                    func.def_site(op).is_some(),
                    "dangling use of {op:?} by instruction {i} in block {:?}",
                    block.id,
                );
            }
        }
        for used in block.terminator.used_values() {
            assert!(
                used.index() < func.value_types.len(),
                "terminator of block {:?} reads unregistered value {used:?}",
                block.id,
            );
        }
        match &block.terminator {
            Terminator::Branch { target, args } => {
                assert_eq!(
                    args.len(),
                    func.block(*target).params.len(),
                    "branch arity mismatch from {:?} to {target:?}",
                    block.id,
                );
            }
            Terminator::CondBranch {
                then_dest,
                then_args,
                else_dest,
                else_args,
                ..
            } => {
                assert_eq!(
                    then_args.len(),
                    func.block(*then_dest).params.len(),
                    "branch arity mismatch from {:?} to {then_dest:?}",
                    block.id,
                );
                assert_eq!(
                    else_args.len(),
                    func.block(*else_dest).params.len(),
                    "branch arity mismatch from {:?} to {else_dest:?}",
                    block.id,
                );
            }
            _ => {}
        }
    }
}
