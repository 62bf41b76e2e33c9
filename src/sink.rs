//! Generic code sinking from predecessors.
//!
//! A block reached by several predecessors, each of which falls through
//! only into it, often ends with the same tail in every predecessor — most
//! commonly matching RC operations produced by earlier ARC phases. These
//! transforms merge such tails into the successor:
//!
//! - [`sink_code_from_predecessors`] moves an instruction found (possibly
//!   with operands rewritten through block arguments) at the end of every
//!   predecessor into the successor's head and erases the duplicates.
//! - [`sink_arguments_from_predecessors`] sinks the *producers* of block
//!   arguments when every predecessor passes a structurally identical
//!   instruction, or instructions differing only in one cheap operand.
//! - [`sink_literals_from_predecessors`] does the same for literal
//!   arguments, leaving the predecessors untouched.
//! - [`canonicalize_ref_count_instrs`] rewrites strong RC operands to
//!   their shallow roots so that more of them become structurally
//!   identical and eligible for the above.
//!
//! All scans run backward from the terminator and give up after a fixed
//! window of [`SINK_SEARCH_WINDOW`] entries or at the first sink barrier
//! (a side-effecting non-terminator).

use rustc_hash::FxHashMap;

use crate::analysis::find_value_shallow_root;
use crate::graph::{block_id, single_successor};
use crate::ir::{BlockId, DefSite, Function, Instr, Terminator, ValueId};
use crate::types::TypePool;
use crate::CodeMotionStats;

/// How far backward from a terminator the sinking scans look.
pub(crate) const SINK_SEARCH_WINDOW: usize = 6;

/// Map from (value, predecessor block) to the argument index the value is
/// passed at by the predecessor's branch.
type ValueToArgIdxMap = FxHashMap<(ValueId, BlockId), usize>;

/// Relation between the operands of matched instructions. A single state
/// is threaded through every operand comparison of one sinking candidate,
/// across all predecessors: the candidate either matches everywhere on the
/// same SSA values, or everywhere through the successor's arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OperandRelation {
    /// Uninitialized state.
    NotDeterminedYet,
    /// The original operand values are equal.
    AlwaysEqual,
    /// The operand values are equal after replacing with the successor
    /// block arguments.
    EqualAfterMove,
}

/// Returns `true` if this instruction can be sunk to another block without
/// rewriting users: it has no uses and is not a terminator (terminators
/// are held separately, so any body instruction qualifies on that front).
fn can_sink_instruction(func: &Function, instr: &Instr) -> bool {
    instr
        .defined_value()
        .map_or(true, |dst| !func.has_uses(dst))
}

/// Returns `true` if this instruction is a sink barrier: other code cannot
/// be moved past it.
fn is_sink_barrier(instr: &Instr) -> bool {
    instr.may_have_side_effects()
}

/// Compare one operand pair under the shared relation.
///
/// The relation is mutated as a side effect even when a later operand of
/// the same candidate fails to match; the next candidate inherits it.
fn operands_match(
    op1: ValueId,
    op2: ValueId,
    rel: &mut OperandRelation,
    map: &ValueToArgIdxMap,
    iden_block: BlockId,
    scan_block: BlockId,
) -> bool {
    if *rel != OperandRelation::EqualAfterMove && op1 == op2 {
        // The trivial case.
        *rel = OperandRelation::AlwaysEqual;
        return true;
    }

    // Check if both operand values are passed to the same block argument
    // in the successor block. This means that the operands are equal after
    // we move the instruction into the successor block.
    if *rel != OperandRelation::AlwaysEqual {
        if let (Some(&i1), Some(&i2)) = (map.get(&(op1, iden_block)), map.get(&(op2, scan_block))) {
            if i1 == i2 {
                *rel = OperandRelation::EqualAfterMove;
                return true;
            }
        }
    }
    false
}

/// Search `block` for an instruction identical to `target`, scanning
/// backward from the terminator, stopping on sink barriers or after the
/// search window. Returns the body index of the match.
pub(crate) fn find_identical_in_block(
    func: &Function,
    block: BlockId,
    target: &Instr,
    target_block: BlockId,
    value_to_arg_idx: &ValueToArgIdxMap,
    rel: &mut OperandRelation,
) -> Option<usize> {
    let body = &func.block(block).body;
    let mut budget = SINK_SEARCH_WINDOW;
    // `pos == body.len()` is the terminator position.
    let mut pos = body.len();

    loop {
        if budget == 0 {
            return None;
        }
        if pos < body.len() {
            let instr = &body[pos];
            if can_sink_instruction(func, instr)
                && target.is_identical_to(instr, |a, b| {
                    operands_match(a, b, rel, value_to_arg_idx, target_block, block)
                })
            {
                return Some(pos);
            }
            if is_sink_barrier(instr) {
                return None;
            }
        }
        if pos == 0 {
            return None;
        }
        budget -= 1;
        pos -= 1;
    }
}

/// Sink an identical tail instruction from all predecessors of `bb` into
/// `bb`'s head.
///
/// Precondition handling: bails unless `bb` has predecessors and is the
/// unique successor of each. The scan restarts from the first
/// predecessor's terminator after each successful sink, but the search
/// budget is shared across restarts.
pub(crate) fn sink_code_from_predecessors(
    func: &mut Function,
    preds: &[Vec<usize>],
    bb: BlockId,
    stats: &mut CodeMotionStats,
) -> bool {
    let mut changed = false;
    let pred_list = &preds[bb.index()];
    if pred_list.is_empty() {
        return changed;
    }

    // This block must be the only successor of all the predecessors.
    for &p in pred_list {
        let pb = block_id(p);
        if single_successor(func.block(pb)) != Some(bb) {
            return changed;
        }
    }

    let first_pred = block_id(pred_list[0]);
    // The first pred must have at least one non-terminator.
    if func.block(first_pred).body.is_empty() {
        return changed;
    }

    tracing::trace!(block = bb.index(), "sinking values from predecessors");

    // Map values in predecessor blocks to argument indices of the
    // successor block. For example:
    //
    //   bb1: br bb3(%a, %b)    // %a -> 0, %b -> 1
    //   bb2: br bb3(%c, %d)    // %c -> 0, %d -> 1
    //   bb3(%x, %y): ...
    let mut value_to_arg_idx: ValueToArgIdxMap = FxHashMap::default();
    for &p in pred_list {
        let pb = block_id(p);
        if let Terminator::Branch { args, .. } = &func.block(pb).terminator {
            for (idx, &arg) in args.iter().enumerate() {
                value_to_arg_idx.insert((arg, pb), idx);
            }
        }
    }

    let mut budget = SINK_SEARCH_WINDOW;
    // Start scanning backwards from the terminator.
    let mut pos = func.block(first_pred).body.len();

    loop {
        if budget == 0 {
            return changed;
        }
        let body_len = func.block(first_pred).body.len();
        if pos < body_len {
            let target = func.block(first_pred).body[pos].clone();
            if can_sink_instruction(func, &target) {
                let mut rel = OperandRelation::NotDeterminedYet;
                // The duplicated instruction in every other predecessor.
                let mut dups: Vec<(BlockId, usize)> = Vec::new();
                let mut all_matched = true;
                for &p in pred_list {
                    let pb = block_id(p);
                    if pb == first_pred {
                        continue;
                    }
                    match find_identical_in_block(
                        func,
                        pb,
                        &target,
                        first_pred,
                        &value_to_arg_idx,
                        &mut rel,
                    ) {
                        Some(i) => dups.push((pb, i)),
                        None => {
                            all_matched = false;
                            break;
                        }
                    }
                }

                if all_matched && !dups.is_empty() {
                    let mut instr = func.block_mut(first_pred).body.remove(pos);
                    if rel == OperandRelation::EqualAfterMove {
                        // Replace operand values (which are passed to the
                        // successor block) with corresponding block
                        // arguments.
                        for idx in 0..instr.num_operands() {
                            let op = instr.operands()[idx];
                            let arg_idx = value_to_arg_idx
                                .get(&(op, first_pred))
                                .copied()
                                .unwrap_or_else(|| {
                                    panic!("moved operand is not passed to the successor")
                                });
                            let arg_value = func.block(bb).params[arg_idx].0;
                            instr.set_operand(idx, arg_value);
                        }
                    }
                    tracing::trace!(block = bb.index(), "sinking duplicated instruction");
                    func.block_mut(bb).body.insert(0, instr);
                    // The duplicates are use-free; drop them.
                    for &(pb, i) in &dups {
                        func.block_mut(pb).body.remove(i);
                        stats.sunk += 1;
                    }
                    changed = true;
                    // Restart the scan; the budget deliberately carries over.
                    pos = func.block(first_pred).body.len();
                    continue;
                }
            }

            // If this instruction is a barrier we can't sink anything else.
            if is_sink_barrier(&func.block(first_pred).body[pos]) {
                return changed;
            }
        }
        if pos == 0 {
            return changed;
        }
        budget -= 1;
        pos -= 1;
    }
}

/// The operand index at which `first` and `second` differ, when passing
/// that operand as a block argument is cheaper than keeping both
/// instructions.
///
/// Two `UnownedToRef`s always qualify at operand 0 — sinking them feeds
/// the unowned-reference optimizations downstream. Otherwise both must be
/// `Struct`s differing at exactly one field whose type is a primitive
/// integer.
fn cheaper_to_pass_operands_as_arguments(
    func: &Function,
    pool: &TypePool,
    first: &Instr,
    second: &Instr,
) -> Option<usize> {
    if matches!(first, Instr::UnownedToRef { .. }) && matches!(second, Instr::UnownedToRef { .. }) {
        return Some(0);
    }

    let (Instr::Struct { ty: t1, fields: f1, .. }, Instr::Struct { ty: t2, fields: f2, .. }) =
        (first, second)
    else {
        return None;
    };

    debug_assert_eq!(t1, t2, "struct arguments for one slot should agree on type");
    if t1 != t2 || f1.len() != f2.len() {
        return None;
    }

    let mut different_operand_index = None;
    for (i, (a, b)) in f1.iter().zip(f2.iter()).enumerate() {
        if a != b {
            // Only track one different operand.
            if different_operand_index.is_some() {
                return None;
            }
            different_operand_index = Some(i);
        }
    }

    let diff = different_operand_index?;
    // Only integers are cheap enough to re-route through an argument.
    if !pool.is_integer(func.value_type(f1[diff])) {
        return None;
    }
    Some(diff)
}

/// Try to sink the producers of `bb`'s argument `arg_num` out of the
/// predecessors.
fn sink_argument(
    func: &mut Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    bb: BlockId,
    arg_num: usize,
) -> bool {
    let pred_list = &preds[bb.index()];
    let first_pred = block_id(pred_list[0]);

    let Some(first_arg) = func
        .block(first_pred)
        .terminator
        .arg_for_dest(bb, arg_num)
    else {
        return false;
    };
    let Some(DefSite::Instr(f_block, f_idx)) = func.def_site(first_arg) else {
        return false;
    };
    // We only move instructions with a single use.
    if func.count_uses(first_arg) != 1 {
        return false;
    }
    let fsi = func.block(f_block).body[f_idx].clone();

    // Don't move instructions that are sensitive to their location: code
    // between the current and the new position may clobber memory the
    // instruction reads.
    if fsi.may_read_from_memory() || fsi.may_have_side_effects() {
        return false;
    }

    // The list of per-predecessor producers; the first entry is `first_arg`.
    let mut clones: Vec<ValueId> = vec![first_arg];
    let mut different_operand_index: Option<usize> = None;

    for &p in &pred_list[1..] {
        let pb = block_id(p);
        // Only handle branch or conditional branch terminators.
        if !matches!(
            func.block(pb).terminator,
            Terminator::Branch { .. } | Terminator::CondBranch { .. }
        ) {
            return false;
        }
        let Some(arg) = func.block(pb).terminator.arg_for_dest(bb, arg_num) else {
            return false;
        };
        let Some(DefSite::Instr(s_block, s_idx)) = func.def_site(arg) else {
            return false;
        };
        if func.count_uses(arg) != 1 {
            return false;
        }
        let si = &func.block(s_block).body[s_idx];
        if si.is_identical_to(&fsi, |a, b| a == b) {
            clones.push(arg);
            continue;
        }

        // If the producers are close enough, we can still sink them: e.g.
        // `struct S(%n)` where only a small operand differs per
        // predecessor.
        let Some(diff) = cheaper_to_pass_operands_as_arguments(func, pool, &fsi, si) else {
            return false;
        };
        // The differing operand must be the same one in every predecessor.
        if different_operand_index.is_some_and(|prev| prev != diff) {
            return false;
        }
        different_operand_index = Some(diff);
        clones.push(arg);
    }

    let arg_value = func.block(bb).params[arg_num].0;

    if let Some(diff) = different_operand_index {
        // Sink one producer, then re-route the differing operand through
        // the (retyped) block argument.
        let instr = func.block_mut(f_block).body.remove(f_idx);
        let first_diff_operand = instr.operands()[diff];
        let fsi_dst = instr
            .defined_value()
            .unwrap_or_else(|| panic!("argument producer has no result"));
        let new_arg_ty = func.value_type(first_diff_operand);
        func.block_mut(bb).body.insert(0, instr);
        func.replace_all_uses(arg_value, fsi_dst);
        func.block_mut(bb).params[arg_num].1 = new_arg_ty;
        func.value_types[arg_value.index()] = new_arg_ty;

        // Update every predecessor to pass the differing operand instead
        // of the whole instruction, and drop the now-dead producers.
        debug_assert_eq!(clones.len(), pred_list.len(), "clone/pred mismatch");
        let pairs: Vec<(usize, ValueId)> = pred_list.iter().copied().zip(clones).collect();
        for (p, clone) in pairs {
            let pb = block_id(p);
            if clone == first_arg {
                func.block_mut(pb)
                    .terminator
                    .set_arg_for_dest(bb, arg_num, first_diff_operand);
                continue;
            }
            let Some(DefSite::Instr(cb, ci)) = func.def_site(clone) else {
                debug_assert!(false, "clone lost its defining instruction");
                continue;
            };
            let clone_operand = func.block(cb).body[ci].operands()[diff];
            func.block_mut(pb)
                .terminator
                .set_arg_for_dest(bb, arg_num, clone_operand);
            func.block_mut(cb).body.remove(ci);
        }

        // The sunk instruction now reads from the block argument.
        func.block_mut(bb).body[0].set_operand(diff, arg_value);
        return true;
    }

    // All producers are identical: sink the first, detach the rest.
    let undef = func.undef_value(func.value_type(first_arg));
    // The producer's only use is the predecessor's argument slot.
    func.replace_all_uses(first_arg, undef);
    let instr = func.block_mut(f_block).body.remove(f_idx);
    func.block_mut(bb).body.insert(0, instr);
    func.replace_all_uses(arg_value, first_arg);

    for clone in clones.into_iter().skip(1) {
        if clone == first_arg {
            continue;
        }
        func.replace_all_uses(clone, undef);
        if let Some(DefSite::Instr(cb, ci)) = func.def_site(clone) {
            func.block_mut(cb).body.remove(ci);
        }
    }

    true
}

/// Try to sink identical arguments coming from multiple predecessors.
pub(crate) fn sink_arguments_from_predecessors(
    func: &mut Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    bb: BlockId,
) -> bool {
    let pred_list = &preds[bb.index()];
    if pred_list.len() < 2 {
        return false;
    }

    // This block must be the only successor of all the predecessors.
    for &p in pred_list {
        let pb = block_id(p);
        if single_successor(func.block(pb)) != Some(bb) {
            return false;
        }
    }

    let mut changed = false;
    for i in 0..func.block(bb).params.len() {
        changed |= sink_argument(func, pool, preds, bb, i);
    }
    changed
}

/// Try to sink the literal passed to `bb`'s argument `arg_num`, if every
/// predecessor passes a structurally identical literal.
fn sink_literal_argument(func: &mut Function, preds: &[Vec<usize>], bb: BlockId, arg_num: usize) -> bool {
    let pred_list = &preds[bb.index()];
    let first_pred = block_id(pred_list[0]);

    let first_literal = match func.block(first_pred).terminator.arg_for_dest(bb, arg_num) {
        Some(arg) => match func.def_site(arg) {
            Some(DefSite::Instr(db, di)) => match &func.block(db).body[di] {
                Instr::Literal { ty, value, .. } => (*ty, *value),
                _ => return false,
            },
            _ => return false,
        },
        None => return false,
    };

    // Check that every other predecessor passes an identical literal.
    for &p in &pred_list[1..] {
        let pb = block_id(p);
        let Some(arg) = func.block(pb).terminator.arg_for_dest(bb, arg_num) else {
            return false;
        };
        let Some(DefSite::Instr(db, di)) = func.def_site(arg) else {
            return false;
        };
        match &func.block(db).body[di] {
            Instr::Literal { ty, value, .. } if (*ty, *value) == first_literal => {}
            _ => return false,
        }
    }

    // Clone the literal at the head of the block and reroute the
    // argument's uses; the predecessors are left untouched.
    let (ty, value) = first_literal;
    let dst = func.fresh_value(ty);
    func.block_mut(bb)
        .body
        .insert(0, Instr::Literal { dst, ty, value });
    let arg_value = func.block(bb).params[arg_num].0;
    func.replace_all_uses(arg_value, dst);
    true
}

/// Try to sink literals that are passed to arguments coming from multiple
/// predecessors.
///
/// Unlike the other sinking entry points, this allows predecessors with
/// multiple successors: the predecessors keep their literals, so nothing
/// moves on the other paths.
pub(crate) fn sink_literals_from_predecessors(
    func: &mut Function,
    preds: &[Vec<usize>],
    bb: BlockId,
) -> bool {
    let pred_list = &preds[bb.index()];
    if pred_list.len() < 2 {
        return false;
    }

    let mut changed = false;
    for i in 0..func.block(bb).params.len() {
        changed |= sink_literal_argument(func, preds, bb, i);
    }
    changed
}

/// Canonicalize strong retain/release operands to their shallow roots.
///
/// This reduces the number of distinct RC operand values, which increases
/// the chance that two RC instructions become structurally identical and
/// thus eligible for sinking.
pub(crate) fn canonicalize_ref_count_instrs(
    func: &mut Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    bb: BlockId,
) -> bool {
    let mut changed = false;
    for i in 0..func.block(bb).body.len() {
        let value = match &func.block(bb).body[i] {
            Instr::StrongRetain { value } | Instr::StrongRelease { value } => *value,
            _ => continue,
        };
        let root = find_value_shallow_root(func, pool, preds, value);
        if root != value {
            func.block_mut(bb).body[i].set_operand(0, root);
            changed = true;
        }
    }
    changed
}

// Tests
