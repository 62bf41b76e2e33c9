//! Local retain sinking and release hoisting.
//!
//! [`sink_ref_count_increment`] pushes retains as far down as legal:
//! across a `SwitchEnum` or select-enum `CondBranch` onto the payloads of
//! the known cases, into the successors of a conditional terminator, down
//! to the first potential decrement, or to the end of the block.
//!
//! [`hoist_decrements_to_predecessors`] moves a release at the top of a
//! merge block up into the predecessors when some (but not all) of them
//! hold a matching retain — in those predecessors the pair becomes
//! adjacent and later passes can erase it.
//!
//! Both transforms are gated by the `disable_rr_code_motion` knob, which
//! defaults to on (disabled).

use rustc_hash::FxHashMap;

use crate::analysis::{is_arc_inert_trap_block, AliasAnalysis, RcIdentity};
use crate::graph::{block_id, single_successor, successor_block_ids};
use crate::ir::{BlockId, Function, Instr, Terminator, ValueId};
use crate::payload::{create_refcount_op_for_payload, RcOpKind};
use crate::types::{CaseId, TypePool};
use crate::CodeMotionStats;

/// Move the body instruction at `idx` so it sits immediately before the
/// body instruction currently at `target` (`target > idx`).
fn move_before(func: &mut Function, bb: BlockId, idx: usize, target: usize) {
    debug_assert!(target > idx);
    let instr = func.block_mut(bb).body.remove(idx);
    func.block_mut(bb).body.insert(target - 1, instr);
}

/// Sink a `RetainValue` across a `SwitchEnum` terminator onto the case
/// payloads in the successors.
///
/// Requires: the retain's operand shares an RC root with the switch
/// operand, there is no potential decrement between them, and the switch
/// covers its cases without a default (a default can stand for several
/// cases, so there is no single payload to retain).
fn try_to_sink_ref_count_across_switch(
    func: &mut Function,
    pool: &TypePool,
    bb: BlockId,
    idx: usize,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
    stats: &mut CodeMotionStats,
) -> bool {
    if !matches!(func.block(bb).body[idx], Instr::RetainValue { .. }) {
        return false;
    }
    let ptr = func.block(bb).body[idx]
        .rc_operand()
        .unwrap_or_else(|| panic!("retain without an operand"));

    // If anything below may decrement the pointer, park the retain right
    // before it instead.
    let body_len = func.block(bb).body.len();
    if let Some(d) = aa.decrement_or_check_in_range(func, pool, ptr, bb, idx..body_len) {
        move_before(func, bb, idx, d);
        return true;
    }

    let Terminator::SwitchEnum {
        value: switch_value,
        cases,
        default,
    } = &func.block(bb).terminator
    else {
        return false;
    };
    let switch_value = *switch_value;
    if rcia.rc_identity_root(func, pool, ptr) != rcia.rc_identity_root(func, pool, switch_value) {
        return false;
    }
    if default.is_some() {
        return false;
    }
    let cases: Vec<(CaseId, BlockId)> = cases.clone();

    func.block_mut(bb).body.remove(idx);
    let enum_ty = func.value_type(switch_value);
    for (case, succ) in cases {
        if pool.case_has_payload(enum_ty, case) {
            create_refcount_op_for_payload(
                func,
                pool,
                succ,
                0,
                RcOpKind::Retain,
                case,
                switch_value,
                stats,
            );
        }
    }
    stats.sunk += 1;
    true
}

/// Sink a `RetainValue` across a `CondBranch` whose condition is a
/// single-true-case `SelectEnum`, onto the payloads of the two cases.
///
/// The false side's case can only be inferred when the enum has exactly
/// two cases.
fn try_to_sink_ref_count_across_select_enum(
    func: &mut Function,
    pool: &TypePool,
    bb: BlockId,
    idx: usize,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
    stats: &mut CodeMotionStats,
) -> bool {
    if !matches!(func.block(bb).body[idx], Instr::RetainValue { .. }) {
        return false;
    }

    let Terminator::CondBranch {
        cond,
        then_dest,
        else_dest,
        ..
    } = &func.block(bb).terminator
    else {
        return false;
    };
    let (then_dest, else_dest) = (*then_dest, *else_dest);

    // The condition must come from a select_enum with a single true case.
    let Some(crate::ir::DefSite::Instr(sel_block, sel_idx)) = func.def_site(*cond) else {
        return false;
    };
    let select = func.block(sel_block).body[sel_idx].clone();
    let Instr::SelectEnum {
        value: enum_operand,
        ..
    } = select
    else {
        return false;
    };
    let Some(true_case) = select.single_true_case() else {
        return false;
    };

    let ptr = func.block(bb).body[idx]
        .rc_operand()
        .unwrap_or_else(|| panic!("retain without an operand"));
    let body_len = func.block(bb).body.len();
    if let Some(d) = aa.decrement_or_check_in_range(func, pool, ptr, bb, idx + 1..body_len) {
        move_before(func, bb, idx, d);
        return true;
    }

    if rcia.rc_identity_root(func, pool, ptr) != rcia.rc_identity_root(func, pool, enum_operand) {
        return false;
    }

    // Work out which case the false branch stands for. Only possible when
    // the enum has exactly one other case.
    let enum_ty = func.value_type(enum_operand);
    let Some(case_defs) = pool.enum_cases(enum_ty) else {
        return false;
    };
    let mut other_case = None;
    for i in 0..case_defs.len() {
        let case = CaseId::new(i as u32);
        if case == true_case {
            continue;
        }
        if other_case.is_some() {
            return false;
        }
        other_case = Some(case);
    }
    let Some(other_case) = other_case else {
        return false;
    };

    func.block_mut(bb).body.remove(idx);
    for (case, succ) in [(true_case, then_dest), (other_case, else_dest)] {
        if pool.case_has_payload(enum_ty, case) {
            create_refcount_op_for_payload(
                func,
                pool,
                succ,
                0,
                RcOpKind::Retain,
                case,
                enum_operand,
                stats,
            );
        }
    }
    stats.sunk += 1;
    true
}

/// Try to sink the retain at `idx` as far as legal. See
/// [`sink_ref_count_increment`] for the attempt order.
fn try_to_sink_ref_count_inst(
    func: &mut Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    bb: BlockId,
    idx: usize,
    can_sink_to_successors: bool,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
    stats: &mut CodeMotionStats,
) -> bool {
    if can_sink_to_successors {
        // A switch either takes the retain onto its payloads or nothing
        // happens at all: the generic paths below cannot sink over a
        // switch_enum.
        if matches!(func.block(bb).terminator, Terminator::SwitchEnum { .. }) {
            return try_to_sink_ref_count_across_switch(func, pool, bb, idx, aa, rcia, stats);
        }
        if matches!(func.block(bb).terminator, Terminator::CondBranch { .. })
            && try_to_sink_ref_count_across_select_enum(func, pool, bb, idx, aa, rcia, stats)
        {
            return true;
        }
    }

    if !matches!(
        func.block(bb).body[idx],
        Instr::StrongRetain { .. } | Instr::RetainValue { .. }
    ) {
        return false;
    }
    let ptr = func.block(bb).body[idx]
        .rc_operand()
        .unwrap_or_else(|| panic!("retain without an operand"));

    // A potential decrement below caps how far the retain may travel.
    let body_len = func.block(bb).body.len();
    if let Some(d) = aa.decrement_or_check_in_range(func, pool, ptr, bb, idx + 1..body_len) {
        move_before(func, bb, idx, d);
        return true;
    }

    // If the CFG will not let us reach the successors, or the terminator
    // is not one we can materialize through, park the retain at the end of
    // the block.
    let through_conditional = matches!(
        func.block(bb).terminator,
        Terminator::CheckedCastBranch { .. } | Terminator::CondBranch { .. }
    );
    if !can_sink_to_successors || !through_conditional {
        let instr = func.block_mut(bb).body.remove(idx);
        func.block_mut(bb).body.push(instr);
        return true;
    }

    // Materialize a copy of the retain in each successor (skipping trap
    // blocks the program only reaches to abort) and erase the original.
    let is_strong = matches!(func.block(bb).body[idx], Instr::StrongRetain { .. });
    let mut succs: Vec<BlockId> = Vec::new();
    for s in successor_block_ids(&func.block(bb).terminator) {
        if !succs.contains(&s) {
            succs.push(s);
        }
    }
    func.block_mut(bb).body.remove(idx);
    for succ in succs {
        debug_assert_eq!(preds[succ.index()].len(), 1, "successor must be solely ours");
        if is_arc_inert_trap_block(func, succ) {
            continue;
        }
        let op = if is_strong {
            Instr::StrongRetain { value: ptr }
        } else {
            Instr::RetainValue { value: ptr }
        };
        func.block_mut(succ).body.insert(0, op);
    }
    stats.sunk += 1;
    true
}

/// Try to sink every retain in `bb` as far as possible — to successor
/// blocks, or as far down the block as legal. The walk is bottom-up, so a
/// retain never hops over one processed before it.
pub(crate) fn sink_ref_count_increment(
    func: &mut Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    bb: BlockId,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
    stats: &mut CodeMotionStats,
) -> bool {
    // Successors reached from anywhere else cannot take a materialized
    // retain; we can still sink to the end of this block.
    let can_sink_to_successors = successor_block_ids(&func.block(bb).terminator)
        .iter()
        .all(|s| preds[s.index()].len() == 1);

    if func.block(bb).body.is_empty() {
        return false;
    }

    let mut changed = false;
    let mut idx = func.block(bb).body.len();
    while idx > 0 {
        idx -= 1;
        changed |= try_to_sink_ref_count_inst(
            func,
            pool,
            preds,
            bb,
            idx,
            can_sink_to_successors,
            aa,
            rcia,
            stats,
        );
    }
    changed
}

/// Is a retain of `ptr` available for pairing in some, but not all,
/// predecessors of `bb`?
///
/// A retain is available in a predecessor when a retain on the same RC
/// root exists with no potential decrement between it and the
/// predecessor's end — where "end" stops at the first release previously
/// hoisted into that predecessor, so later hoists do not look past
/// earlier ones.
fn is_retain_available_in_some_but_not_all_predecessors(
    func: &Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    bb: BlockId,
    ptr: ValueId,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
    check_up_to: &FxHashMap<usize, usize>,
) -> bool {
    let mut avail_in_some = false;
    let mut not_avail_in_some = false;

    let root = rcia.rc_identity_root(func, pool, ptr);

    for &p in &preds[bb.index()] {
        let pb = block_id(p);
        let body = &func.block(pb).body;

        // The last retain of the root in this predecessor.
        let retain = body.iter().enumerate().rev().find(|(_, instr)| {
            instr.is_retain()
                && instr
                    .rc_operand()
                    .map_or(false, |op| rcia.rc_identity_root(func, pool, op) == root)
        });

        let end = check_up_to.get(&p).copied().unwrap_or(body.len());
        match retain {
            Some((ri, _))
                if aa
                    .decrement_or_check_in_range(func, pool, root, pb, ri..end)
                    .is_none() =>
            {
                avail_in_some = true;
            }
            _ => not_avail_in_some = true,
        }
    }

    avail_in_some && not_avail_in_some
}

/// Hoist releases at the top of `bb` into its predecessors when a
/// matching retain is available in some but not all of them.
///
/// Replicating the release on every incoming edge is count-neutral; the
/// predecessors that held a retain now contain an adjacent pair for later
/// elimination.
pub(crate) fn hoist_decrements_to_predecessors(
    func: &mut Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    bb: BlockId,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
) -> bool {
    let pred_list = &preds[bb.index()];
    if pred_list.len() < 2 {
        return false;
    }
    // Every predecessor must fall through only into us.
    for &p in pred_list {
        let pb = block_id(p);
        if single_successor(func.block(pb)) != Some(bb) {
            return false;
        }
    }

    let mut hoisted = false;

    // A hoisted release looks like a decrement in its predecessor and
    // would block further hoists; availability scans stop at the first
    // hoisted release instead.
    let mut check_up_to: FxHashMap<usize, usize> = FxHashMap::default();

    let mut i = 0;
    while i < func.block(bb).body.len() {
        let instr = &func.block(bb).body[i];
        if !instr.is_release() {
            i += 1;
            continue;
        }
        let is_strong = matches!(instr, Instr::StrongRelease { .. });
        let ptr = instr
            .rc_operand()
            .unwrap_or_else(|| panic!("release without an operand"));

        // The pointer must be defined outside of this basic block.
        if func.defining_block(ptr) == Some(bb) {
            i += 1;
            continue;
        }

        // No ARC use from the head of this block down to the release.
        if aa.has_arc_uses_in_range(func, pool, ptr, bb, 0..i) {
            i += 1;
            continue;
        }

        if !is_retain_available_in_some_but_not_all_predecessors(
            func,
            pool,
            preds,
            bb,
            ptr,
            aa,
            rcia,
            &check_up_to,
        ) {
            i += 1;
            continue;
        }

        tracing::trace!(block = bb.index(), "hoisting release to predecessors");
        for &p in pred_list {
            let pb = block_id(p);
            let release = if is_strong {
                Instr::StrongRelease { value: ptr }
            } else {
                Instr::ReleaseValue { value: ptr }
            };
            let pos = func.block(pb).body.len();
            func.block_mut(pb).body.push(release);
            check_up_to.entry(p).or_insert(pos);
        }

        func.block_mut(bb).body.remove(i);
        hoisted = true;
    }

    hoisted
}

// Tests
