//! Enum-tag dataflow and the switch-region transforms.
//!
//! For every block, [`BlockState`] tracks which enum case each SSA value
//! is known to hold on entry (`value_to_case`), and which case each
//! predecessor guarantees for a value when it reaches this block
//! (`enum_to_case_list`). The first map drives per-instruction
//! simplification of `RetainValue`/`ReleaseValue` onto known payloads; the
//! second identifies *switch regions* — merge blocks whose predecessors
//! each stand for one case — enabling releases to be hoisted into the
//! region and retains to be sunk out of it.
//!
//! States are merged from predecessors in reverse postorder. Merging uses
//! blottable maps on purpose: a conflicting case blots `value_to_case` but
//! keeps the accumulated `enum_to_case_list` entry, because the case list
//! is still needed to detect the end of a switch region even when the
//! per-value knowledge conflicts. A value missing from any predecessor
//! blots both maps.

use smallvec::SmallVec;

use crate::analysis::{AliasAnalysis, RcIdentity};
use crate::blot_map::BlotMap;
use crate::graph::{block_id, single_successor, PostOrderInfo};
use crate::ir::{BlockId, Function, Instr, Terminator, ValueId};
use crate::payload::{create_refcount_op_for_payload, RcOpKind};
use crate::types::{CaseId, TypePool};
use crate::CodeMotionStats;

/// The `(predecessor, case)` contributions for one enum value. Two entries
/// inline covers the common diamond.
type EnumCaseList = SmallVec<[(BlockId, CaseId); 2]>;

/// Per-block enum-tag dataflow state.
#[derive(Clone, Debug)]
pub(crate) struct BlockState {
    block: BlockId,
    /// The case each value is known to hold at the current program point.
    value_to_case: BlotMap<ValueId, CaseId>,
    /// For each enum value, the case each predecessor guarantees when it
    /// reaches this block.
    enum_to_case_list: BlotMap<ValueId, EnumCaseList>,
}

impl BlockState {
    fn new(block: BlockId) -> Self {
        Self {
            block,
            value_to_case: BlotMap::new(),
            enum_to_case_list: BlotMap::new(),
        }
    }

    /// Placeholder used while a state is temporarily taken out of the map.
    fn placeholder() -> Self {
        Self::new(BlockId::new(u32::MAX))
    }

    pub(crate) fn block(&self) -> BlockId {
        self.block
    }

    #[cfg(test)]
    pub(crate) fn known_case(&self, value: ValueId) -> Option<CaseId> {
        self.value_to_case.get(&value).copied()
    }

    #[cfg(test)]
    pub(crate) fn case_list(&self, value: ValueId) -> Option<&[(BlockId, CaseId)]> {
        self.enum_to_case_list.get(&value).map(|l| l.as_slice())
    }

    // ── Terminator refinement ───────────────────────────────────

    /// Refine the state from a single predecessor's `SwitchEnum`: arriving
    /// here means the switch operand holds the case whose target we are.
    fn handle_pred_switch_enum(&mut self, term: &Terminator) {
        let Terminator::SwitchEnum {
            value,
            cases,
            default,
        } = term
        else {
            return;
        };

        // The default target covers several cases; nothing to learn.
        if *default == Some(self.block) {
            return;
        }

        for &(case, succ) in cases {
            if succ == self.block {
                self.value_to_case.insert(*value, case);
                return;
            }
        }
        debug_assert!(
            false,
            "successor of a switch-terminated block missing from the switch"
        );
    }

    /// Refine the state from a single predecessor's `CondBranch` over a
    /// single-true-case `SelectEnum`: the true side pins the selector's
    /// case; the false side pins the other case when the enum has exactly
    /// two.
    fn handle_pred_cond_select_enum(&mut self, func: &Function, pool: &TypePool, term: &Terminator) {
        let Terminator::CondBranch {
            cond, then_dest, ..
        } = term
        else {
            return;
        };

        let Some(crate::ir::DefSite::Instr(sel_block, sel_idx)) = func.def_site(*cond) else {
            return;
        };
        let select = &func.block(sel_block).body[sel_idx];
        let Instr::SelectEnum {
            value: enum_operand,
            ..
        } = select
        else {
            return;
        };
        let enum_operand = *enum_operand;
        let Some(true_case) = select.single_true_case() else {
            return;
        };

        if *then_dest == self.block {
            self.value_to_case.insert(enum_operand, true_case);
            return;
        }

        // On the false side the case is only known for two-case enums.
        let Some(case_defs) = pool.enum_cases(func.value_type(enum_operand)) else {
            return;
        };
        let mut other = None;
        for i in 0..case_defs.len() {
            let case = CaseId::new(i as u32);
            if case == true_case {
                continue;
            }
            if other.is_some() {
                return;
            }
            other = Some(case);
        }
        if let Some(other) = other {
            self.value_to_case.insert(enum_operand, other);
        }
    }

    fn merge_single_pred_term_info(&mut self, func: &Function, pool: &TypePool, pred: BlockId) {
        let term = &func.block(pred).terminator;
        match term {
            Terminator::SwitchEnum { .. } => self.handle_pred_switch_enum(term),
            Terminator::CondBranch { .. } => self.handle_pred_cond_select_enum(func, pool, term),
            _ => {}
        }
    }

    // ── Predecessor merge ───────────────────────────────────────

    /// Initialize this state from the first predecessor's. Returns `false`
    /// for unreachable predecessors (no state).
    fn init_with_first_pred(
        &mut self,
        map: &BlockStateMap,
        func: &Function,
        first_pred: BlockId,
    ) -> bool {
        let Some(first_state) = map.get(first_pred) else {
            tracing::trace!(block = self.block.index(), "unreachable first predecessor");
            return false;
        };

        self.value_to_case = first_state.value_to_case.clone();

        // If we are the predecessor's only successor, releases can be
        // hoisted into it: record its case for every tracked value.
        if single_successor(func.block(first_pred)).is_some() {
            for (&value, &case) in self.value_to_case.iter() {
                self.enum_to_case_list
                    .get_or_default(value)
                    .push((first_pred, case));
            }
        }

        true
    }

    /// Merge all predecessor states into this block's entry state.
    ///
    /// Self-loops and unreachable predecessors abort the merge where they
    /// are found; whatever was accumulated so far stands.
    pub(crate) fn merge_predecessor_states(
        &mut self,
        map: &BlockStateMap,
        func: &Function,
        pool: &TypePool,
        preds: &[Vec<usize>],
    ) {
        let pred_list = &preds[self.block.index()];
        if pred_list.is_empty() {
            return;
        }

        let first_pred = block_id(pred_list[0]);
        if first_pred == self.block {
            tracing::trace!(block = self.block.index(), "self loop, bailing");
            return;
        }

        if !self.init_with_first_pred(map, func, first_pred) {
            return;
        }

        // With a single predecessor its terminator tells us which case the
        // scrutinee holds in this block.
        if pred_list.len() == 1 {
            self.merge_single_pred_term_info(func, pool, first_pred);
            return;
        }

        // Values with conflicting cases. Blotted after the loop so the
        // case lists still see them while the remaining predecessors
        // contribute.
        let mut conflicting: Vec<ValueId> = Vec::new();
        // Values some predecessor knows nothing about: they cannot end a
        // switch region, so both maps lose them after the loop.
        let mut missing: Vec<ValueId> = Vec::new();

        for &p in &pred_list[1..] {
            let pred = block_id(p);
            if pred == self.block {
                tracing::trace!(block = self.block.index(), "self loop, bailing");
                return;
            }
            let Some(pred_state) = map.get(pred) else {
                tracing::trace!(block = self.block.index(), "unreachable predecessor");
                return;
            };
            let pred_has_other_succs = single_successor(func.block(pred)).is_none();

            for (&value, &case) in self.value_to_case.iter() {
                let Some(&pred_case) = pred_state.value_to_case.get(&value) else {
                    missing.push(value);
                    conflicting.push(value);
                    continue;
                };

                if pred_has_other_succs {
                    // Hoisting into this predecessor is unsafe; forget
                    // every case list.
                    self.enum_to_case_list.clear();
                } else {
                    self.enum_to_case_list
                        .get_or_default(value)
                        .push((pred, pred_case));
                }

                if pred_case != case {
                    conflicting.push(value);
                }
            }
        }

        for value in conflicting {
            self.value_to_case.blot(&value);
        }
        for value in missing {
            self.enum_to_case_list.blot(&value);
        }
    }

    // ── Per-instruction transfer ────────────────────────────────

    /// Walk the block top to bottom: record cases established by enum
    /// construction and payload extraction, and rewrite
    /// `RetainValue`/`ReleaseValue` of values with a known case — erased
    /// outright for payloadless cases, specialized onto the payload
    /// otherwise.
    pub(crate) fn process(
        &mut self,
        func: &mut Function,
        pool: &TypePool,
        stats: &mut CodeMotionStats,
    ) -> bool {
        let bb = self.block;
        let mut changed = false;
        let mut i = 0;

        while i < func.block(bb).body.len() {
            match func.block(bb).body[i] {
                Instr::Enum { dst, case, .. } => {
                    self.value_to_case.insert(dst, case);
                    i += 1;
                }
                Instr::UncheckedEnumData { value, case, .. } => {
                    // Extraction proves which case the source holds.
                    self.value_to_case.insert(value, case);
                    i += 1;
                }
                Instr::RetainValue { value } | Instr::ReleaseValue { value } => {
                    let Some(&case) = self.value_to_case.get(&value) else {
                        i += 1;
                        continue;
                    };
                    if !pool.case_has_payload(func.value_type(value), case) {
                        // RC traffic on a payloadless case is a no-op.
                        func.block_mut(bb).body.remove(i);
                        changed = true;
                        continue;
                    }
                    let kind = RcOpKind::from_instr(&func.block(bb).body[i])
                        .unwrap_or_else(|| panic!("retain or release expected"));
                    let inserted = create_refcount_op_for_payload(
                        func, pool, bb, i, kind, case, value, stats,
                    );
                    func.block_mut(bb).body.remove(i + inserted);
                    i += inserted;
                    changed = true;
                }
                _ => i += 1,
            }
        }

        changed
    }

    // ── Switch-region transforms ────────────────────────────────

    /// Hoist `ReleaseValue`s whose operand has a case contribution from
    /// every predecessor into those predecessors, as releases of the
    /// per-case payloads.
    pub(crate) fn hoist_decrements_into_switch_regions(
        &mut self,
        func: &mut Function,
        pool: &TypePool,
        preds: &[Vec<usize>],
        aa: &dyn AliasAnalysis,
        stats: &mut CodeMotionStats,
    ) -> bool {
        let bb = self.block;
        let num_preds = preds[bb.index()].len();
        let mut changed = false;
        let mut i = 0;

        while i < func.block(bb).body.len() {
            let Instr::ReleaseValue { value } = func.block(bb).body[i] else {
                i += 1;
                continue;
            };

            let Some(case_list) = self.enum_to_case_list.get(&value) else {
                i += 1;
                continue;
            };
            // Without a case from every predecessor this is not a switch
            // region end for the value.
            if case_list.len() != num_preds {
                i += 1;
                continue;
            }

            // Users of the operand above the release pin it here: hoisting
            // past them would release too early.
            if aa.has_arc_uses_in_range(func, pool, value, bb, 0..i) {
                i += 1;
                continue;
            }

            let case_list = case_list.clone();
            tracing::trace!(block = bb.index(), "hoisting release into switch region");
            func.block_mut(bb).body.remove(i);
            let enum_ty = func.value_type(value);
            for (pred, case) in case_list {
                if !pool.case_has_payload(enum_ty, case) {
                    continue;
                }
                debug_assert!(
                    single_successor(func.block(pred)).is_some(),
                    "cannot hoist a release into a block with multiple successors"
                );
                let at = func.block(pred).body.len();
                create_refcount_op_for_payload(
                    func,
                    pool,
                    pred,
                    at,
                    RcOpKind::Release,
                    case,
                    value,
                    stats,
                );
            }
            stats.hoisted += 1;
            changed = true;
        }

        changed
    }

    /// Sink retains of a switch region's scrutinee out of the payloaded
    /// predecessors, replacing them with one `RetainValue` of the enum at
    /// this block's head.
    pub(crate) fn sink_increments_out_of_switch_regions(
        &mut self,
        func: &mut Function,
        pool: &TypePool,
        preds: &[Vec<usize>],
        aa: &dyn AliasAnalysis,
        rcia: &dyn RcIdentity,
        stats: &mut CodeMotionStats,
    ) -> bool {
        let bb = self.block;
        let num_preds = preds[bb.index()].len();
        let mut changed = false;

        let entries: Vec<(ValueId, EnumCaseList)> = self
            .enum_to_case_list
            .iter()
            .map(|(&value, list)| (value, list.clone()))
            .collect();

        for (value, case_list) in entries {
            if case_list.len() != num_preds {
                continue;
            }
            let enum_value = rcia.rc_identity_root(func, pool, value);

            // Every payloaded predecessor must yield a sinkable retain.
            let mut delete_list: Vec<(BlockId, usize)> = Vec::new();
            let mut all_found = true;
            for &(pred, case) in &case_list {
                if !pool.case_has_payload(func.value_type(value), case) {
                    continue;
                }
                match find_last_sinkable_matching_enum_value_rc_increment_in_pred(
                    func, pool, aa, rcia, enum_value, pred,
                ) {
                    Some(idx) => delete_list.push((pred, idx)),
                    None => {
                        all_found = false;
                        break;
                    }
                }
            }
            if !all_found || delete_list.is_empty() {
                continue;
            }

            tracing::trace!(block = bb.index(), "sinking retains out of switch region");
            func.block_mut(bb)
                .body
                .insert(0, Instr::RetainValue { value: enum_value });
            for (pred, idx) in delete_list {
                func.block_mut(pred).body.remove(idx);
            }
            stats.sunk += 1;
            changed = true;
        }

        changed
    }
}

/// The last retain in `pred` whose operand roots to `enum_value`, provided
/// no potential decrement of the root sits between it and the
/// predecessor's end.
fn find_last_sinkable_matching_enum_value_rc_increment_in_pred(
    func: &Function,
    pool: &TypePool,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
    enum_value: ValueId,
    pred: BlockId,
) -> Option<usize> {
    let body = &func.block(pred).body;
    let (idx, _) = body.iter().enumerate().rev().find(|(_, instr)| {
        instr.is_retain()
            && instr
                .rc_operand()
                .map_or(false, |op| rcia.rc_identity_root(func, pool, op) == enum_value)
    })?;

    if aa
        .decrement_or_check_in_range(func, pool, enum_value, pred, idx..body.len())
        .is_some()
    {
        return None;
    }

    Some(idx)
}

// ── Block-state map ─────────────────────────────────────────────────

/// All block states, preassigned in reverse postorder. Unreachable blocks
/// have no state; the merge treats a stateless predecessor as "bail".
pub(crate) struct BlockStateMap {
    states: Vec<BlockState>,
    rpo_blocks: Vec<BlockId>,
    rpo_number: Vec<Option<usize>>,
}

impl BlockStateMap {
    pub(crate) fn new(func: &Function, po: &PostOrderInfo) -> Self {
        let rpo_blocks: Vec<BlockId> = po.reverse_postorder().collect();
        let states = rpo_blocks.iter().map(|&bb| BlockState::new(bb)).collect();
        let rpo_number = (0..func.blocks.len())
            .map(|i| {
                po.rpo_number(block_id(i))
            })
            .collect();
        Self {
            states,
            rpo_blocks,
            rpo_number,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn block_at(&self, rpo_idx: usize) -> BlockId {
        self.rpo_blocks[rpo_idx]
    }

    /// The state of a block, or `None` for unreachable blocks.
    pub(crate) fn get(&self, block: BlockId) -> Option<&BlockState> {
        let idx = self.rpo_number.get(block.index()).copied().flatten()?;
        Some(&self.states[idx])
    }

    /// Temporarily take a state out for mutation.
    pub(crate) fn take(&mut self, rpo_idx: usize) -> BlockState {
        std::mem::replace(&mut self.states[rpo_idx], BlockState::placeholder())
    }

    /// Put a taken state back.
    pub(crate) fn put(&mut self, rpo_idx: usize, state: BlockState) {
        self.states[rpo_idx] = state;
    }
}

// Tests
