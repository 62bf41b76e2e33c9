//! Code-motion optimization for a reference-counted, enum-aware
//! basic-block IR.
//!
//! This crate provides:
//!
//! - **The IR substrate** ([`Function`], [`Block`], [`Instr`],
//!   [`Terminator`], [`TypePool`]) — an SSA basic-block representation
//!   with explicit retain/release instructions and enum construction,
//!   extraction, switching and selection.
//!
//! - **Analysis capabilities** ([`AliasAnalysis`], [`RcIdentity`]) —
//!   narrow interfaces the transforms consume, with conservative
//!   implementations ([`ConservativeAliasAnalysis`],
//!   [`ShallowRcIdentity`]) that make the pass sound with no aliasing
//!   facts at all.
//!
//! - **The pass itself** ([`run_code_motion`], [`optimize_function`]) — a
//!   per-function reverse-postorder walk that moves retains and releases
//!   to places where they coalesce, disappear, or specialize onto enum
//!   payloads, and merges identical tail code from predecessor blocks.
//!
//! # Design
//!
//! The pass combines three cooperating pieces, driven block by block in
//! reverse postorder:
//!
//! 1. a per-block *enum-tag dataflow* that learns which case each value
//!    holds (from constructions, extractions, and the terminators of
//!    predecessors) and simplifies `RetainValue`/`ReleaseValue` of known
//!    cases;
//! 2. *switch-region transforms* that use the per-predecessor case lists
//!    to hoist releases into the region's arms and sink retains out of
//!    them;
//! 3. *generic sinking* that merges identical instruction tails from
//!    predecessors, including argument and literal producers.
//!
//! Everything is conservative: each transform either proves its
//! precondition through the analysis capabilities or leaves the IR
//! untouched, so a run with no opportunities is a no-op.

pub mod analysis;
mod blot_map;
mod dataflow;
mod graph;
pub mod ir;
mod payload;
mod rc_motion;
mod sink;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use analysis::{
    AliasAnalysis, ConservativeAliasAnalysis, RcIdentity, ShallowRcIdentity,
};
pub use blot_map::BlotMap;
pub use graph::PostOrderInfo;
pub use ir::{Block, BlockId, DefSite, Function, Instr, Literal, Name, Terminator, ValueId};
pub use types::{CaseId, EnumCaseDef, TyId, TypeKind, TypePool};

use graph::compute_predecessors;

/// Which variant of the pass to run.
///
/// The early variant (the default) performs no release hoisting; the late
/// variant additionally hoists releases into switch regions and, when the
/// retain/release motion knob is enabled, to predecessors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeMotionConfig {
    /// Hoist releases up the CFG (the "late" variant).
    pub hoist_releases: bool,
    /// Disable local retain sinking and predecessor release hoisting.
    /// Defaults to `true`: both stay off unless explicitly enabled.
    pub disable_rr_code_motion: bool,
}

impl CodeMotionConfig {
    /// The early configuration: no release hoisting.
    pub fn early() -> Self {
        Self {
            hoist_releases: false,
            disable_rr_code_motion: true,
        }
    }

    /// The late configuration: hoist releases into switch regions.
    pub fn late() -> Self {
        Self {
            hoist_releases: true,
            disable_rr_code_motion: true,
        }
    }
}

impl Default for CodeMotionConfig {
    fn default() -> Self {
        Self::early()
    }
}

/// Counters for the transformations the pass performed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CodeMotionStats {
    /// Instructions sunk: erased duplicates in generic sinking, retains
    /// moved across terminators, retain groups sunk out of switch regions.
    pub sunk: usize,
    /// Releases hoisted into switch regions.
    pub hoisted: usize,
    /// Retain/release operations specialized onto a non-trivial enum
    /// payload.
    pub refcount_ops_simplified: usize,
}

impl CodeMotionStats {
    /// Total number of counted transformations.
    pub fn total(&self) -> usize {
        self.sunk + self.hoisted + self.refcount_ops_simplified
    }
}

/// Run the code-motion pass over one function.
///
/// Blocks are visited in reverse postorder; for each block the enum-tag
/// state is merged from its predecessors, the switch-region transforms and
/// generic sinking run, then the per-instruction transfer, and finally —
/// when `disable_rr_code_motion` is off — the local retain sinker and (in
/// the late variant) the predecessor release hoister.
///
/// Returns `true` if the IR changed; the caller owns any instruction-level
/// analyses and must invalidate them in that case.
pub fn run_code_motion(
    func: &mut Function,
    pool: &TypePool,
    aa: &dyn AliasAnalysis,
    rcia: &dyn RcIdentity,
    config: &CodeMotionConfig,
    stats: &mut CodeMotionStats,
) -> bool {
    let po = PostOrderInfo::compute(func);
    let preds = compute_predecessors(func);
    let mut state_map = dataflow::BlockStateMap::new(func, &po);
    let mut changed = false;

    for rpo_idx in 0..state_map.len() {
        let bb = state_map.block_at(rpo_idx);
        tracing::trace!(rpo = rpo_idx, block = bb.index(), "visiting block");

        let mut state = state_map.take(rpo_idx);
        debug_assert_eq!(state.block(), bb);
        state.merge_predecessor_states(&state_map, func, pool, &preds);

        // Move releases up onto enum payloads and retains out of switch
        // regions before generic sinking runs: the sinker would otherwise
        // merge the very retains these transforms want to see in the
        // predecessors.
        if config.hoist_releases {
            changed |= state.hoist_decrements_into_switch_regions(func, pool, &preds, aa, stats);
        }
        changed |= state.sink_increments_out_of_switch_regions(func, pool, &preds, aa, rcia, stats);

        changed |= sink::canonicalize_ref_count_instrs(func, pool, &preds, bb);
        changed |= sink::sink_code_from_predecessors(func, &preds, bb, stats);
        changed |= sink::sink_arguments_from_predecessors(func, pool, &preds, bb);
        changed |= sink::sink_literals_from_predecessors(func, &preds, bb);

        changed |= state.process(func, pool, stats);
        state_map.put(rpo_idx, state);

        if !config.disable_rr_code_motion {
            changed |= rc_motion::sink_ref_count_increment(func, pool, &preds, bb, aa, rcia, stats);
            if config.hoist_releases {
                changed |=
                    rc_motion::hoist_decrements_to_predecessors(func, pool, &preds, bb, aa, rcia);
            }
        }
    }

    changed
}

/// Run the pass with the conservative analyses.
///
/// This is the canonical entry point for callers without their own alias
/// or RC-identity analyses.
pub fn optimize_function(func: &mut Function, pool: &TypePool, config: &CodeMotionConfig) -> bool {
    let aa = ConservativeAliasAnalysis::default();
    let rcia = ShallowRcIdentity;
    let mut stats = CodeMotionStats::default();
    let changed = run_code_motion(func, pool, &aa, &rcia, config, &mut stats);

    if changed {
        tracing::debug!(
            function = func.name.raw(),
            sunk = stats.sunk,
            hoisted = stats.hoisted,
            simplified = stats.refcount_ops_simplified,
            "code motion changed function",
        );
    }

    changed
}
