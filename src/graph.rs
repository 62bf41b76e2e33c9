//! Shared CFG utilities for the code-motion transforms.
//!
//! Functions in this module are generic graph operations on [`Function`]
//! that several independent transforms need. They live here rather than in
//! a specific transform module so that transforms do not import from each
//! other — all of them depend on `graph`, none depend on each other.

use smallvec::{smallvec, SmallVec};

use crate::ir::{Block, BlockId, Function, Terminator};

/// Convert a block index (from a predecessor list or traversal) back to a
/// `BlockId`.
pub(crate) fn block_id(idx: usize) -> BlockId {
    BlockId::new(u32::try_from(idx).unwrap_or_else(|_| panic!("block count exceeds u32::MAX")))
}

/// Compute the predecessor list for each block (deduplicated).
///
/// Returns a vector indexed by block index, where each entry is the list
/// of distinct predecessor block indices. Block membership in the CFG
/// never changes during the pass (only instructions move), so one
/// computation serves the whole run.
pub(crate) fn compute_predecessors(func: &Function) -> Vec<Vec<usize>> {
    let num_blocks = func.blocks.len();
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); num_blocks];

    for (block_idx, block) in func.blocks.iter().enumerate() {
        let mut seen: SmallVec<[usize; 4]> = SmallVec::new();
        for succ_id in successor_block_ids(&block.terminator) {
            let succ_idx = succ_id.index();
            if succ_idx < num_blocks && !seen.contains(&succ_idx) {
                seen.push(succ_idx);
                predecessors[succ_idx].push(block_idx);
            }
        }
    }

    predecessors
}

/// Extract successor block IDs from a terminator, one entry per CFG edge.
///
/// Returns `SmallVec<[BlockId; 4]>` to avoid heap allocation for the
/// common case (max 2 successors except `SwitchEnum` with many cases).
pub(crate) fn successor_block_ids(terminator: &Terminator) -> SmallVec<[BlockId; 4]> {
    match terminator {
        Terminator::Return { .. } | Terminator::Unreachable => SmallVec::new(),
        Terminator::Branch { target, .. } => smallvec![*target],
        Terminator::CondBranch {
            then_dest,
            else_dest,
            ..
        } => smallvec![*then_dest, *else_dest],
        Terminator::SwitchEnum { cases, default, .. } => {
            let mut targets = SmallVec::with_capacity(cases.len() + 1);
            for &(_, bb) in cases {
                targets.push(bb);
            }
            if let Some(d) = default {
                targets.push(*d);
            }
            targets
        }
        Terminator::CheckedCastBranch {
            success, failure, ..
        } => smallvec![*success, *failure],
    }
}

/// The unique successor of a block, if its terminator has exactly one
/// outgoing edge. A conditional branch with both edges to the same block
/// still has two edges and returns `None`.
pub(crate) fn single_successor(block: &Block) -> Option<BlockId> {
    let succs = successor_block_ids(&block.terminator);
    if succs.len() == 1 {
        Some(succs[0])
    } else {
        None
    }
}

/// The unique predecessor of a block, given the precomputed predecessor
/// lists.
pub(crate) fn single_predecessor(preds: &[Vec<usize>], block: BlockId) -> Option<BlockId> {
    let list = &preds[block.index()];
    if list.len() == 1 {
        Some(block_id(list[0]))
    } else {
        None
    }
}

/// Compute a postorder traversal of the CFG starting from the entry block.
///
/// Uses an iterative DFS with an explicit stack to avoid recursion depth
/// issues on deeply nested CFGs. Only visits reachable blocks.
fn compute_postorder(func: &Function) -> Vec<usize> {
    let num_blocks = func.blocks.len();
    let mut visited = vec![false; num_blocks];
    let mut postorder = Vec::with_capacity(num_blocks);

    // Stack entries: (block_index, children_processed).
    // When children_processed is false, we push successors.
    // When true, we emit the block to postorder.
    let mut stack: Vec<(usize, bool)> = vec![(func.entry.index(), false)];

    while let Some(&mut (block_idx, ref mut children_done)) = stack.last_mut() {
        if *children_done {
            postorder.push(block_idx);
            stack.pop();
            continue;
        }

        *children_done = true;

        if block_idx >= num_blocks {
            stack.pop();
            continue;
        }

        if visited[block_idx] {
            stack.pop();
            continue;
        }
        visited[block_idx] = true;

        // Push successors (they'll be processed before we come back to
        // emit this block).
        let block = &func.blocks[block_idx];
        for succ_id in successor_block_ids(&block.terminator) {
            let succ_idx = succ_id.index();
            if succ_idx < num_blocks && !visited[succ_idx] {
                stack.push((succ_idx, false));
            }
        }
    }

    postorder
}

/// Reverse-postorder information for a function's CFG.
///
/// Carries the RPO block sequence and the RPO number of every reachable
/// block. Unreachable blocks have no RPO number; the dataflow treats them
/// as having no state.
pub struct PostOrderInfo {
    rpo: Vec<BlockId>,
    rpo_number: Vec<Option<usize>>,
}

impl PostOrderInfo {
    /// Compute RPO info for a function.
    pub fn compute(func: &Function) -> Self {
        let mut order = compute_postorder(func);
        order.reverse();

        let mut rpo_number = vec![None; func.blocks.len()];
        let rpo: Vec<BlockId> = order
            .iter()
            .enumerate()
            .map(|(rpo_idx, &block_idx)| {
                rpo_number[block_idx] = Some(rpo_idx);
                block_id(block_idx)
            })
            .collect();

        Self { rpo, rpo_number }
    }

    /// Number of reachable blocks.
    pub fn len(&self) -> usize {
        self.rpo.len()
    }

    /// Returns `true` if no block is reachable (empty function).
    pub fn is_empty(&self) -> bool {
        self.rpo.is_empty()
    }

    /// Blocks in reverse postorder.
    pub fn reverse_postorder(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.rpo.iter().copied()
    }

    /// The block at a given RPO position.
    pub fn block_at(&self, rpo_idx: usize) -> BlockId {
        self.rpo[rpo_idx]
    }

    /// The RPO number of a block, or `None` if it is unreachable.
    pub fn rpo_number(&self, block: BlockId) -> Option<usize> {
        self.rpo_number.get(block.index()).copied().flatten()
    }
}

// Tests

#[cfg(test)]
mod tests {
    use crate::ir::{Block, BlockId, Function, Name, Terminator, ValueId};
    use crate::types::TyId;

    use super::*;

    fn b(n: u32) -> BlockId {
        BlockId::new(n)
    }

    fn v(n: u32) -> ValueId {
        ValueId::new(n)
    }

    /// Diamond: bb0 → {bb1, bb2} → bb3.
    fn diamond() -> Function {
        Function {
            name: Name::from_raw(1),
            params: vec![(v(0), TyId::BOOL)],
            blocks: vec![
                Block {
                    id: b(0),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::CondBranch {
                        cond: v(0),
                        then_dest: b(1),
                        then_args: vec![],
                        else_dest: b(2),
                        else_args: vec![],
                    },
                },
                Block {
                    id: b(1),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Branch {
                        target: b(3),
                        args: vec![],
                    },
                },
                Block {
                    id: b(2),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Branch {
                        target: b(3),
                        args: vec![],
                    },
                },
                Block {
                    id: b(3),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Return { value: v(0) },
                },
            ],
            entry: b(0),
            value_types: vec![TyId::BOOL],
        }
    }

    #[test]
    fn predecessors_of_diamond() {
        let func = diamond();
        let preds = compute_predecessors(&func);
        assert!(preds[0].is_empty());
        assert_eq!(preds[1], vec![0]);
        assert_eq!(preds[2], vec![0]);
        assert_eq!(preds[3], vec![1, 2]);
    }

    #[test]
    fn cond_branch_same_target_counted_once() {
        let mut func = diamond();
        func.blocks[0].terminator = Terminator::CondBranch {
            cond: v(0),
            then_dest: b(1),
            then_args: vec![],
            else_dest: b(1),
            else_args: vec![],
        };
        let preds = compute_predecessors(&func);
        assert_eq!(preds[1], vec![0]);
    }

    #[test]
    fn single_successor_and_predecessor() {
        let func = diamond();
        let preds = compute_predecessors(&func);
        assert_eq!(single_successor(&func.blocks[1]), Some(b(3)));
        assert_eq!(single_successor(&func.blocks[0]), None);
        assert_eq!(single_predecessor(&preds, b(1)), Some(b(0)));
        assert_eq!(single_predecessor(&preds, b(3)), None);
    }

    #[test]
    fn cond_branch_to_same_block_not_single_successor() {
        let mut func = diamond();
        func.blocks[0].terminator = Terminator::CondBranch {
            cond: v(0),
            then_dest: b(1),
            then_args: vec![],
            else_dest: b(1),
            else_args: vec![],
        };
        // Two edges, one distinct target: still not "single successor".
        assert_eq!(single_successor(&func.blocks[0]), None);
    }

    #[test]
    fn rpo_visits_preds_before_succs() {
        let func = diamond();
        let po = PostOrderInfo::compute(&func);
        assert_eq!(po.len(), 4);
        let n0 = po.rpo_number(b(0)).unwrap();
        let n1 = po.rpo_number(b(1)).unwrap();
        let n2 = po.rpo_number(b(2)).unwrap();
        let n3 = po.rpo_number(b(3)).unwrap();
        assert_eq!(n0, 0);
        assert!(n1 < n3);
        assert!(n2 < n3);
        assert_eq!(po.block_at(n3), b(3));
    }

    #[test]
    fn unreachable_block_has_no_rpo_number() {
        let mut func = diamond();
        // bb4 is not referenced by any terminator.
        func.blocks.push(Block {
            id: b(4),
            params: vec![],
            body: vec![],
            terminator: Terminator::Unreachable,
        });
        let po = PostOrderInfo::compute(&func);
        assert_eq!(po.len(), 4);
        assert_eq!(po.rpo_number(b(4)), None);
    }

    #[test]
    fn loop_terminates_and_orders() {
        // bb0 → bb1 ⇄ bb2, bb1 → bb3.
        let mut func = diamond();
        func.blocks[1].terminator = Terminator::CondBranch {
            cond: v(0),
            then_dest: b(2),
            then_args: vec![],
            else_dest: b(3),
            else_args: vec![],
        };
        func.blocks[2].terminator = Terminator::Branch {
            target: b(1),
            args: vec![],
        };
        let po = PostOrderInfo::compute(&func);
        assert_eq!(po.len(), 4);
        assert_eq!(po.rpo_number(b(0)), Some(0));
        // The loop header precedes its latch in RPO.
        assert!(po.rpo_number(b(1)).unwrap() < po.rpo_number(b(2)).unwrap());
    }

    #[test]
    fn switch_successors_include_default() {
        use crate::types::CaseId;
        let term = Terminator::SwitchEnum {
            value: v(0),
            cases: vec![(CaseId::new(0), b(1)), (CaseId::new(1), b(2))],
            default: Some(b(3)),
        };
        let succs = successor_block_ids(&term);
        assert_eq!(succs.as_slice(), &[b(1), b(2), b(3)]);
    }
}
