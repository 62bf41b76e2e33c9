//! Analysis capabilities consumed by the transforms.
//!
//! The transforms never depend on a concrete analysis — they take
//! [`AliasAnalysis`] and [`RcIdentity`] as capabilities and bail
//! conservatively on anything the analysis cannot rule out. The
//! implementations provided here answer with no aliasing facts at all:
//! every release or call may decrement any value, and RC identity only
//! strips conversions and single-predecessor block-argument chains.
//! Plugging in a real alias analysis makes the pass fire more often, never
//! differently.

use std::ops::Range;

use crate::graph::{compute_predecessors, single_predecessor};
use crate::ir::{BlockId, DefSite, Function, Instr, Terminator, ValueId};
use crate::types::TypePool;

/// Alias-analysis surface the transforms consume.
pub trait AliasAnalysis {
    /// The index of the first instruction in `range` of `block`'s body
    /// that may decrement `value`'s reference count or check it (e.g. a
    /// uniqueness test), or `None` if the range is clean.
    fn decrement_or_check_in_range(
        &self,
        func: &Function,
        pool: &TypePool,
        value: ValueId,
        block: BlockId,
        range: Range<usize>,
    ) -> Option<usize>;

    /// Returns `true` if any instruction in `range` of `block`'s body may
    /// use `value` in an ARC-relevant way.
    fn has_arc_uses_in_range(
        &self,
        func: &Function,
        pool: &TypePool,
        value: ValueId,
        block: BlockId,
        range: Range<usize>,
    ) -> bool;
}

/// RC-identity surface the transforms consume.
///
/// Two values sharing a root refer to the same object for counting
/// purposes.
pub trait RcIdentity {
    /// The canonical SSA value representing `value`'s refcounted object.
    fn rc_identity_root(&self, func: &Function, pool: &TypePool, value: ValueId) -> ValueId;
}

/// Find a root value for `value` by a shallow, one-step unwrap.
///
/// If `value` is a block argument whose parent has a single predecessor,
/// the incoming value is known exactly:
///
/// - a `CheckedCastBranch` into this block contributes its pre-cast
///   operand, provided that operand is reference counted (casting
///   non-counted references into object references is legal, and the
///   pre-cast value is only a valid RC root when it is itself counted);
/// - a `Branch` contributes the argument at the same index;
/// - a `CondBranch` contributes the argument passed for this destination.
///
/// Anything else returns `value` unchanged. This is a shallow search, not
/// a recursive one.
pub(crate) fn find_value_shallow_root(
    func: &Function,
    pool: &TypePool,
    preds: &[Vec<usize>],
    value: ValueId,
) -> ValueId {
    let Some(DefSite::BlockParam(parent, idx)) = func.def_site(value) else {
        return value;
    };
    let Some(pred) = single_predecessor(preds, parent) else {
        return value;
    };

    match &func.block(pred).terminator {
        Terminator::CheckedCastBranch {
            value: operand,
            success,
            ..
        } => {
            debug_assert_eq!(*success, parent, "cast argument outside the success block");
            if pool.is_reference_counted(func.value_type(*operand)) {
                return *operand;
            }
            value
        }
        term @ (Terminator::Branch { .. } | Terminator::CondBranch { .. }) => {
            term.arg_for_dest(parent, idx).unwrap_or(value)
        }
        _ => value,
    }
}

/// Shallow RC identity: iteratively strips count-preserving definitions —
/// `UnownedToRef` conversions, enum payload wrapping and extraction (a
/// payloaded enum counts as its payload), and single-predecessor
/// block-argument pass-throughs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShallowRcIdentity;

impl RcIdentity for ShallowRcIdentity {
    fn rc_identity_root(&self, func: &Function, pool: &TypePool, value: ValueId) -> ValueId {
        let preds = compute_predecessors(func);
        let mut current = value;
        // The chain is acyclic in valid SSA; the bound is paranoia against
        // malformed input.
        for _ in 0..64 {
            if let Some(DefSite::Instr(bb, idx)) = func.def_site(current) {
                match &func.block(bb).body[idx] {
                    Instr::UnownedToRef { value: operand, .. }
                    | Instr::UncheckedEnumData { value: operand, .. }
                    | Instr::Enum {
                        payload: Some(operand),
                        ..
                    } => {
                        current = *operand;
                        continue;
                    }
                    _ => {}
                }
            }
            let root = find_value_shallow_root(func, pool, &preds, current);
            if root != current {
                current = root;
                continue;
            }
            break;
        }
        current
    }
}

/// Alias analysis with no aliasing facts.
///
/// Any release and any call may decrement or check any value. An
/// instruction is an ARC use of `value` if it is a call or if one of its
/// operands shares `value`'s RC-identity root.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConservativeAliasAnalysis {
    ident: ShallowRcIdentity,
}

impl AliasAnalysis for ConservativeAliasAnalysis {
    fn decrement_or_check_in_range(
        &self,
        func: &Function,
        _pool: &TypePool,
        _value: ValueId,
        block: BlockId,
        range: Range<usize>,
    ) -> Option<usize> {
        let body = &func.block(block).body;
        range.into_iter().find(|&i| {
            let instr = &body[i];
            instr.is_release() || matches!(instr, Instr::Apply { .. })
        })
    }

    fn has_arc_uses_in_range(
        &self,
        func: &Function,
        pool: &TypePool,
        value: ValueId,
        block: BlockId,
        range: Range<usize>,
    ) -> bool {
        let root = self.ident.rc_identity_root(func, pool, value);
        let body = &func.block(block).body;
        range.into_iter().any(|i| {
            let instr = &body[i];
            if matches!(instr, Instr::Apply { .. }) {
                return true;
            }
            instr
                .operands()
                .iter()
                .any(|&op| self.ident.rc_identity_root(func, pool, op) == root)
        })
    }
}

/// Returns `true` if `block` is an ARC-inert trap block: it terminates in
/// `Unreachable` and performs no RC traffic of its own. Materializing a
/// retain there is pointless — the program is about to abort.
pub(crate) fn is_arc_inert_trap_block(func: &Function, block: BlockId) -> bool {
    let bb = func.block(block);
    matches!(bb.terminator, Terminator::Unreachable)
        && bb.body.iter().all(|i| !i.is_retain() && !i.is_release())
}

// Tests

#[cfg(test)]
mod tests {
    use crate::ir::{Block, BlockId, Function, Instr, Name, Terminator, ValueId};
    use crate::types::{TyId, TypePool};

    use super::*;

    fn v(n: u32) -> ValueId {
        ValueId::new(n)
    }

    fn b(n: u32) -> BlockId {
        BlockId::new(n)
    }

    /// bb0: br bb1(%0)
    /// bb1(%1): return %1
    fn pass_through_func(ty: TyId) -> Function {
        Function {
            name: Name::from_raw(1),
            params: vec![(v(0), ty)],
            blocks: vec![
                Block {
                    id: b(0),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Branch {
                        target: b(1),
                        args: vec![v(0)],
                    },
                },
                Block {
                    id: b(1),
                    params: vec![(v(1), ty)],
                    body: vec![],
                    terminator: Terminator::Return { value: v(1) },
                },
            ],
            entry: b(0),
            value_types: vec![ty, ty],
        }
    }

    #[test]
    fn shallow_root_through_branch() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let func = pass_through_func(r);
        let preds = compute_predecessors(&func);
        assert_eq!(find_value_shallow_root(&func, &pool, &preds, v(1)), v(0));
        // Non-arguments root to themselves.
        assert_eq!(find_value_shallow_root(&func, &pool, &preds, v(0)), v(0));
    }

    #[test]
    fn shallow_root_stops_at_multiple_preds() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let mut func = pass_through_func(r);
        // Add a second edge into bb1.
        func.blocks.push(Block {
            id: b(2),
            params: vec![],
            body: vec![],
            terminator: Terminator::Branch {
                target: b(1),
                args: vec![v(0)],
            },
        });
        let preds = compute_predecessors(&func);
        assert_eq!(find_value_shallow_root(&func, &pool, &preds, v(1)), v(1));
    }

    #[test]
    fn shallow_root_through_cond_branch() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), TyId::BOOL), (v(1), r), (v(2), r)],
            blocks: vec![
                Block {
                    id: b(0),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::CondBranch {
                        cond: v(0),
                        then_dest: b(1),
                        then_args: vec![v(1)],
                        else_dest: b(2),
                        else_args: vec![v(2)],
                    },
                },
                Block {
                    id: b(1),
                    params: vec![(v(3), r)],
                    body: vec![],
                    terminator: Terminator::Return { value: v(3) },
                },
                Block {
                    id: b(2),
                    params: vec![(v(4), r)],
                    body: vec![],
                    terminator: Terminator::Return { value: v(4) },
                },
            ],
            entry: b(0),
            value_types: vec![TyId::BOOL, r, r, r, r],
        };
        let preds = compute_predecessors(&func);
        assert_eq!(find_value_shallow_root(&func, &pool, &preds, v(3)), v(1));
        assert_eq!(find_value_shallow_root(&func, &pool, &preds, v(4)), v(2));
    }

    #[test]
    fn shallow_root_through_checked_cast() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let cast_ty = pool.add_ref();
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), r)],
            blocks: vec![
                Block {
                    id: b(0),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::CheckedCastBranch {
                        value: v(0),
                        target_ty: cast_ty,
                        success: b(1),
                        failure: b(2),
                    },
                },
                Block {
                    id: b(1),
                    params: vec![(v(1), cast_ty)],
                    body: vec![],
                    terminator: Terminator::Return { value: v(1) },
                },
                Block {
                    id: b(2),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Unreachable,
                },
            ],
            entry: b(0),
            value_types: vec![r, cast_ty],
        };
        let preds = compute_predecessors(&func);
        assert_eq!(find_value_shallow_root(&func, &pool, &preds, v(1)), v(0));
    }

    #[test]
    fn shallow_root_cast_of_uncounted_operand_stays() {
        let mut pool = TypePool::new();
        let cast_ty = pool.add_ref();
        // The pre-cast operand is an integer (metatype-like, not counted).
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), TyId::INT)],
            blocks: vec![
                Block {
                    id: b(0),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::CheckedCastBranch {
                        value: v(0),
                        target_ty: cast_ty,
                        success: b(1),
                        failure: b(2),
                    },
                },
                Block {
                    id: b(1),
                    params: vec![(v(1), cast_ty)],
                    body: vec![],
                    terminator: Terminator::Return { value: v(1) },
                },
                Block {
                    id: b(2),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Unreachable,
                },
            ],
            entry: b(0),
            value_types: vec![TyId::INT, cast_ty],
        };
        let preds = compute_predecessors(&func);
        assert_eq!(find_value_shallow_root(&func, &pool, &preds, v(1)), v(1));
    }

    #[test]
    fn rc_identity_strips_unowned_to_ref_and_args() {
        let mut pool = TypePool::new();
        let u = pool.add_unowned();
        let r = pool.add_ref();
        // bb0: %1 = unowned_to_ref %0; br bb1(%1)
        // bb1(%2): return %2
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), u)],
            blocks: vec![
                Block {
                    id: b(0),
                    params: vec![],
                    body: vec![Instr::UnownedToRef {
                        dst: v(1),
                        ty: r,
                        value: v(0),
                    }],
                    terminator: Terminator::Branch {
                        target: b(1),
                        args: vec![v(1)],
                    },
                },
                Block {
                    id: b(1),
                    params: vec![(v(2), r)],
                    body: vec![],
                    terminator: Terminator::Return { value: v(2) },
                },
            ],
            entry: b(0),
            value_types: vec![u, r, r],
        };
        let rcia = ShallowRcIdentity;
        assert_eq!(rcia.rc_identity_root(&func, &pool, v(2)), v(0));
        assert_eq!(rcia.rc_identity_root(&func, &pool, v(1)), v(0));
        assert_eq!(rcia.rc_identity_root(&func, &pool, v(0)), v(0));
    }

    #[test]
    fn rc_identity_strips_enum_payload_ops() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let e = pool.add_enum(vec![crate::types::EnumCaseDef { payload: Some(r) }]);
        // %1 = enum #0(%0); %2 = unchecked_enum_data %1 #0
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), r)],
            blocks: vec![Block {
                id: b(0),
                params: vec![],
                body: vec![
                    Instr::Enum {
                        dst: v(1),
                        ty: e,
                        case: crate::types::CaseId::new(0),
                        payload: Some(v(0)),
                    },
                    Instr::UncheckedEnumData {
                        dst: v(2),
                        ty: r,
                        value: v(1),
                        case: crate::types::CaseId::new(0),
                    },
                ],
                terminator: Terminator::Return { value: v(2) },
            }],
            entry: b(0),
            value_types: vec![r, e, r],
        };
        let rcia = ShallowRcIdentity;
        assert_eq!(rcia.rc_identity_root(&func, &pool, v(1)), v(0));
        assert_eq!(rcia.rc_identity_root(&func, &pool, v(2)), v(0));
    }

    #[test]
    fn conservative_decrement_finds_releases_and_calls() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), r), (v(1), r)],
            blocks: vec![Block {
                id: b(0),
                params: vec![],
                body: vec![
                    Instr::StrongRetain { value: v(0) },
                    Instr::StrongRelease { value: v(1) },
                    Instr::Apply {
                        dst: v(2),
                        ty: TyId::INT,
                        callee: Name::from_raw(9),
                        args: vec![],
                    },
                ],
                terminator: Terminator::Return { value: v(0) },
            }],
            entry: b(0),
            value_types: vec![r, r, TyId::INT],
        };
        let aa = ConservativeAliasAnalysis::default();
        // A release of a *different* value still may decrement: no aliasing facts.
        assert_eq!(
            aa.decrement_or_check_in_range(&func, &pool, v(0), b(0), 0..3),
            Some(1)
        );
        assert_eq!(
            aa.decrement_or_check_in_range(&func, &pool, v(0), b(0), 2..3),
            Some(2)
        );
        assert_eq!(
            aa.decrement_or_check_in_range(&func, &pool, v(0), b(0), 0..1),
            None
        );
    }

    #[test]
    fn conservative_arc_uses_by_root() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), r), (v(1), r)],
            blocks: vec![Block {
                id: b(0),
                params: vec![],
                body: vec![
                    Instr::StrongRetain { value: v(1) },
                    Instr::Struct {
                        dst: v(2),
                        ty: TyId::INT,
                        fields: vec![v(0)],
                    },
                ],
                terminator: Terminator::Return { value: v(0) },
            }],
            entry: b(0),
            value_types: vec![r, r, TyId::INT],
        };
        let aa = ConservativeAliasAnalysis::default();
        // The retain of %1 is not a use of %0's root.
        assert!(!aa.has_arc_uses_in_range(&func, &pool, v(0), b(0), 0..1));
        // The struct names %0.
        assert!(aa.has_arc_uses_in_range(&func, &pool, v(0), b(0), 1..2));
        assert!(aa.has_arc_uses_in_range(&func, &pool, v(1), b(0), 0..1));
    }

    #[test]
    fn arc_inert_trap_detection() {
        let mut pool = TypePool::new();
        let r = pool.add_ref();
        let func = Function {
            name: Name::from_raw(1),
            params: vec![(v(0), r)],
            blocks: vec![
                Block {
                    id: b(0),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Unreachable,
                },
                Block {
                    id: b(1),
                    params: vec![],
                    body: vec![Instr::StrongRelease { value: v(0) }],
                    terminator: Terminator::Unreachable,
                },
                Block {
                    id: b(2),
                    params: vec![],
                    body: vec![],
                    terminator: Terminator::Return { value: v(0) },
                },
            ],
            entry: b(0),
            value_types: vec![r],
        };
        assert!(is_arc_inert_trap_block(&func, b(0)));
        // RC traffic disqualifies.
        assert!(!is_arc_inert_trap_block(&func, b(1)));
        // Non-trap terminator disqualifies.
        assert!(!is_arc_inert_trap_block(&func, b(2)));
    }
}
