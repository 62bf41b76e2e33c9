//! Payload RC construction.
//!
//! When a retain or release of an enum value is specialized on a known
//! case, the RC traffic moves onto the case's payload: the payload is
//! extracted with `UncheckedEnumData` and, unless it is trivial, a
//! matching retain or release is emitted on it — strong ops when the
//! payload is itself a reference-counted object, value ops otherwise.

use crate::ir::{BlockId, Function, Instr, ValueId};
use crate::types::{CaseId, TypePool};
use crate::CodeMotionStats;

/// Whether the operation being rebuilt is a retain or a release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RcOpKind {
    Retain,
    Release,
}

impl RcOpKind {
    /// Classify an RC instruction. Returns `None` for non-RC instructions.
    pub(crate) fn from_instr(instr: &Instr) -> Option<Self> {
        if instr.is_retain() {
            Some(RcOpKind::Retain)
        } else if instr.is_release() {
            Some(RcOpKind::Release)
        } else {
            None
        }
    }
}

/// Emit the payload form of a retain/release of `enum_value` known to hold
/// `case`, inserting at `insert_at` in `block`'s body.
///
/// Always emits the payload extraction; a trivial payload gets no RC op
/// (the extraction is left for dead-code cleanup). Returns the number of
/// instructions inserted (1 or 2) so callers can fix up their positions.
///
/// `case` must carry a payload; payloadless cases are handled by erasing
/// the RC instruction outright, before getting here.
pub(crate) fn create_refcount_op_for_payload(
    func: &mut Function,
    pool: &TypePool,
    block: BlockId,
    insert_at: usize,
    kind: RcOpKind,
    case: CaseId,
    enum_value: ValueId,
    stats: &mut CodeMotionStats,
) -> usize {
    let enum_ty = func.value_type(enum_value);
    let Some(payload_ty) = pool.enum_case_payload(enum_ty, case) else {
        debug_assert!(false, "payload RC op for a payloadless case");
        return 0;
    };

    let payload = func.fresh_value(payload_ty);
    func.block_mut(block).body.insert(
        insert_at,
        Instr::UncheckedEnumData {
            dst: payload,
            ty: payload_ty,
            value: enum_value,
            case,
        },
    );

    // Trivial payloads need no RC traffic at all.
    if pool.is_trivial(payload_ty) {
        return 1;
    }

    stats.refcount_ops_simplified += 1;
    tracing::trace!(
        value = enum_value.raw(),
        case = case.index(),
        "specialized refcount op on enum payload",
    );

    let op = match (kind, pool.is_reference_counted(payload_ty)) {
        (RcOpKind::Retain, true) => Instr::StrongRetain { value: payload },
        (RcOpKind::Retain, false) => Instr::RetainValue { value: payload },
        (RcOpKind::Release, true) => Instr::StrongRelease { value: payload },
        (RcOpKind::Release, false) => Instr::ReleaseValue { value: payload },
    };
    func.block_mut(block).body.insert(insert_at + 1, op);
    2
}

// Tests
