//! Basic-block SSA IR that the code-motion pass operates on.
//!
//! The representation follows the usual basic-block shape (LLVM IR, MIR,
//! Lean 4's LCNF):
//!
//! - **[`Function`]** — a function body: parameters, blocks, value types
//! - **[`Block`]** — a basic block: parameters, body instructions, terminator
//! - **[`Instr`]** — a single non-terminator instruction
//! - **[`Terminator`]** — block exit (branch, switch, cast-branch, return)
//!
//! Values are named via [`ValueId`] (SSA). Control flow uses [`BlockId`]
//! references between blocks. Instructions live in `Vec` bodies and are
//! moved or erased positionally by the transforms; terminators are held
//! separately from the body.
//!
//! Debug locations are intentionally not carried: the pass moves and merges
//! instructions in ways that lose source identity, so locations would have
//! to be dropped anyway.

use crate::types::{CaseId, TyId};

// ── ID newtypes ─────────────────────────────────────────────────────

/// SSA value ID within a function.
///
/// Each `ValueId` identifies a unique SSA value within a single
/// [`Function`]. IDs are allocated sequentially starting from 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ValueId(u32);

impl ValueId {
    /// Create a new value ID from a raw index.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw `u32` value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Get the index as `usize` (for indexing into `Vec`s).
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Basic block ID within a function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    /// Create a new block ID from a raw index.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw `u32` value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Get the index as `usize` (for indexing into `Vec`s).
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Interned function or symbol name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Name(u32);

impl Name {
    /// Create a name from a raw interner index.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw interner index.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

// ── Literal values ──────────────────────────────────────────────────

/// Literal constant. Compared structurally by literal sinking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Literal {
    Int(i64),
    Bool(bool),
}

// ── Instructions ────────────────────────────────────────────────────

/// A non-terminator instruction.
///
/// Value-producing variants carry a `dst`. The four RC operations and the
/// call are the only side-effecting instructions; everything else is pure
/// and may be moved freely as long as its operands stay in scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instr {
    /// Increment the reference count of a reference-typed value.
    StrongRetain { value: ValueId },

    /// Decrement the reference count of a reference-typed value.
    StrongRelease { value: ValueId },

    /// Increment the reference counts reachable from a (possibly
    /// composite) value.
    RetainValue { value: ValueId },

    /// Decrement the reference counts reachable from a (possibly
    /// composite) value.
    ReleaseValue { value: ValueId },

    /// Construct an enum case with an optional payload:
    /// `let dst: ty = case(payload?)`.
    Enum {
        dst: ValueId,
        ty: TyId,
        case: CaseId,
        payload: Option<ValueId>,
    },

    /// Extract the payload of a value known to hold `case`:
    /// `let dst: ty = value.case`.
    UncheckedEnumData {
        dst: ValueId,
        ty: TyId,
        value: ValueId,
        case: CaseId,
    },

    /// Boolean enum-tag selector: `dst` is the boolean mapped to the case
    /// `value` holds. Feeds `CondBranch` conditions.
    SelectEnum {
        dst: ValueId,
        value: ValueId,
        cases: Vec<(CaseId, bool)>,
        default: Option<bool>,
    },

    /// Aggregate construction: `let dst: ty = struct(fields...)`.
    Struct {
        dst: ValueId,
        ty: TyId,
        fields: Vec<ValueId>,
    },

    /// Literal constant: `let dst: ty = value`.
    Literal {
        dst: ValueId,
        ty: TyId,
        value: Literal,
    },

    /// Convert an unowned reference to a strong reference.
    UnownedToRef {
        dst: ValueId,
        ty: TyId,
        value: ValueId,
    },

    /// Opaque call: `let dst: ty = callee(args...)`. May read memory and
    /// have arbitrary side effects, including RC decrements.
    Apply {
        dst: ValueId,
        ty: TyId,
        callee: Name,
        args: Vec<ValueId>,
    },
}

impl Instr {
    /// Returns the value defined by this instruction, if any.
    ///
    /// The four RC operations define nothing; everything else defines
    /// `dst`.
    pub fn defined_value(&self) -> Option<ValueId> {
        match self {
            Instr::Enum { dst, .. }
            | Instr::UncheckedEnumData { dst, .. }
            | Instr::SelectEnum { dst, .. }
            | Instr::Struct { dst, .. }
            | Instr::Literal { dst, .. }
            | Instr::UnownedToRef { dst, .. }
            | Instr::Apply { dst, .. } => Some(*dst),

            Instr::StrongRetain { .. }
            | Instr::StrongRelease { .. }
            | Instr::RetainValue { .. }
            | Instr::ReleaseValue { .. } => None,
        }
    }

    /// Visit every operand slot (read positions; `dst` excluded).
    fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            Instr::StrongRetain { value }
            | Instr::StrongRelease { value }
            | Instr::RetainValue { value }
            | Instr::ReleaseValue { value }
            | Instr::UncheckedEnumData { value, .. }
            | Instr::SelectEnum { value, .. }
            | Instr::UnownedToRef { value, .. } => f(value),

            Instr::Enum { payload, .. } => {
                if let Some(p) = payload {
                    f(p);
                }
            }

            Instr::Struct { fields, .. } => {
                for v in fields {
                    f(v);
                }
            }

            Instr::Apply { args, .. } => {
                for v in args {
                    f(v);
                }
            }

            Instr::Literal { .. } => {}
        }
    }

    /// Returns all operands (values read) in canonical order.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Instr::StrongRetain { value }
            | Instr::StrongRelease { value }
            | Instr::RetainValue { value }
            | Instr::ReleaseValue { value }
            | Instr::UncheckedEnumData { value, .. }
            | Instr::SelectEnum { value, .. }
            | Instr::UnownedToRef { value, .. } => vec![*value],

            Instr::Enum { payload, .. } => payload.iter().copied().collect(),

            Instr::Struct { fields, .. } => fields.clone(),

            Instr::Apply { args, .. } => args.clone(),

            Instr::Literal { .. } => vec![],
        }
    }

    /// Number of operand slots.
    pub fn num_operands(&self) -> usize {
        self.operands().len()
    }

    /// Overwrite operand slot `idx` (canonical order).
    ///
    /// # Panics
    ///
    /// Debug-panics if `idx` is out of range.
    pub fn set_operand(&mut self, idx: usize, new: ValueId) {
        let mut i = 0usize;
        let mut hit = false;
        self.for_each_operand_mut(|v| {
            if i == idx {
                *v = new;
                hit = true;
            }
            i += 1;
        });
        debug_assert!(hit, "operand index {idx} out of range");
    }

    /// Replace all occurrences of `old` with `new` in read positions.
    /// `dst` is never substituted.
    pub fn substitute_value(&mut self, old: ValueId, new: ValueId) {
        self.for_each_operand_mut(|v| {
            if *v == old {
                *v = new;
            }
        });
    }

    /// Returns `true` if this instruction may read from memory.
    pub fn may_read_from_memory(&self) -> bool {
        matches!(self, Instr::Apply { .. })
    }

    /// Returns `true` if this instruction may have side effects. RC
    /// operations count: moving code across them changes object lifetimes.
    pub fn may_have_side_effects(&self) -> bool {
        matches!(
            self,
            Instr::StrongRetain { .. }
                | Instr::StrongRelease { .. }
                | Instr::RetainValue { .. }
                | Instr::ReleaseValue { .. }
                | Instr::Apply { .. }
        )
    }

    /// Returns `true` for `StrongRetain`/`RetainValue`.
    pub fn is_retain(&self) -> bool {
        matches!(self, Instr::StrongRetain { .. } | Instr::RetainValue { .. })
    }

    /// Returns `true` for `StrongRelease`/`ReleaseValue`.
    pub fn is_release(&self) -> bool {
        matches!(
            self,
            Instr::StrongRelease { .. } | Instr::ReleaseValue { .. }
        )
    }

    /// The operand of an RC operation, or `None` for other instructions.
    pub fn rc_operand(&self) -> Option<ValueId> {
        match self {
            Instr::StrongRetain { value }
            | Instr::StrongRelease { value }
            | Instr::RetainValue { value }
            | Instr::ReleaseValue { value } => Some(*value),
            _ => None,
        }
    }

    /// The single `true` case of a `SelectEnum`, if the selector maps
    /// exactly one case to `true` and every other outcome (cases and
    /// default) to `false`.
    pub fn single_true_case(&self) -> Option<CaseId> {
        let Instr::SelectEnum { cases, default, .. } = self else {
            return None;
        };
        if *default == Some(true) {
            return None;
        }
        let mut found = None;
        for &(case, value) in cases {
            if value {
                if found.is_some() {
                    return None;
                }
                found = Some(case);
            }
        }
        found
    }

    /// Structural identity up to operands: same variant, same non-operand
    /// fields (type, case, literal, callee, selector table), same operand
    /// count, and every operand pair accepted by `cmp`. Destinations are
    /// not compared.
    pub fn is_identical_to(
        &self,
        other: &Instr,
        mut cmp: impl FnMut(ValueId, ValueId) -> bool,
    ) -> bool {
        let shape_matches = match (self, other) {
            (Instr::StrongRetain { .. }, Instr::StrongRetain { .. })
            | (Instr::StrongRelease { .. }, Instr::StrongRelease { .. })
            | (Instr::RetainValue { .. }, Instr::RetainValue { .. })
            | (Instr::ReleaseValue { .. }, Instr::ReleaseValue { .. }) => true,

            (
                Instr::Enum {
                    ty: t1, case: c1, ..
                },
                Instr::Enum {
                    ty: t2, case: c2, ..
                },
            ) => t1 == t2 && c1 == c2,

            (
                Instr::UncheckedEnumData {
                    ty: t1, case: c1, ..
                },
                Instr::UncheckedEnumData {
                    ty: t2, case: c2, ..
                },
            ) => t1 == t2 && c1 == c2,

            (
                Instr::SelectEnum {
                    cases: cs1,
                    default: d1,
                    ..
                },
                Instr::SelectEnum {
                    cases: cs2,
                    default: d2,
                    ..
                },
            ) => cs1 == cs2 && d1 == d2,

            (Instr::Struct { ty: t1, .. }, Instr::Struct { ty: t2, .. }) => t1 == t2,

            (
                Instr::Literal {
                    ty: t1, value: v1, ..
                },
                Instr::Literal {
                    ty: t2, value: v2, ..
                },
            ) => t1 == t2 && v1 == v2,

            (Instr::UnownedToRef { ty: t1, .. }, Instr::UnownedToRef { ty: t2, .. }) => t1 == t2,

            (
                Instr::Apply {
                    ty: t1, callee: f1, ..
                },
                Instr::Apply {
                    ty: t2, callee: f2, ..
                },
            ) => t1 == t2 && f1 == f2,

            _ => false,
        };

        if !shape_matches {
            return false;
        }

        let ops1 = self.operands();
        let ops2 = other.operands();
        if ops1.len() != ops2.len() {
            return false;
        }
        ops1.iter().zip(ops2.iter()).all(|(&a, &b)| cmp(a, b))
    }
}

// ── Terminators ─────────────────────────────────────────────────────

/// Block terminator — how control leaves a basic block.
///
/// `Branch` and `CondBranch` pass explicit arguments to their targets'
/// block parameters. `SwitchEnum` targets take no parameters: payloads are
/// re-extracted with [`Instr::UncheckedEnumData`] in the successor.
/// `CheckedCastBranch`'s success block has exactly one parameter, the cast
/// value; its failure block has none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    /// Unconditional jump, passing arguments.
    Branch { target: BlockId, args: Vec<ValueId> },

    /// Two-way conditional branch on a boolean, passing per-destination
    /// arguments.
    CondBranch {
        cond: ValueId,
        then_dest: BlockId,
        then_args: Vec<ValueId>,
        else_dest: BlockId,
        else_args: Vec<ValueId>,
    },

    /// Multi-way branch on an enum tag.
    SwitchEnum {
        value: ValueId,
        cases: Vec<(CaseId, BlockId)>,
        default: Option<BlockId>,
    },

    /// Dynamic cast that branches on success. The success block's single
    /// parameter receives the value at `target_ty`.
    CheckedCastBranch {
        value: ValueId,
        target_ty: TyId,
        success: BlockId,
        failure: BlockId,
    },

    /// Return a value from the function.
    Return { value: ValueId },

    /// Marks a block as unreachable (e.g. after a trap).
    Unreachable,
}

impl Terminator {
    /// Returns all values read by this terminator.
    pub fn used_values(&self) -> Vec<ValueId> {
        match self {
            Terminator::Branch { args, .. } => args.clone(),
            Terminator::CondBranch {
                cond,
                then_args,
                else_args,
                ..
            } => {
                let mut out = Vec::with_capacity(1 + then_args.len() + else_args.len());
                out.push(*cond);
                out.extend_from_slice(then_args);
                out.extend_from_slice(else_args);
                out
            }
            Terminator::SwitchEnum { value, .. }
            | Terminator::CheckedCastBranch { value, .. }
            | Terminator::Return { value } => vec![*value],
            Terminator::Unreachable => vec![],
        }
    }

    /// Replace all occurrences of `old` with `new` in value positions.
    pub fn substitute_value(&mut self, old: ValueId, new: ValueId) {
        fn sub(v: &mut ValueId, old: ValueId, new: ValueId) {
            if *v == old {
                *v = new;
            }
        }
        match self {
            Terminator::Branch { args, .. } => {
                for a in args {
                    sub(a, old, new);
                }
            }
            Terminator::CondBranch {
                cond,
                then_args,
                else_args,
                ..
            } => {
                sub(cond, old, new);
                for a in then_args.iter_mut().chain(else_args.iter_mut()) {
                    sub(a, old, new);
                }
            }
            Terminator::SwitchEnum { value, .. }
            | Terminator::CheckedCastBranch { value, .. }
            | Terminator::Return { value } => sub(value, old, new),
            Terminator::Unreachable => {}
        }
    }

    /// The value this terminator passes to `dest`'s parameter `idx`, or
    /// `None` if this terminator does not pass explicit arguments there.
    pub fn arg_for_dest(&self, dest: BlockId, idx: usize) -> Option<ValueId> {
        match self {
            Terminator::Branch { target, args } if *target == dest => args.get(idx).copied(),
            Terminator::CondBranch {
                then_dest,
                then_args,
                else_dest,
                else_args,
                ..
            } => {
                if *then_dest == dest {
                    then_args.get(idx).copied()
                } else if *else_dest == dest {
                    else_args.get(idx).copied()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Overwrite the argument passed to `dest`'s parameter `idx`.
    ///
    /// Only meaningful for `Branch`/`CondBranch`; other terminators are
    /// left untouched.
    pub fn set_arg_for_dest(&mut self, dest: BlockId, idx: usize, new: ValueId) {
        match self {
            Terminator::Branch { target, args } if *target == dest => {
                if let Some(slot) = args.get_mut(idx) {
                    *slot = new;
                }
            }
            Terminator::CondBranch {
                then_dest,
                then_args,
                else_dest,
                else_args,
                ..
            } => {
                if *then_dest == dest {
                    if let Some(slot) = then_args.get_mut(idx) {
                        *slot = new;
                    }
                } else if *else_dest == dest {
                    if let Some(slot) = else_args.get_mut(idx) {
                        *slot = new;
                    }
                }
            }
            _ => {}
        }
    }
}

// ── Blocks ──────────────────────────────────────────────────────────

/// A basic block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// This block's identifier.
    pub id: BlockId,
    /// Block parameters — values passed from predecessor terminators.
    pub params: Vec<(ValueId, TyId)>,
    /// Sequential instructions executed in order.
    pub body: Vec<Instr>,
    /// How control leaves this block.
    pub terminator: Terminator,
}

// ── Def sites ───────────────────────────────────────────────────────

/// Where a value is defined.
///
/// Instruction positions are indices into the owning block's body and are
/// invalidated by code motion; look them up fresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefSite {
    /// Function parameter at the given index.
    FuncParam(usize),
    /// Block parameter: (block, parameter index).
    BlockParam(BlockId, usize),
    /// Instruction result: (block, body index).
    Instr(BlockId, usize),
}

// ── Functions ───────────────────────────────────────────────────────

/// A complete function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// The function's mangled name.
    pub name: Name,
    /// Function parameters.
    pub params: Vec<(ValueId, TyId)>,
    /// Basic blocks in definition order. `blocks[entry.index()]` is the
    /// entry.
    pub blocks: Vec<Block>,
    /// The entry block ID.
    pub entry: BlockId,
    /// Type of each value, indexed by `ValueId::index()`. Undef values
    /// appear here with no defining site.
    pub value_types: Vec<TyId>,
}

impl Function {
    /// Look up the type of a value.
    ///
    /// # Panics
    ///
    /// Debug-panics if `value` is out of bounds.
    #[inline]
    pub fn value_type(&self, value: ValueId) -> TyId {
        debug_assert!(
            value.index() < self.value_types.len(),
            "ValueId {} out of bounds (have {} values)",
            value.raw(),
            self.value_types.len(),
        );
        self.value_types[value.index()]
    }

    /// Allocate a fresh value with the given type.
    ///
    /// Used by transforms that introduce synthetic values (payload
    /// extractions, materialized retains).
    pub fn fresh_value(&mut self, ty: TyId) -> ValueId {
        let id = u32::try_from(self.value_types.len())
            .unwrap_or_else(|_| panic!("value count exceeds u32::MAX"));
        self.value_types.push(ty);
        ValueId::new(id)
    }

    /// Allocate an undef value of the given type: a value with no defining
    /// site. Used to detach a predecessor's argument slot when the
    /// instruction that produced it is sunk away.
    pub fn undef_value(&mut self, ty: TyId) -> ValueId {
        self.fresh_value(ty)
    }

    /// Shared access to a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Mutable access to a block.
    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Find where `value` is defined. Returns `None` for undef values.
    pub fn def_site(&self, value: ValueId) -> Option<DefSite> {
        for (i, &(p, _)) in self.params.iter().enumerate() {
            if p == value {
                return Some(DefSite::FuncParam(i));
            }
        }
        for block in &self.blocks {
            for (i, &(p, _)) in block.params.iter().enumerate() {
                if p == value {
                    return Some(DefSite::BlockParam(block.id, i));
                }
            }
            for (i, instr) in block.body.iter().enumerate() {
                if instr.defined_value() == Some(value) {
                    return Some(DefSite::Instr(block.id, i));
                }
            }
        }
        None
    }

    /// The block that defines `value`, or `None` for function parameters
    /// and undef values.
    pub fn defining_block(&self, value: ValueId) -> Option<BlockId> {
        match self.def_site(value)? {
            DefSite::FuncParam(_) => None,
            DefSite::BlockParam(bb, _) | DefSite::Instr(bb, _) => Some(bb),
        }
    }

    /// Count the uses of `value` across all instructions and terminators.
    pub fn count_uses(&self, value: ValueId) -> usize {
        let mut count = 0;
        for block in &self.blocks {
            for instr in &block.body {
                count += instr.operands().iter().filter(|&&v| v == value).count();
            }
            count += block
                .terminator
                .used_values()
                .iter()
                .filter(|&&v| v == value)
                .count();
        }
        count
    }

    /// Returns `true` if `value` has at least one use.
    pub fn has_uses(&self, value: ValueId) -> bool {
        for block in &self.blocks {
            for instr in &block.body {
                if instr.operands().contains(&value) {
                    return true;
                }
            }
            if block.terminator.used_values().contains(&value) {
                return true;
            }
        }
        false
    }

    /// Replace every use of `old` with `new` across the function.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for block in &mut self.blocks {
            for instr in &mut block.body {
                instr.substitute_value(old, new);
            }
            block.terminator.substitute_value(old, new);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
