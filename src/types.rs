//! Type pool for the code-motion IR.
//!
//! Every [`crate::ir::ValueId`] has a type in the pool. The pass only needs
//! a handful of type queries: is a value trivial (no RC traffic), is it a
//! reference-counted object, and what payload does an enum case carry.
//! Types are interned once and referenced by [`TyId`] everywhere.

/// Interned type ID.
///
/// IDs index into a [`TypePool`]. The two builtin scalars are preseeded at
/// fixed indices so tests and lowering code can name them without a pool
/// in hand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TyId(u32);

impl TyId {
    /// Builtin integer type (preseeded at index 0).
    pub const INT: TyId = TyId(0);
    /// Builtin boolean type (preseeded at index 1).
    pub const BOOL: TyId = TyId(1);

    /// Create a type ID from a raw index.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the index as `usize` (for indexing into `Vec`s).
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Enum case ID — the declaration index of a case within its enum type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CaseId(u32);

impl CaseId {
    /// Create a case ID from a raw declaration index.
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the index as `usize`.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One case of an enum type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnumCaseDef {
    /// The payload type, or `None` for payloadless cases.
    pub payload: Option<TyId>,
}

/// A type in the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    /// Builtin integer. Trivial; the only type argument sinking will
    /// re-route through a rewritten block argument.
    Int,
    /// Builtin boolean. Trivial.
    Bool,
    /// Reference-counted heap object.
    Ref,
    /// Unowned reference storage. Non-trivial but not itself the target of
    /// strong RC ops; converted with `UnownedToRef`.
    Unowned,
    /// Aggregate of fields. Trivial iff all fields are trivial.
    Struct(Vec<TyId>),
    /// Tagged union. Trivial iff every payload is trivial.
    Enum(Vec<EnumCaseDef>),
}

/// Interner for [`TypeKind`]s.
///
/// `INT` and `BOOL` are preseeded; everything else is added by the caller
/// before running the pass. The pool is read-only during optimization.
#[derive(Clone, Debug, Default)]
pub struct TypePool {
    kinds: Vec<TypeKind>,
}

impl TypePool {
    /// Create a pool with the builtin scalars preseeded.
    pub fn new() -> Self {
        Self {
            kinds: vec![TypeKind::Int, TypeKind::Bool],
        }
    }

    /// Intern a type and return its ID.
    pub fn add(&mut self, kind: TypeKind) -> TyId {
        let id = u32::try_from(self.kinds.len())
            .unwrap_or_else(|_| panic!("type count exceeds u32::MAX"));
        self.kinds.push(kind);
        TyId::new(id)
    }

    /// Intern a reference-counted object type.
    pub fn add_ref(&mut self) -> TyId {
        self.add(TypeKind::Ref)
    }

    /// Intern an unowned reference storage type.
    pub fn add_unowned(&mut self) -> TyId {
        self.add(TypeKind::Unowned)
    }

    /// Intern a struct type.
    pub fn add_struct(&mut self, fields: Vec<TyId>) -> TyId {
        self.add(TypeKind::Struct(fields))
    }

    /// Intern an enum type.
    pub fn add_enum(&mut self, cases: Vec<EnumCaseDef>) -> TyId {
        self.add(TypeKind::Enum(cases))
    }

    /// Look up a type by ID.
    ///
    /// # Panics
    ///
    /// Debug-panics if `ty` is out of bounds.
    #[inline]
    pub fn kind(&self, ty: TyId) -> &TypeKind {
        debug_assert!(
            ty.index() < self.kinds.len(),
            "TyId {} out of bounds (have {} types)",
            ty.index(),
            self.kinds.len(),
        );
        &self.kinds[ty.index()]
    }

    /// Returns `true` if values of this type need no RC traffic at all.
    pub fn is_trivial(&self, ty: TyId) -> bool {
        match self.kind(ty) {
            TypeKind::Int | TypeKind::Bool => true,
            TypeKind::Ref | TypeKind::Unowned => false,
            TypeKind::Struct(fields) => fields.iter().all(|&f| self.is_trivial(f)),
            TypeKind::Enum(cases) => cases
                .iter()
                .all(|c| c.payload.map_or(true, |p| self.is_trivial(p))),
        }
    }

    /// Returns `true` if this type is a reference-counted object type,
    /// i.e. the legal operand type of `StrongRetain`/`StrongRelease`.
    pub fn is_reference_counted(&self, ty: TyId) -> bool {
        matches!(self.kind(ty), TypeKind::Ref)
    }

    /// Returns `true` for the builtin integer type.
    pub fn is_integer(&self, ty: TyId) -> bool {
        matches!(self.kind(ty), TypeKind::Int)
    }

    /// The case list of an enum type, or `None` if `ty` is not an enum.
    pub fn enum_cases(&self, ty: TyId) -> Option<&[EnumCaseDef]> {
        match self.kind(ty) {
            TypeKind::Enum(cases) => Some(cases),
            _ => None,
        }
    }

    /// The payload type of `case` in enum `ty`, or `None` if `ty` is not
    /// an enum, the case is out of range, or the case has no payload.
    pub fn enum_case_payload(&self, ty: TyId, case: CaseId) -> Option<TyId> {
        self.enum_cases(ty)?.get(case.index())?.payload
    }

    /// Returns `true` if `case` of enum `ty` carries a payload.
    pub fn case_has_payload(&self, ty: TyId, case: CaseId) -> bool {
        self.enum_case_payload(ty, case).is_some()
    }
}

// Tests
