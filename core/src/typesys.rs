//! The type system: interning, naming, structural comparison and
//! member/subtype/procedure lookup over the type universe of the language.
//!
//! Types are opaque integer handles into a descriptor store. Handles are
//! stable for the lifetime of a compilation and cheap to copy around; all
//! structure lives in the descriptors. Composite types (structures, species,
//! enums) own a chain of member descriptors that loops back to the parent,
//! so walking members needs no separate collection.

use crate::{error::TypeError, pool::Pool, registers::RegClass};
use bitflags::bitflags;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::BitAnd;

/// An opaque handle to a type descriptor. Negative values mean "no type".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Type(i32);

impl Type {
    /// The "no type" sentinel.
    pub const NONE: Type = Type(-1);

    // The builtin types, created by [TypeSystem::new] in this exact order
    // so the handles are known constants.
    pub const CHAR: Type = Type(0);
    pub const INT: Type = Type(1);
    pub const REAL: Type = Type(2);
    pub const POINT: Type = Type(3);
    pub const OBJ: Type = Type(4);
    pub const VOID: Type = Type(5);
    // Lifecycle sentinels. These are ordinary (zero-sized) types; the
    // language uses them to key the methods that run when a box is opened,
    // closed, paused or destroyed.
    pub const OPEN: Type = Type(6);
    pub const CLOSE: Type = Type(7);
    pub const PAUSE: Type = Type(8);
    pub const DESTROY: Type = Type(9);

    pub fn is_none(self) -> bool {
        self.0 < 0
    }

    /// True for the lifecycle sentinels OPEN, CLOSE, PAUSE and DESTROY.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            Type::OPEN | Type::CLOSE | Type::PAUSE | Type::DESTROY
        )
    }

    /// The register class a value of this type travels in. Only meaningful
    /// for the intrinsic handles; everything else is object-like.
    pub fn reg_class(self) -> RegClass {
        match self {
            Type::CHAR => RegClass::Char,
            Type::INT => RegClass::Int,
            Type::REAL => RegClass::Real,
            Type::POINT => RegClass::Point,
            _ => RegClass::Obj,
        }
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    /// Rebuild a handle from its raw value, e.g. a type id stored in a
    /// heap-block header.
    pub fn from_raw(raw: i32) -> Self {
        Type(raw)
    }
}

bitflags! {
    /// Which wrapper kinds a resolution step is allowed to see through.
    /// Member descriptors are always transparent.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ResolveSet: u32 {
        const ALIAS = 1;
        const SPECIES = 2;
        const SUBTYPE = 4;
        const DETACHED = 8;
        /// Only resolve wrappers that carry no name
        const ANONYMOUS = 16;
    }
}

bitflags! {
    /// The kind bits of a procedure type. A procedure registered with both
    /// bits is the "special method" form.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ProcKind: u32 {
        const FIRST_CALL = 1;
        const SUBSEQUENT_CALL = 2;
    }
}

impl ProcKind {
    pub const SPECIAL: ProcKind =
        ProcKind::FIRST_CALL.union(ProcKind::SUBSEQUENT_CALL);
}

/// The outcome of a structural comparison. The values form a small lattice
/// combined with bitwise-and: `Equal` is the top, any `Unmatch` poisons the
/// whole comparison, and `Expand` additionally records that the right-hand
/// value must be expanded (species promotion) before use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Cmp {
    Unmatch = 0,
    Expand = 1,
    Match = 3,
    Equal = 7,
}

impl Cmp {
    fn from_bits(bits: u8) -> Self {
        match bits {
            7 => Cmp::Equal,
            3 => Cmp::Match,
            1 => Cmp::Expand,
            _ => Cmp::Unmatch,
        }
    }

    /// Does this outcome mean the types are usable together (possibly with
    /// expansion)?
    pub fn matches(self) -> bool {
        self != Cmp::Unmatch
    }
}

impl BitAnd for Cmp {
    type Output = Cmp;

    fn bitand(self, rhs: Cmp) -> Cmp {
        Cmp::from_bits(self as u8 & rhs as u8)
    }
}

/// The variant part of a type descriptor.
#[derive(Clone, Debug)]
enum TypeKind {
    /// Fundamental type with a fixed byte size
    Intrinsic,
    /// Named reference to another type; transparent to comparison
    Alias { target: Type },
    /// Like an alias, but nominally distinct: never compares equal to its
    /// target
    Detached { target: Type },
    /// Element type plus a length; `None` length means unknown
    Array { elem: Type, len: Option<i64> },
    /// Ordered sequence of typed, optionally named members
    Structure { first: Type, last: Type },
    /// Ordered alternatives; the last member is the target every smaller
    /// alternative converts to
    Species { first: Type, last: Type },
    /// Tagged union
    Enum { first: Type, last: Type },
    /// One element of a structure/species/enum. `next` is the following
    /// member, or the parent for the last one. For structure members
    /// `offset` is the byte offset inside the parent; for species and enum
    /// members it holds the member's own size.
    Member {
        target: Type,
        next: Type,
        offset: usize,
    },
    /// A procedure `child @ parent`. Registered procedures are threaded
    /// into their parent's procedure list.
    Proc {
        parent: Type,
        child: Type,
        kind: ProcKind,
        sym_num: u32,
        registered: bool,
        next_proc: Type,
    },
    /// A named child attached to a parent type. Unregistered until `child`
    /// is set.
    Subtype {
        parent: Type,
        child: Type,
        child_name: String,
    },
}

/// One type descriptor. `size` is `None` only during partial construction
/// (unregistered subtypes, procedures).
#[derive(Clone, Debug)]
struct TypeDesc {
    kind: TypeKind,
    size: Option<usize>,
    name: Option<String>,
    /// Head of the chain of procedures registered on this type
    first_proc: Type,
}

impl TypeDesc {
    fn new(kind: TypeKind, size: Option<usize>) -> Self {
        Self {
            kind,
            size,
            name: None,
            first_proc: Type::NONE,
        }
    }
}

/// The type system. Owns every descriptor; handles returned to callers are
/// non-owning and stable.
#[derive(Debug)]
pub struct TypeSystem {
    descs: Pool<TypeDesc>,
    /// `(structure, member name) -> member descriptor`
    members: HashMap<(Type, String), Type>,
    /// `(parent, child name) -> registered subtype`
    subtypes: HashMap<(Type, String), Type>,
}

impl TypeSystem {
    /// Create a type system with the builtin types installed. Their handles
    /// are the `Type::CHAR` .. `Type::DESTROY` constants.
    pub fn new() -> Self {
        let mut ts = Self {
            descs: Pool::new(),
            members: HashMap::new(),
            subtypes: HashMap::new(),
        };
        let builtins: [(&str, usize, Type); 10] = [
            ("Char", RegClass::Char.size(), Type::CHAR),
            ("Int", RegClass::Int.size(), Type::INT),
            ("Real", RegClass::Real.size(), Type::REAL),
            ("Point", RegClass::Point.size(), Type::POINT),
            ("Obj", RegClass::Obj.size(), Type::OBJ),
            ("Void", 0, Type::VOID),
            ("Open", 0, Type::OPEN),
            ("Close", 0, Type::CLOSE),
            ("Pause", 0, Type::PAUSE),
            ("Destroy", 0, Type::DESTROY),
        ];
        for (name, size, expected) in builtins.iter() {
            let t = ts.intrinsic_new(*size);
            assert_eq!(t, *expected);
            ts.name_set(t, name).unwrap();
        }
        ts
    }

    fn alloc(&mut self, desc: TypeDesc) -> Type {
        let index = self.descs.occupy(desc);
        Type((index - 1) as i32)
    }

    fn desc(&self, t: Type) -> &TypeDesc {
        self.descs
            .get((t.0 + 1) as usize)
            .unwrap_or_else(|_| panic!("dangling type handle {:?}", t))
    }

    fn desc_mut(&mut self, t: Type) -> &mut TypeDesc {
        self.descs
            .get_mut((t.0 + 1) as usize)
            .unwrap_or_else(|_| panic!("dangling type handle {:?}", t))
    }

    /// Byte size of a type, or `None` while it is partially constructed.
    pub fn size(&self, t: Type) -> Option<usize> {
        self.desc(t).size
    }

    /// A type is anonymous until [Self::name_set] gives it a name.
    pub fn is_anonymous(&self, t: Type) -> bool {
        t.is_none() || self.desc(t).name.is_none()
    }

    pub fn is_structure(&self, t: Type) -> bool {
        matches!(self.desc(t).kind, TypeKind::Structure { .. })
    }

    pub fn is_member(&self, t: Type) -> bool {
        !t.is_none() && matches!(self.desc(t).kind, TypeKind::Member { .. })
    }

    pub fn is_subtype(&self, t: Type) -> bool {
        matches!(self.desc(t).kind, TypeKind::Subtype { .. })
    }

    /// Address alignment hook. Members are currently packed back to back.
    pub fn align(&self, address: usize) -> usize {
        address
    }

    // ----- construction ----------------------------------------------------

    /// Create a fundamental type of the given byte size.
    pub fn intrinsic_new(&mut self, size: usize) -> Type {
        self.alloc(TypeDesc::new(TypeKind::Intrinsic, Some(size)))
    }

    /// Create a transparent named reference to `target`.
    pub fn alias_new(&mut self, target: Type) -> Type {
        let size = self.desc(target).size;
        self.alloc(TypeDesc::new(TypeKind::Alias { target }, size))
    }

    /// Create a detached copy of `target`: structurally identical but
    /// incompatible under comparison.
    pub fn detached_new(&mut self, target: Type) -> Type {
        let size = self.desc(target).size;
        self.alloc(TypeDesc::new(TypeKind::Detached { target }, size))
    }

    /// Create an array of `num_items` elements of type `elem`. A negative
    /// count means the length is unknown.
    pub fn array_new(&mut self, elem: Type, num_items: i64) -> Type {
        let elem_size = self.desc(elem).size;
        let len = if num_items < 0 { None } else { Some(num_items) };
        let size = match len {
            Some(n) => elem_size.map(|s| s * n as usize),
            None => None,
        };
        self.alloc(TypeDesc::new(TypeKind::Array { elem, len }, size))
    }

    /// Start an empty structure; members are appended with
    /// [Self::structure_add].
    pub fn structure_begin(&mut self) -> Type {
        self.alloc(TypeDesc::new(
            TypeKind::Structure {
                first: Type::NONE,
                last: Type::NONE,
            },
            Some(0),
        ))
    }

    /// Start an empty species; members are appended with
    /// [Self::species_add]. The last member added becomes the target.
    pub fn species_begin(&mut self) -> Type {
        self.alloc(TypeDesc::new(
            TypeKind::Species {
                first: Type::NONE,
                last: Type::NONE,
            },
            Some(0),
        ))
    }

    /// Start an empty enumeration; members are appended with
    /// [Self::enum_add].
    pub fn enum_begin(&mut self) -> Type {
        self.alloc(TypeDesc::new(
            TypeKind::Enum {
                first: Type::NONE,
                last: Type::NONE,
            },
            Some(0),
        ))
    }

    /// Append a member to a structure. Named members are also indexed for
    /// [Self::member_find]; a duplicate name is an error.
    pub fn structure_add(
        &mut self,
        structure: Type,
        member_type: Type,
        member_name: Option<&str>,
    ) -> Result<(), TypeError> {
        if let Some(name) = member_name {
            let key = (structure, name.to_owned());
            if self.members.contains_key(&key) {
                return Err(TypeError::DuplicateMember {
                    structure: self.name_get(structure),
                    member: name.to_owned(),
                });
            }
        }

        let member_size = self.member_size(member_type);
        let offset = self.align(self.desc(structure).size.unwrap_or(0));
        let member =
            self.chain_member(structure, member_type, member_name, offset);

        let desc = self.desc_mut(structure);
        match &mut desc.kind {
            TypeKind::Structure { .. } => {
                desc.size = Some(offset + member_size);
            }
            _ => panic!("structure_add on a non-structure type"),
        }
        if let Some(name) = member_name {
            self.members.insert((structure, name.to_owned()), member);
        }
        Ok(())
    }

    /// Append an alternative to a species. The member becomes the new
    /// target.
    pub fn species_add(&mut self, species: Type, member_type: Type) {
        let member_size = self.member_size(member_type);
        self.chain_member(species, member_type, None, member_size);
        let desc = self.desc_mut(species);
        match &mut desc.kind {
            TypeKind::Species { .. } => {
                desc.size = Some(desc.size.unwrap_or(0).max(member_size));
            }
            _ => panic!("species_add on a non-species type"),
        }
    }

    /// Append a variant to an enumeration. The payload size is the largest
    /// member plus the discriminant.
    pub fn enum_add(&mut self, enumeration: Type, member_type: Type) {
        let member_size = self.member_size(member_type);
        self.chain_member(enumeration, member_type, None, member_size);
        let with_tag = member_size + self.align(RegClass::Int.size());
        let desc = self.desc_mut(enumeration);
        match &mut desc.kind {
            TypeKind::Enum { .. } => {
                desc.size = Some(desc.size.unwrap_or(0).max(with_tag));
            }
            _ => panic!("enum_add on a non-enum type"),
        }
    }

    /// Members of composites must be fully constructed types.
    fn member_size(&self, member_type: Type) -> usize {
        match self.desc(member_type).size {
            Some(size) => size,
            None => panic!(
                "member type `{}` has no size yet",
                self.name_get(member_type)
            ),
        }
    }

    /// Create a member descriptor and thread it onto the end of the
    /// parent's member chain. The chain loops back to the parent.
    fn chain_member(
        &mut self,
        parent: Type,
        target: Type,
        name: Option<&str>,
        offset: usize,
    ) -> Type {
        let mut desc = TypeDesc::new(
            TypeKind::Member {
                target,
                next: parent,
                offset,
            },
            self.desc(target).size,
        );
        desc.name = name.map(str::to_owned);
        let member = self.alloc(desc);

        let (first, last) = match self.desc(parent).kind {
            TypeKind::Structure { first, last }
            | TypeKind::Species { first, last }
            | TypeKind::Enum { first, last } => (first, last),
            _ => panic!("member added to a non-composite type"),
        };
        if !last.is_none() {
            match &mut self.desc_mut(last).kind {
                TypeKind::Member { next, .. } => *next = member,
                _ => panic!("composite chain corrupt"),
            }
        }
        let new_first = if first.is_none() { member } else { first };
        match &mut self.desc_mut(parent).kind {
            TypeKind::Structure { first, last }
            | TypeKind::Species { first, last }
            | TypeKind::Enum { first, last } => {
                *first = new_first;
                *last = member;
            }
            _ => unreachable!(),
        }
        member
    }

    // ----- naming ----------------------------------------------------------

    /// Give a name to an anonymous type. A type can be named only once.
    pub fn name_set(&mut self, t: Type, name: &str) -> Result<(), TypeError> {
        if let Some(existing) = &self.desc(t).name {
            return Err(TypeError::NameAlreadySet {
                type_name: name.to_owned(),
                existing: existing.clone(),
            });
        }
        self.desc_mut(t).name = Some(name.to_owned());
        Ok(())
    }

    /// Render the canonical textual form of a type. Named types render as
    /// their name; anonymous composites are synthesized from their parts.
    pub fn name_get(&self, t: Type) -> String {
        if t.is_none() {
            return "<none>".to_owned();
        }
        // See through anonymous aliases and members first
        let t = self.resolve_for_naming(t);
        let desc = self.desc(t);
        if let Some(name) = &desc.name {
            return name.clone();
        }

        match &desc.kind {
            TypeKind::Intrinsic => {
                format!("<size={}>", desc.size.unwrap_or(0))
            }
            TypeKind::Alias { target } | TypeKind::Member { target, .. } => {
                self.name_get(*target)
            }
            TypeKind::Detached { target } => {
                format!("++{}", self.name_get(*target))
            }
            TypeKind::Array { elem, len } => match len {
                Some(n) => format!("({}){}", n, self.name_get(*elem)),
                None => format!("(){}", self.name_get(*elem)),
            },
            TypeKind::Structure { .. } => {
                self.name_composite(t, ", ", true, "(,)")
            }
            TypeKind::Species { .. } => {
                self.name_composite(t, "->", false, "(->)")
            }
            TypeKind::Enum { .. } => self.name_composite(t, "|", false, "(|)"),
            TypeKind::Proc {
                parent,
                child,
                kind,
                ..
            } => {
                let arrow = if *kind == ProcKind::SPECIAL {
                    "@&"
                } else if kind.contains(ProcKind::SUBSEQUENT_CALL) {
                    "@@"
                } else {
                    "@"
                };
                format!(
                    "{}{}{}",
                    self.name_get(*child),
                    arrow,
                    self.name_get(*parent)
                )
            }
            TypeKind::Subtype {
                parent, child_name, ..
            } => format!("{}.{}", self.name_get(*parent), child_name),
        }
    }

    /// Render a composite as its joined member list. For structures, member
    /// names are shown and consecutive members of the same type elide the
    /// repeated type name, matching the surface syntax of the language.
    fn name_composite(
        &self,
        t: Type,
        sep: &str,
        with_names: bool,
        empty: &str,
    ) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut previous_type = Type::NONE;
        let mut m = self.member_next(t);
        while self.is_member(m) {
            let (target, _) = self.member_get(m);
            let mut part = self.name_get(target);
            if with_names {
                if let Some(member_name) = &self.desc(m).name {
                    if target == previous_type {
                        part = member_name.clone();
                    } else {
                        part = format!("{} {}", part, member_name);
                    }
                }
                previous_type = target;
            }
            parts.push(part);
            m = self.member_next(m);
        }
        if parts.is_empty() {
            empty.to_owned()
        } else {
            format!("({})", parts.join(sep))
        }
    }

    /// Resolution used by [Self::name_get]: see through aliases and members
    /// until something named (or something else entirely) shows up.
    fn resolve_for_naming(&self, mut t: Type) -> Type {
        loop {
            let desc = self.desc(t);
            match desc.kind {
                TypeKind::Alias { target }
                | TypeKind::Member { target, .. }
                    if desc.name.is_none() =>
                {
                    t = target;
                }
                _ => return t,
            }
        }
    }

    // ----- resolution ------------------------------------------------------

    /// One resolution step: unwrap the outermost wrapper if `select` allows
    /// it. Members always resolve; species resolve toward their target.
    /// Returns `t` unchanged when nothing applies.
    pub fn resolve_once(&self, t: Type, select: ResolveSet) -> Type {
        if t.is_none() {
            return t;
        }
        let desc = self.desc(t);
        let (resolved, target) = match &desc.kind {
            TypeKind::Member { target, .. } => (true, *target),
            TypeKind::Alias { target } => {
                (select.contains(ResolveSet::ALIAS), *target)
            }
            TypeKind::Detached { target } => {
                (select.contains(ResolveSet::DETACHED), *target)
            }
            TypeKind::Species { last, .. } => {
                (select.contains(ResolveSet::SPECIES) && !last.is_none(), *last)
            }
            // The child of a subtype is never a subtype itself, so this
            // resolves at most once
            TypeKind::Subtype { child, .. } => (
                select.contains(ResolveSet::SUBTYPE) && !child.is_none(),
                *child,
            ),
            _ => (false, Type::NONE),
        };
        if select.contains(ResolveSet::ANONYMOUS) && desc.name.is_some() {
            return t;
        }
        if resolved {
            target
        } else {
            t
        }
    }

    /// Apply [Self::resolve_once] to a fixed point.
    pub fn resolve(&self, t: Type, select: ResolveSet) -> Type {
        let mut t = t;
        loop {
            let next = self.resolve_once(t, select);
            if next == t {
                return t;
            }
            t = next;
        }
    }

    /// The core type of `t`: aliases, detached wrappers and species
    /// resolved away, leaving what the type intrinsically is.
    pub fn core_type(&self, t: Type) -> Type {
        self.resolve(
            t,
            ResolveSet::ALIAS | ResolveSet::DETACHED | ResolveSet::SPECIES,
        )
    }

    // ----- members ---------------------------------------------------------

    /// Find a named member of a structure. Aliases, species and detached
    /// wrappers around the structure are resolved first.
    pub fn member_find(&self, s: Type, name: &str) -> Option<Type> {
        let s = self.resolve(
            s,
            ResolveSet::ALIAS | ResolveSet::SPECIES | ResolveSet::DETACHED,
        );
        self.members.get(&(s, name.to_owned())).copied()
    }

    /// The type and parent-relative offset of a member descriptor.
    pub fn member_get(&self, m: Type) -> (Type, usize) {
        match self.desc(m).kind {
            TypeKind::Member { target, offset, .. } => (target, offset),
            _ => panic!("member_get on a non-member type"),
        }
    }

    /// The name of a structure member, if it has one.
    pub fn member_name(&self, m: Type) -> Option<&str> {
        match self.desc(m).kind {
            TypeKind::Member { .. } => self.desc(m).name.as_deref(),
            _ => panic!("member_name on a non-member type"),
        }
    }

    /// For a composite, the first member; for a member, the next one, or
    /// the parent composite after the last member.
    pub fn member_next(&self, m: Type) -> Type {
        match self.desc(m).kind {
            TypeKind::Member { next, .. } => next,
            TypeKind::Structure { first, .. }
            | TypeKind::Species { first, .. }
            | TypeKind::Enum { first, .. } => first,
            _ => Type::NONE,
        }
    }

    /// Count the members of a structure/species/enum.
    pub fn member_count(&self, s: Type) -> Result<usize, TypeError> {
        match self.desc(s).kind {
            TypeKind::Structure { .. }
            | TypeKind::Species { .. }
            | TypeKind::Enum { .. } => {}
            _ => return Err(TypeError::NotMembered(self.name_get(s))),
        }
        let mut count = 0;
        let mut next = self.member_next(s);
        while self.is_member(next) {
            count += 1;
            next = self.member_next(next);
        }
        Ok(count)
    }

    /// Given an array type (possibly wrapped), return its element type and
    /// length.
    pub fn array_member(
        &self,
        array: Type,
    ) -> Result<(Type, Option<i64>), TypeError> {
        let a = self.resolve(
            array,
            ResolveSet::ALIAS | ResolveSet::SPECIES | ResolveSet::DETACHED,
        );
        match self.desc(a).kind {
            TypeKind::Array { elem, len } => Ok((elem, len)),
            _ => Err(TypeError::NotAnArray(self.name_get(array))),
        }
    }

    // ----- procedures ------------------------------------------------------

    /// Create a procedure type `child @ parent` of the given kind. The
    /// procedure is not registered yet.
    pub fn procedure_new(
        &mut self,
        parent: Type,
        child: Type,
        kind: ProcKind,
    ) -> Type {
        self.alloc(TypeDesc::new(
            TypeKind::Proc {
                parent,
                child,
                kind,
                sym_num: 0,
                registered: false,
                next_proc: Type::NONE,
            },
            None,
        ))
    }

    /// Register a procedure: prepend it to its parent's procedure list and
    /// attach the linker symbol that installation will use.
    pub fn procedure_register(&mut self, p: Type, sym_num: u32) {
        let parent = match &self.desc(p).kind {
            TypeKind::Proc {
                parent, registered, ..
            } => {
                assert!(!registered, "procedure registered twice");
                *parent
            }
            _ => panic!("procedure_register on a non-procedure type"),
        };
        let head = self.desc(parent).first_proc;
        match &mut self.desc_mut(p).kind {
            TypeKind::Proc {
                sym_num: sym,
                registered,
                next_proc,
                ..
            } => {
                *sym = sym_num;
                *registered = true;
                *next_proc = head;
            }
            _ => unreachable!(),
        }
        self.desc_mut(parent).first_proc = p;
    }

    /// `(parent, child, kind, sym_num)` of a procedure type.
    pub fn procedure_info(&self, p: Type) -> (Type, Type, ProcKind, u32) {
        match &self.desc(p).kind {
            TypeKind::Proc {
                parent,
                child,
                kind,
                sym_num,
                ..
            } => (*parent, *child, *kind, *sym_num),
            _ => panic!("procedure_info on a non-procedure type"),
        }
    }

    /// The linker symbol of a registered procedure.
    pub fn procedure_sym_num(&self, p: Type) -> u32 {
        self.procedure_info(p).3
    }

    /// Walk the procedures registered on `parent` looking for one whose
    /// kind overlaps `kind` and whose child accepts `child`. Returns the
    /// procedure and, when the argument has to be expanded before the call,
    /// the type to expand it to.
    pub fn procedure_search(
        &self,
        parent: Type,
        child: Type,
        kind: ProcKind,
    ) -> (Option<Type>, Option<Type>) {
        let mut p = self.desc(parent).first_proc;
        while !p.is_none() {
            let (p_child, p_kind, next) = match &self.desc(p).kind {
                TypeKind::Proc {
                    child,
                    kind,
                    next_proc,
                    ..
                } => (*child, *kind, *next_proc),
                _ => panic!("procedure list corrupt"),
            };
            if p_kind.intersects(kind) {
                let comparison = self.compare(p_child, child);
                if comparison.matches() {
                    let expansion = if comparison == Cmp::Expand {
                        Some(p_child)
                    } else {
                        None
                    };
                    return (Some(p), expansion);
                }
            }
            p = next;
        }
        (None, None)
    }

    /// Like [Self::procedure_search], but when nothing is found the parent
    /// is resolved one step (alias, detached, species, subtype) and the
    /// search retries, until resolution makes no further progress.
    pub fn procedure_inherited_search(
        &self,
        parent: Type,
        child: Type,
        kind: ProcKind,
    ) -> (Option<Type>, Option<Type>) {
        let mut parent = parent;
        loop {
            let found = self.procedure_search(parent, child, kind);
            if found.0.is_some() {
                return found;
            }
            let resolved = self.resolve_once(
                parent,
                ResolveSet::ALIAS
                    | ResolveSet::DETACHED
                    | ResolveSet::SPECIES
                    | ResolveSet::SUBTYPE,
            );
            if resolved == parent {
                return (None, None);
            }
            parent = resolved;
        }
    }

    // ----- subtypes --------------------------------------------------------

    /// Create an unregistered subtype of `parent` with the given child
    /// name. The parent is not aware of it until registration.
    pub fn subtype_new(&mut self, parent: Type, child_name: &str) -> Type {
        self.alloc(TypeDesc::new(
            TypeKind::Subtype {
                parent,
                child: Type::NONE,
                child_name: child_name.to_owned(),
            },
            None,
        ))
    }

    /// Register a previously created subtype with its actual child type. A
    /// second registration under the same `(parent, name)` succeeds only if
    /// the child types structurally match; it then leaves the original
    /// registration in place.
    pub fn subtype_register(
        &mut self,
        subtype: Type,
        child_type: Type,
    ) -> Result<(), TypeError> {
        let (parent, child, child_name) = match &self.desc(subtype).kind {
            TypeKind::Subtype {
                parent,
                child,
                child_name,
            } => (*parent, *child, child_name.clone()),
            _ => panic!("subtype_register on a non-subtype type"),
        };
        if !child.is_none() {
            return Err(TypeError::SubtypeRedefinition(self.name_get(subtype)));
        }

        if let Some(&found) = self.subtypes.get(&(parent, child_name.clone()))
        {
            let found_child = match self.desc(found).kind {
                TypeKind::Subtype { child, .. } => child,
                _ => panic!("subtype index corrupt"),
            };
            let comparison = self.compare(found_child, child_type);
            return if (comparison & Cmp::Match) == Cmp::Unmatch {
                Err(TypeError::SubtypeRedefinition(self.name_get(subtype)))
            } else {
                Ok(())
            };
        }

        match &mut self.desc_mut(subtype).kind {
            TypeKind::Subtype { child, .. } => *child = child_type,
            _ => unreachable!(),
        }
        // A subtype value is a pair of pointers: parent and child instances
        self.desc_mut(subtype).size = Some(2 * RegClass::Obj.size());
        self.subtypes.insert((parent, child_name), subtype);
        Ok(())
    }

    /// Find the registered subtype of `parent` with the given child name.
    pub fn subtype_find(&self, parent: Type, child_name: &str) -> Option<Type> {
        self.subtypes
            .get(&(parent, child_name.to_owned()))
            .copied()
    }

    /// The child type of a registered subtype.
    pub fn subtype_child(&self, subtype: Type) -> Type {
        match &self.desc(subtype).kind {
            TypeKind::Subtype { child, .. } => {
                assert!(!child.is_none(), "subtype is not registered");
                *child
            }
            _ => panic!("subtype_child on a non-subtype type"),
        }
    }

    /// The parent type of a subtype.
    pub fn subtype_parent(&self, subtype: Type) -> Type {
        match &self.desc(subtype).kind {
            TypeKind::Subtype { parent, .. } => *parent,
            _ => panic!("subtype_parent on a non-subtype type"),
        }
    }

    // ----- comparison ------------------------------------------------------

    /// Resolution used on the left side of a comparison: aliases and
    /// members are transparent, names and everything else stop it.
    fn resolve_lhs(&self, mut t: Type) -> Type {
        loop {
            match self.desc(t).kind {
                TypeKind::Alias { target }
                | TypeKind::Member { target, .. } => t = target,
                _ => return t,
            }
        }
    }

    /// Resolution used on the right side: additionally collapses species
    /// down to their target.
    fn resolve_rhs(&self, mut t: Type) -> Type {
        loop {
            match self.desc(t).kind {
                TypeKind::Alias { target }
                | TypeKind::Member { target, .. } => t = target,
                TypeKind::Species { last, .. } if !last.is_none() => t = last,
                _ => return t,
            }
        }
    }

    /// Compare two types and require at least a match. On failure both
    /// type names are rendered into the error.
    pub fn check_compatible(
        &self,
        t1: Type,
        t2: Type,
    ) -> Result<Cmp, TypeError> {
        match self.compare(t1, t2) {
            Cmp::Unmatch => Err(TypeError::Incompatible {
                left: self.name_get(t1),
                right: self.name_get(t2),
            }),
            cmp => Ok(cmp),
        }
    }

    /// Structural comparison: does a value of type `t2` fit where a `t1` is
    /// expected? See [Cmp] for the outcome lattice. Member names are not
    /// compared; nominal incompatibility is expressed with detached types.
    pub fn compare(&self, t1: Type, t2: Type) -> Cmp {
        let mut t1 = t1;
        let mut t2 = t2;
        let mut cmp = Cmp::Equal;
        if t1 == t2 {
            return Cmp::Equal;
        }
        loop {
            t1 = self.resolve_lhs(t1);
            t2 = self.resolve_rhs(t2);
            if t1 == t2 {
                return cmp;
            }

            match (&self.desc(t1).kind, &self.desc(t2).kind) {
                // Distinct intrinsic or detached handles never match
                (TypeKind::Intrinsic, _) | (TypeKind::Detached { .. }, _) => {
                    return Cmp::Unmatch;
                }

                // A species accepts anything one of its alternatives
                // accepts; matching a non-target alternative costs an
                // expansion to the target.
                (TypeKind::Species { .. }, _) => {
                    let mut m = self.member_next(t1);
                    loop {
                        if m == t1 {
                            return Cmp::Unmatch;
                        }
                        if self.compare(m, t2).matches() {
                            return if self.member_next(m) == t1 {
                                cmp
                            } else {
                                cmp & Cmp::Expand
                            };
                        }
                        m = self.member_next(m);
                    }
                }

                // Structures and enums compare pairwise; lengths must agree
                (TypeKind::Structure { .. }, TypeKind::Structure { .. })
                | (TypeKind::Enum { .. }, TypeKind::Enum { .. }) => {
                    let mut m1 = self.member_next(t1);
                    let mut m2 = self.member_next(t2);
                    loop {
                        let end1 = !self.is_member(m1);
                        let end2 = !self.is_member(m2);
                        if end1 || end2 {
                            return if end1 && end2 { cmp } else { Cmp::Unmatch };
                        }
                        cmp = cmp & self.compare(m1, m2);
                        if cmp == Cmp::Unmatch {
                            return Cmp::Unmatch;
                        }
                        m1 = self.member_next(m1);
                        m2 = self.member_next(m2);
                    }
                }
                (TypeKind::Structure { .. }, _) | (TypeKind::Enum { .. }, _) => {
                    return Cmp::Unmatch;
                }

                // Arrays compare their elements; an unknown length on the
                // left accepts any length on the right at Match strength
                (
                    TypeKind::Array { elem: e1, len: l1 },
                    TypeKind::Array { elem: e2, len: l2 },
                ) => {
                    if l1 != l2 {
                        if l1.is_some() {
                            return Cmp::Unmatch;
                        }
                        cmp = cmp & Cmp::Match;
                    }
                    t1 = *e1;
                    t2 = *e2;
                    if t1 == t2 {
                        return cmp;
                    }
                }
                (TypeKind::Array { .. }, _) => return Cmp::Unmatch,

                // Procedures must overlap in kind, agree exactly on the
                // parent, and compare on the child
                (
                    TypeKind::Proc {
                        parent: p1,
                        child: c1,
                        kind: k1,
                        ..
                    },
                    TypeKind::Proc {
                        parent: p2,
                        child: c2,
                        kind: k2,
                        ..
                    },
                ) => {
                    if !k1.intersects(*k2) {
                        return Cmp::Unmatch;
                    }
                    if self.compare(*p1, *p2) != Cmp::Equal {
                        return Cmp::Unmatch;
                    }
                    return self.compare(*c1, *c2);
                }

                _ => return Cmp::Unmatch,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build `(Real <a>, Real <b>)` with the given member names.
    fn two_real_struct(
        ts: &mut TypeSystem,
        a: Option<&str>,
        b: Option<&str>,
    ) -> Type {
        let s = ts.structure_begin();
        ts.structure_add(s, Type::REAL, a).unwrap();
        ts.structure_add(s, Type::REAL, b).unwrap();
        s
    }

    #[test]
    fn test_builtin_handles() {
        let ts = TypeSystem::new();
        assert_eq!(ts.size(Type::CHAR), Some(1));
        assert_eq!(ts.size(Type::INT), Some(8));
        assert_eq!(ts.size(Type::POINT), Some(16));
        assert_eq!(ts.name_get(Type::REAL), "Real");
        assert!(Type::PAUSE.is_special());
        assert!(!Type::OBJ.is_special());
    }

    #[test]
    fn test_compare_is_reflexive() {
        let mut ts = TypeSystem::new();
        let s = two_real_struct(&mut ts, Some("x"), Some("y"));
        let a = ts.array_new(Type::INT, 4);
        for t in [Type::CHAR, Type::REAL, s, a].iter() {
            assert_eq!(ts.compare(*t, *t), Cmp::Equal);
        }
    }

    #[test]
    fn test_compare_structures_ignore_member_names() {
        let mut ts = TypeSystem::new();
        let t1 = two_real_struct(&mut ts, Some("x"), Some("y"));
        let t2 = two_real_struct(&mut ts, Some("a"), Some("b"));
        let t3 = two_real_struct(&mut ts, None, None);
        assert_eq!(ts.compare(t1, t2), Cmp::Equal);
        assert_eq!(ts.compare(t1, t3), Cmp::Equal);

        // Different length or member type unmatches
        let shorter = ts.structure_begin();
        ts.structure_add(shorter, Type::REAL, Some("x")).unwrap();
        assert_eq!(ts.compare(t1, shorter), Cmp::Unmatch);
        let ints = ts.structure_begin();
        ts.structure_add(ints, Type::INT, None).unwrap();
        ts.structure_add(ints, Type::INT, None).unwrap();
        assert_eq!(ts.compare(t1, ints), Cmp::Unmatch);
    }

    #[test]
    fn test_compare_detached_is_opaque() {
        let mut ts = TypeSystem::new();
        let t1 = two_real_struct(&mut ts, Some("x"), Some("y"));
        let t3 = ts.detached_new(t1);
        assert_eq!(ts.compare(t1, t3), Cmp::Unmatch);
        assert_eq!(ts.compare(t3, t1), Cmp::Unmatch);
        assert_eq!(ts.compare(t3, t3), Cmp::Equal);
    }

    #[test]
    fn test_compare_alias_is_transparent() {
        let mut ts = TypeSystem::new();
        let t1 = two_real_struct(&mut ts, Some("x"), Some("y"));
        let alias = ts.alias_new(t1);
        ts.name_set(alias, "Pair").unwrap();
        let t2 = two_real_struct(&mut ts, None, None);
        assert_eq!(ts.compare(alias, t1), Cmp::Equal);
        assert_eq!(ts.compare(alias, t2), Cmp::Equal);
        assert_eq!(ts.compare(t2, alias), Cmp::Equal);
    }

    #[test]
    fn test_compare_species_expands() {
        let mut ts = TypeSystem::new();
        let num = ts.species_begin();
        ts.species_add(num, Type::CHAR);
        ts.species_add(num, Type::INT);
        ts.species_add(num, Type::REAL);

        // The target matches without expansion
        assert_eq!(ts.compare(num, Type::REAL), Cmp::Equal);
        // A smaller alternative matches but must be expanded
        assert_eq!(ts.compare(num, Type::INT), Cmp::Expand);
        assert_eq!(ts.compare(num, Type::CHAR), Cmp::Expand);
        assert_eq!(ts.compare(num, Type::POINT), Cmp::Unmatch);

        // The reverse direction collapses the species to its target
        assert_eq!(ts.compare(Type::REAL, num), Cmp::Equal);
        assert_eq!(ts.compare(Type::INT, num), Cmp::Unmatch);
    }

    #[test]
    fn test_compare_arrays() {
        let mut ts = TypeSystem::new();
        let a10 = ts.array_new(Type::INT, 10);
        let a10b = ts.array_new(Type::INT, 10);
        let a7 = ts.array_new(Type::INT, 7);
        let open = ts.array_new(Type::INT, -1);
        assert_eq!(ts.compare(a10, a10b), Cmp::Equal);
        assert_eq!(ts.compare(a10, a7), Cmp::Unmatch);
        // Unknown length on the left matches any length, at Match strength
        assert_eq!(ts.compare(open, a10), Cmp::Match);
        assert_eq!(ts.compare(a10, open), Cmp::Unmatch);
    }

    #[test]
    fn test_member_chain_order() {
        let mut ts = TypeSystem::new();
        let s = ts.structure_begin();
        ts.structure_add(s, Type::INT, Some("a")).unwrap();
        ts.structure_add(s, Type::REAL, Some("b")).unwrap();
        ts.structure_add(s, Type::POINT, Some("c")).unwrap();
        assert_eq!(ts.member_count(s), Ok(3));

        // The chain visits the members in insertion order, then loops back
        // to the structure
        let m1 = ts.member_next(s);
        let m2 = ts.member_next(m1);
        let m3 = ts.member_next(m2);
        assert_eq!(ts.member_get(m1).0, Type::INT);
        assert_eq!(ts.member_get(m2).0, Type::REAL);
        assert_eq!(ts.member_get(m3).0, Type::POINT);
        assert_eq!(ts.member_next(m3), s);
    }

    #[test]
    fn test_member_offsets_accumulate() {
        let mut ts = TypeSystem::new();
        let s = ts.structure_begin();
        ts.structure_add(s, Type::CHAR, Some("tag")).unwrap();
        ts.structure_add(s, Type::INT, Some("count")).unwrap();
        ts.structure_add(s, Type::POINT, Some("at")).unwrap();
        assert_eq!(ts.size(s), Some(1 + 8 + 16));

        let count = ts.member_find(s, "count").unwrap();
        assert_eq!(ts.member_get(count), (Type::INT, 1));
        let at = ts.member_find(s, "at").unwrap();
        assert_eq!(ts.member_get(at), (Type::POINT, 9));
        assert_eq!(ts.member_find(s, "missing"), None);
    }

    #[test]
    fn test_duplicate_member_name_fails() {
        let mut ts = TypeSystem::new();
        let s = ts.structure_begin();
        ts.structure_add(s, Type::INT, Some("x")).unwrap();
        assert!(matches!(
            ts.structure_add(s, Type::REAL, Some("x")),
            Err(TypeError::DuplicateMember { .. })
        ));
    }

    #[test]
    fn test_resolve_and_core_type() {
        let mut ts = TypeSystem::new();
        let s = two_real_struct(&mut ts, Some("x"), Some("y"));
        let alias = ts.alias_new(s);
        let alias2 = ts.alias_new(alias);
        assert_eq!(ts.core_type(alias2), s);
        // One step at a time
        assert_eq!(ts.resolve_once(alias2, ResolveSet::ALIAS), alias);

        let species = ts.species_begin();
        ts.species_add(species, Type::INT);
        ts.species_add(species, Type::REAL);
        assert_eq!(ts.core_type(species), Type::REAL);

        // Detached types only unwrap when asked to
        let det = ts.detached_new(s);
        assert_eq!(ts.resolve(det, ResolveSet::ALIAS), det);
        assert_eq!(ts.resolve(det, ResolveSet::DETACHED), s);

        // The ANONYMOUS filter stops at named wrappers
        ts.name_set(alias, "Named").unwrap();
        assert_eq!(
            ts.resolve(alias2, ResolveSet::ALIAS | ResolveSet::ANONYMOUS),
            alias
        );
    }

    #[test]
    fn test_name_get_composites() {
        let mut ts = TypeSystem::new();
        let s = ts.structure_begin();
        ts.structure_add(s, Type::REAL, Some("x")).unwrap();
        ts.structure_add(s, Type::REAL, Some("y")).unwrap();
        // Consecutive members of one type elide the repeated type name
        assert_eq!(ts.name_get(s), "(Real x, y)");

        let mixed = ts.structure_begin();
        ts.structure_add(mixed, Type::INT, Some("n")).unwrap();
        ts.structure_add(mixed, Type::REAL, Some("v")).unwrap();
        assert_eq!(ts.name_get(mixed), "(Int n, Real v)");

        let species = ts.species_begin();
        ts.species_add(species, Type::CHAR);
        ts.species_add(species, Type::INT);
        ts.species_add(species, Type::REAL);
        assert_eq!(ts.name_get(species), "(Char->Int->Real)");

        let en = ts.enum_begin();
        ts.enum_add(en, Type::INT);
        ts.enum_add(en, Type::REAL);
        assert_eq!(ts.name_get(en), "(Int|Real)");

        let a = ts.array_new(Type::INT, 10);
        assert_eq!(ts.name_get(a), "(10)Int");
        let open = ts.array_new(Type::INT, -1);
        assert_eq!(ts.name_get(open), "()Int");

        let det = ts.detached_new(Type::REAL);
        assert_eq!(ts.name_get(det), "++Real");
    }

    #[test]
    fn test_name_get_procedures_and_subtypes() {
        let mut ts = TypeSystem::new();
        let window = ts.intrinsic_new(32);
        ts.name_set(window, "Window").unwrap();

        let p1 = ts.procedure_new(window, Type::INT, ProcKind::FIRST_CALL);
        assert_eq!(ts.name_get(p1), "Int@Window");
        let p2 =
            ts.procedure_new(window, Type::INT, ProcKind::SUBSEQUENT_CALL);
        assert_eq!(ts.name_get(p2), "Int@@Window");
        let p3 = ts.procedure_new(window, Type::INT, ProcKind::SPECIAL);
        assert_eq!(ts.name_get(p3), "Int@&Window");

        let save = ts.subtype_new(window, "Save");
        assert_eq!(ts.name_get(save), "Window.Save");
    }

    #[test]
    fn test_procedure_search() {
        let mut ts = TypeSystem::new();
        let window = ts.intrinsic_new(32);
        ts.name_set(window, "Window").unwrap();

        let num = ts.species_begin();
        ts.species_add(num, Type::INT);
        ts.species_add(num, Type::REAL);

        let p_num = ts.procedure_new(window, num, ProcKind::FIRST_CALL);
        ts.procedure_register(p_num, 11);
        let p_char =
            ts.procedure_new(window, Type::CHAR, ProcKind::SUBSEQUENT_CALL);
        ts.procedure_register(p_char, 12);

        // Exact target: found, no expansion
        let (found, expansion) =
            ts.procedure_search(window, Type::REAL, ProcKind::FIRST_CALL);
        assert_eq!(found, Some(p_num));
        assert_eq!(expansion, None);

        // Smaller alternative: found, expansion to the species requested
        let (found, expansion) =
            ts.procedure_search(window, Type::INT, ProcKind::FIRST_CALL);
        assert_eq!(found, Some(p_num));
        assert_eq!(expansion, Some(num));

        // Kind bits must overlap
        let (found, _) =
            ts.procedure_search(window, Type::CHAR, ProcKind::FIRST_CALL);
        assert_eq!(found, None);
        let (found, _) =
            ts.procedure_search(window, Type::CHAR, ProcKind::SUBSEQUENT_CALL);
        assert_eq!(found, Some(p_char));

        assert_eq!(ts.procedure_sym_num(p_num), 11);
        let (parent, child, kind, _) = ts.procedure_info(p_char);
        assert_eq!(parent, window);
        assert_eq!(child, Type::CHAR);
        assert_eq!(kind, ProcKind::SUBSEQUENT_CALL);
    }

    #[test]
    fn test_procedure_inherited_search() {
        let mut ts = TypeSystem::new();
        let window = ts.intrinsic_new(32);
        let p = ts.procedure_new(window, Type::INT, ProcKind::FIRST_CALL);
        ts.procedure_register(p, 3);

        // The procedure is found through an alias of the parent
        let fancy = ts.alias_new(window);
        ts.name_set(fancy, "FancyWindow").unwrap();
        let (found, _) =
            ts.procedure_search(fancy, Type::INT, ProcKind::FIRST_CALL);
        assert_eq!(found, None);
        let (found, _) = ts.procedure_inherited_search(
            fancy,
            Type::INT,
            ProcKind::FIRST_CALL,
        );
        assert_eq!(found, Some(p));

        // Search terminates on unrelated types
        let (found, _) = ts.procedure_inherited_search(
            Type::CHAR,
            Type::INT,
            ProcKind::FIRST_CALL,
        );
        assert_eq!(found, None);
    }

    #[test]
    fn test_subtype_register_and_find() {
        let mut ts = TypeSystem::new();
        let window = ts.intrinsic_new(32);
        ts.name_set(window, "Window").unwrap();

        let save = ts.subtype_new(window, "Save");
        assert!(ts.subtype_find(window, "Save").is_none());
        ts.subtype_register(save, Type::VOID).unwrap();
        assert_eq!(ts.subtype_find(window, "Save"), Some(save));
        assert!(ts.subtype_find(window, "Load").is_none());

        assert_eq!(ts.subtype_parent(save), window);
        assert_eq!(ts.subtype_child(save), Type::VOID);
        // Subtype instances hold two pointers
        assert_eq!(ts.size(save), Some(16));
    }

    #[test]
    fn test_subtype_register_idempotence() {
        let mut ts = TypeSystem::new();
        let window = ts.intrinsic_new(32);

        let save = ts.subtype_new(window, "Save");
        ts.subtype_register(save, Type::VOID).unwrap();

        // A matching re-registration under the same name succeeds without
        // replacing the original...
        let again = ts.subtype_new(window, "Save");
        ts.subtype_register(again, Type::VOID).unwrap();
        assert_eq!(ts.subtype_find(window, "Save"), Some(save));

        // ...a conflicting one fails
        let conflict = ts.subtype_new(window, "Save");
        assert!(matches!(
            ts.subtype_register(conflict, Type::INT),
            Err(TypeError::SubtypeRedefinition(_))
        ));

        // And a registered handle cannot be redefined
        assert!(ts.subtype_register(save, Type::INT).is_err());
    }

    #[test]
    fn test_array_member() {
        let mut ts = TypeSystem::new();
        let a = ts.array_new(Type::REAL, 5);
        let alias = ts.alias_new(a);
        assert_eq!(ts.array_member(alias), Ok((Type::REAL, Some(5))));
        assert!(matches!(
            ts.array_member(Type::INT),
            Err(TypeError::NotAnArray(_))
        ));
    }

    #[test]
    fn test_check_compatible_renders_names() {
        let mut ts = TypeSystem::new();
        let t1 = two_real_struct(&mut ts, Some("x"), Some("y"));
        let t3 = ts.detached_new(t1);
        ts.name_set(t3, "Point2").unwrap();
        assert_eq!(ts.check_compatible(t1, t1), Ok(Cmp::Equal));
        assert_eq!(
            ts.check_compatible(t1, t3),
            Err(TypeError::Incompatible {
                left: "(Real x, y)".to_owned(),
                right: "Point2".to_owned(),
            })
        );
    }

    #[test]
    fn test_name_set_twice_fails() {
        let mut ts = TypeSystem::new();
        let t = ts.intrinsic_new(4);
        ts.name_set(t, "First").unwrap();
        assert!(matches!(
            ts.name_set(t, "Second"),
            Err(TypeError::NameAlreadySet { .. })
        ));
    }

    #[test]
    fn test_enum_size_tracks_largest_member() {
        let mut ts = TypeSystem::new();
        let en = ts.enum_begin();
        ts.enum_add(en, Type::CHAR);
        assert_eq!(ts.size(en), Some(1 + 8));
        ts.enum_add(en, Type::POINT);
        assert_eq!(ts.size(en), Some(16 + 8));
        ts.enum_add(en, Type::INT);
        assert_eq!(ts.size(en), Some(16 + 8));
    }
}
