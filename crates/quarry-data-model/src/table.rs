use crate::{
    ArrayDesc, CompositeDesc, Field, FloatDesc, IntDesc, Label, OpenArrayDesc, RefDesc, StringDesc,
    TypeDesc, TypeKind,
};

/// Stable handle into a [`TypeTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeRef(pub(crate) u32);

impl TypeRef {
    /// Raw arena index, for memo tables keyed on type identity.
    pub fn index(self) -> u32 {
        self.0
    }
}

bitflags::bitflags! {
    /// Loader bookkeeping bits kept beside each table entry.
    pub struct TypeEntryFlags: u8 {
        /// The loader has visited and structurally repaired this entry.
        const FIXED = 1 << 0;
        /// The loader could not reconcile this entry; its layout must not be
        /// trusted for direct reinterpretation.
        const DODGY = 1 << 1;
    }
}

struct TypeEntry {
    desc: TypeDesc,
    flags: TypeEntryFlags,
}

bitflags::bitflags! {
    /// Criteria relaxations for [`TypeTable::same_shape`].
    pub struct MatchCriteria: u32 {
        /// A null (absent) type on either side matches anything.
        const MATCH_NULLS = 1 << 0;
        /// A null type on the right-hand side matches anything.
        const MATCH_NULL_RHS = 1 << 1;
        /// Ignore 4-byte vs 8-byte slot width.
        const IGNORE_WIDTH = 1 << 2;
        /// Do not look through `User` aliases.
        const NO_USER_RECURSE = 1 << 3;
        /// Do not look through `User` aliases on the right-hand side.
        const NO_USER_RECURSE_RHS = 1 << 4;
        /// When both sides are `User`, compare by name only.
        const NO_USER_RECURSE_BOTH = 1 << 5;
        /// Ignore sign/fractional bits that only affect interpretation.
        const IGNORE_INTERPRETATION = 1 << 6;
    }
}

/// Handles of the pre-registered primitive types.
#[allow(missing_docs)]
pub struct Builtins {
    pub u8: TypeRef,
    pub i8: TypeRef,
    pub u16: TypeRef,
    pub i16: TypeRef,
    pub u32: TypeRef,
    pub i32: TypeRef,
    pub u64: TypeRef,
    pub i64: TypeRef,
    pub f32: TypeRef,
    pub f64: TypeRef,
    pub string: TypeRef,
}

/// Arena of type descriptors addressed by [`TypeRef`] handles.
///
/// Entry 0 is reserved so that a zero index can mean "no type" on the wire.
pub struct TypeTable {
    entries: Vec<TypeEntry>,
    builtins: Builtins,
}

const MAX_USER_HOPS: u32 = 32;

impl TypeTable {
    /// Creates a table with the primitive types pre-registered.
    pub fn new() -> Self {
        let mut entries = Vec::new();
        // reserved null entry
        entries.push(TypeEntry {
            desc: TypeDesc::Int(IntDesc::plain(8, false)),
            flags: TypeEntryFlags::empty(),
        });

        let mut add_entry = |desc: TypeDesc| {
            entries.push(TypeEntry {
                desc,
                flags: TypeEntryFlags::empty(),
            });
            TypeRef(entries.len() as u32 - 1)
        };

        let builtins = Builtins {
            u8: add_entry(TypeDesc::Int(IntDesc::plain(8, false))),
            i8: add_entry(TypeDesc::Int(IntDesc::plain(8, true))),
            u16: add_entry(TypeDesc::Int(IntDesc::plain(16, false))),
            i16: add_entry(TypeDesc::Int(IntDesc::plain(16, true))),
            u32: add_entry(TypeDesc::Int(IntDesc::plain(32, false))),
            i32: add_entry(TypeDesc::Int(IntDesc::plain(32, true))),
            u64: add_entry(TypeDesc::Int(IntDesc::plain(64, false))),
            i64: add_entry(TypeDesc::Int(IntDesc::plain(64, true))),
            f32: add_entry(TypeDesc::Float(FloatDesc::f32())),
            f64: add_entry(TypeDesc::Float(FloatDesc::f64())),
            string: add_entry(TypeDesc::String(StringDesc::narrow())),
        };

        Self { entries, builtins }
    }

    /// The pre-registered primitive handles.
    pub fn builtin(&self) -> &Builtins {
        &self.builtins
    }

    /// Adds a descriptor, returning its handle.
    pub fn add(&mut self, desc: TypeDesc) -> TypeRef {
        self.entries.push(TypeEntry {
            desc,
            flags: TypeEntryFlags::empty(),
        });
        TypeRef(self.entries.len() as u32 - 1)
    }

    /// The descriptor behind a handle.
    pub fn get(&self, t: TypeRef) -> &TypeDesc {
        &self.entries[t.0 as usize].desc
    }

    /// Mutable access to a descriptor (used to resolve `User` aliases).
    pub fn get_mut(&mut self, t: TypeRef) -> &mut TypeDesc {
        &mut self.entries[t.0 as usize].desc
    }

    /// Loader bookkeeping flags of an entry.
    pub fn entry_flags(&self, t: TypeRef) -> TypeEntryFlags {
        self.entries[t.0 as usize].flags
    }

    /// Sets loader bookkeeping flags on an entry.
    pub fn set_entry_flags(&mut self, t: TypeRef, flags: TypeEntryFlags) {
        self.entries[t.0 as usize].flags |= flags;
    }

    /// Whether the loader marked this entry unreconcilable.
    pub fn is_dodgy(&self, t: TypeRef) -> bool {
        self.entries[t.0 as usize]
            .flags
            .contains(TypeEntryFlags::DODGY)
    }

    /// The discriminant of a (possibly absent) type.
    pub fn kind_of(&self, t: TypeRef) -> TypeKind {
        self.get(t).kind()
    }

    /// Follows `User` aliases down to a concrete descriptor. Returns `None`
    /// when the chain ends in an unresolved alias.
    pub fn skip_user(&self, t: TypeRef) -> Option<TypeRef> {
        let mut current = t;
        for _ in 0..MAX_USER_HOPS {
            match self.get(current) {
                TypeDesc::User(user) => current = user.aliased?,
                _ => return Some(current),
            }
        }
        None
    }

    /// The element/aliased type one level down, if any.
    pub fn sub_type(&self, t: TypeRef) -> Option<TypeRef> {
        match self.get(t) {
            TypeDesc::Array(array) => Some(array.element),
            TypeDesc::OpenArray(array) => Some(array.element),
            TypeDesc::Reference(reference) => reference.element,
            TypeDesc::User(user) => user.aliased,
            _ => None,
        }
    }

    /// Payload size in bytes of a value of this type.
    pub fn size_of(&self, t: TypeRef) -> u32 {
        match self.get(t) {
            TypeDesc::Int(int) => int.size(),
            TypeDesc::Float(float) => float.size(),
            TypeDesc::String(string) => string.slot_size(),
            TypeDesc::Composite(composite) => composite.size,
            TypeDesc::Array(array) => array.stride * array.count,
            TypeDesc::OpenArray(array) => array.slot_size(),
            TypeDesc::Reference(reference) => reference.slot_size(),
            TypeDesc::User(user) => user.aliased.map_or(0, |aliased| self.size_of(aliased)),
            TypeDesc::Virtual(virt) => virt.size,
        }
    }

    /// Alignment in bytes of a value of this type.
    pub fn align_of(&self, t: TypeRef) -> u32 {
        match self.get(t) {
            TypeDesc::Int(int) => int.size(),
            TypeDesc::Float(float) => float.size(),
            TypeDesc::String(string) => string.slot_size(),
            TypeDesc::Composite(composite) => composite.align,
            TypeDesc::Array(array) => self.align_of(array.element),
            TypeDesc::OpenArray(array) => array.slot_size(),
            TypeDesc::Reference(reference) => reference.slot_size(),
            TypeDesc::User(user) => user.aliased.map_or(1, |aliased| self.align_of(aliased)),
            TypeDesc::Virtual(_) => 4,
        }
    }

    /// Whether a value of this type is a raw run of bytes with no out-of-line
    /// data. With `flip` set, scalars wider than one byte also disqualify the
    /// type, since each leaf would need an individual byte swap.
    pub fn is_plain_data(&self, t: TypeRef, flip: bool) -> bool {
        self.plain_inner(t, flip, &mut Vec::new())
    }

    fn plain_inner(&self, t: TypeRef, flip: bool, seen: &mut Vec<u32>) -> bool {
        if seen.contains(&t.0) {
            return false;
        }
        seen.push(t.0);
        let plain = match self.get(t) {
            TypeDesc::Int(int) => !flip || int.size() == 1,
            TypeDesc::Float(float) => !flip || float.size() == 1,
            TypeDesc::String(_)
            | TypeDesc::OpenArray(_)
            | TypeDesc::Reference(_)
            | TypeDesc::Virtual(_) => false,
            TypeDesc::Composite(composite) => composite
                .fields
                .iter()
                .all(|field| self.plain_inner(field.ty, flip, seen)),
            TypeDesc::Array(array) => self.plain_inner(array.element, flip, seen),
            TypeDesc::User(user) => user
                .aliased
                .map_or(false, |aliased| self.plain_inner(aliased, flip, seen)),
        };
        seen.pop();
        plain
    }

    /// Whether a value of this type can own references to other objects.
    pub fn contains_references(&self, t: TypeRef) -> bool {
        self.contains_refs_inner(t, &mut Vec::new())
    }

    fn contains_refs_inner(&self, t: TypeRef, seen: &mut Vec<u32>) -> bool {
        if seen.contains(&t.0) {
            return false;
        }
        seen.push(t.0);
        let found = match self.get(t) {
            TypeDesc::Reference(_) | TypeDesc::Virtual(_) => true,
            TypeDesc::Composite(composite) => composite
                .fields
                .iter()
                .any(|field| self.contains_refs_inner(field.ty, seen)),
            TypeDesc::Array(array) => self.contains_refs_inner(array.element, seen),
            TypeDesc::OpenArray(array) => self.contains_refs_inner(array.element, seen),
            TypeDesc::User(user) => user
                .aliased
                .map_or(false, |aliased| self.contains_refs_inner(aliased, seen)),
            _ => false,
        };
        seen.pop();
        found
    }

    /// Structural equality of two (possibly absent) types, ignoring naming
    /// unless a `NO_USER_RECURSE*` criterion forbids looking through aliases.
    pub fn same_shape(
        &self,
        a: Option<TypeRef>,
        b: Option<TypeRef>,
        criteria: MatchCriteria,
    ) -> bool {
        self.same_inner(a, b, criteria, &mut Vec::new())
    }

    fn same_inner(
        &self,
        a: Option<TypeRef>,
        b: Option<TypeRef>,
        criteria: MatchCriteria,
        seen: &mut Vec<(u32, u32)>,
    ) -> bool {
        let (a, b) = match (a, b) {
            (None, None) => return true,
            (None, Some(_)) => return criteria.contains(MatchCriteria::MATCH_NULLS),
            (Some(_), None) => {
                return criteria
                    .intersects(MatchCriteria::MATCH_NULLS | MatchCriteria::MATCH_NULL_RHS)
            }
            (Some(a), Some(b)) => (a, b),
        };

        if a == b {
            return true;
        }
        // cycles through User nodes compare equal once revisited
        if seen.contains(&(a.0, b.0)) {
            return true;
        }
        seen.push((a.0, b.0));
        let same = self.same_descs(a, b, criteria, seen);
        seen.pop();
        same
    }

    fn same_descs(
        &self,
        a: TypeRef,
        b: TypeRef,
        criteria: MatchCriteria,
        seen: &mut Vec<(u32, u32)>,
    ) -> bool {
        match (self.get(a), self.get(b)) {
            (TypeDesc::User(ua), TypeDesc::User(ub)) => {
                if ua.name == ub.name {
                    return true;
                }
                if criteria.intersects(
                    MatchCriteria::NO_USER_RECURSE_BOTH | MatchCriteria::NO_USER_RECURSE,
                ) {
                    return false;
                }
                self.same_inner(ua.aliased, ub.aliased, criteria, seen)
            }
            (TypeDesc::User(ua), _) => {
                if criteria.contains(MatchCriteria::NO_USER_RECURSE) {
                    return false;
                }
                self.same_inner(ua.aliased, Some(b), criteria, seen)
            }
            (_, TypeDesc::User(ub)) => {
                if criteria
                    .intersects(MatchCriteria::NO_USER_RECURSE | MatchCriteria::NO_USER_RECURSE_RHS)
                {
                    return false;
                }
                self.same_inner(Some(a), ub.aliased, criteria, seen)
            }
            (TypeDesc::Int(ia), TypeDesc::Int(ib)) => {
                ia.bits == ib.bits
                    && (criteria.contains(MatchCriteria::IGNORE_INTERPRETATION)
                        || (ia.signed == ib.signed && ia.frac_bits == ib.frac_bits))
            }
            (TypeDesc::Float(fa), TypeDesc::Float(fb)) => {
                fa.bits == fb.bits
                    && (criteria.contains(MatchCriteria::IGNORE_INTERPRETATION)
                        || (fa.signed == fb.signed && fa.exponent_bits == fb.exponent_bits))
            }
            (TypeDesc::String(sa), TypeDesc::String(sb)) => {
                sa.char_size == sb.char_size
                    && (criteria.contains(MatchCriteria::IGNORE_WIDTH) || sa.wide == sb.wide)
            }
            (TypeDesc::Composite(ca), TypeDesc::Composite(cb)) => {
                ca.fields.len() == cb.fields.len()
                    && ca
                        .fields
                        .iter()
                        .zip(&cb.fields)
                        .all(|(field_a, field_b)| {
                            field_a.id == field_b.id
                                && field_a.offset == field_b.offset
                                && field_a.size == field_b.size
                                && self.same_inner(
                                    Some(field_a.ty),
                                    Some(field_b.ty),
                                    criteria,
                                    seen,
                                )
                        })
            }
            (TypeDesc::Array(aa), TypeDesc::Array(ab)) => {
                aa.count == ab.count
                    && aa.stride == ab.stride
                    && self.same_inner(Some(aa.element), Some(ab.element), criteria, seen)
            }
            (TypeDesc::OpenArray(oa), TypeDesc::OpenArray(ob)) => {
                oa.stride == ob.stride
                    && (criteria.contains(MatchCriteria::IGNORE_WIDTH) || oa.wide == ob.wide)
                    && self.same_inner(Some(oa.element), Some(ob.element), criteria, seen)
            }
            (TypeDesc::Reference(ra), TypeDesc::Reference(rb)) => {
                (criteria.contains(MatchCriteria::IGNORE_WIDTH) || ra.wide == rb.wide)
                    && self.same_inner(ra.element, rb.element, criteria, seen)
            }
            // virtuals only ever equal themselves, which was handled above
            _ => false,
        }
    }

    /// Builds an [`ArrayDesc`] with the stride implied by the element type.
    pub fn array_of(&mut self, element: TypeRef, count: u32) -> TypeRef {
        let stride = align_up(self.size_of(element), self.align_of(element).max(1));
        self.add(TypeDesc::Array(ArrayDesc {
            element,
            count,
            stride,
        }))
    }

    /// Builds an [`OpenArrayDesc`] with the stride implied by the element type.
    pub fn open_array_of(&mut self, element: TypeRef) -> TypeRef {
        let stride = align_up(self.size_of(element), self.align_of(element).max(1));
        self.add(TypeDesc::OpenArray(OpenArrayDesc {
            element,
            stride,
            wide: false,
        }))
    }

    /// Builds a typed [`RefDesc`].
    pub fn reference_to(&mut self, element: TypeRef) -> TypeRef {
        self.add(TypeDesc::Reference(RefDesc::to(element)))
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Rounds `value` up to a multiple of `align` (which must be a power of two).
pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Incrementally lays out a [`CompositeDesc`], assigning each field the next
/// offset aligned for its type.
pub struct CompositeBuilder {
    fields: Vec<Field>,
    size: u32,
    align: u32,
}

impl CompositeBuilder {
    /// Starts an empty layout.
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            size: 0,
            align: 1,
        }
    }

    /// Appends a named field at the next aligned offset.
    pub fn field(mut self, table: &TypeTable, id: impl Into<Label>, ty: TypeRef) -> Self {
        self.push(table, Some(id.into()), ty);
        self
    }

    /// Appends an anonymous (positional) field at the next aligned offset.
    pub fn anon_field(mut self, table: &TypeTable, ty: TypeRef) -> Self {
        self.push(table, None, ty);
        self
    }

    fn push(&mut self, table: &TypeTable, id: Option<Label>, ty: TypeRef) {
        let align = table.align_of(ty).max(1);
        let size = table.size_of(ty);
        let offset = align_up(self.size, align);
        self.fields.push(Field {
            id,
            ty,
            offset,
            size,
        });
        self.size = offset + size;
        self.align = self.align.max(align);
    }

    /// Finishes the layout. Total size is the maximum field extent.
    pub fn build(self) -> CompositeDesc {
        CompositeDesc {
            fields: self.fields,
            size: self.size,
            align: self.align,
            defaults: None,
        }
    }

    /// Finishes the layout with a defaults template.
    pub fn build_with_defaults(self, defaults: Vec<u8>) -> CompositeDesc {
        let mut desc = self.build();
        debug_assert_eq!(defaults.len() as u32, desc.size);
        desc.defaults = Some(defaults);
        desc
    }
}

impl Default for CompositeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_aligns_fields() {
        let table = TypeTable::new();
        let b = table.builtin();
        let desc = CompositeBuilder::new()
            .field(&table, "flag", b.u8)
            .field(&table, "count", b.u32)
            .field(&table, "scale", b.f32)
            .build();
        assert_eq!(desc.fields[0].offset, 0);
        assert_eq!(desc.fields[1].offset, 4);
        assert_eq!(desc.fields[2].offset, 8);
        assert_eq!(desc.size, 12);
        assert_eq!(desc.align, 4);
    }

    #[test]
    fn recursive_user_type_has_finite_shape_check() {
        let mut table = TypeTable::new();
        let node = table.add(TypeDesc::User(crate::UserDesc {
            name: Label::text("node"),
            aliased: None,
            flags: crate::UserFlags::WRITE_TO_BIN,
            init: None,
        }));
        let next = table.reference_to(node);
        let b = table.builtin();
        let payload = CompositeBuilder::new()
            .field(&table, "value", b.i32)
            .field(&table, "next", next)
            .build();
        let payload = table.add(TypeDesc::Composite(payload));
        match table.get_mut(node) {
            TypeDesc::User(user) => user.aliased = Some(payload),
            _ => unreachable!(),
        }

        assert!(table.same_shape(Some(node), Some(node), MatchCriteria::empty()));
        assert_eq!(table.size_of(node), 8);
        assert!(table.contains_references(node));
        assert!(!table.is_plain_data(node, false));
    }

    #[test]
    fn plain_data_depends_on_flip() {
        let mut table = TypeTable::new();
        let byte_t = table.builtin().u8;
        let word_t = table.builtin().u32;
        let bytes = table.array_of(byte_t, 16);
        let words = table.array_of(word_t, 4);
        assert!(table.is_plain_data(bytes, true));
        assert!(table.is_plain_data(words, false));
        assert!(!table.is_plain_data(words, true));
    }
}
