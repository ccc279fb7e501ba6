use std::fmt;
use std::sync::Arc;

use crate::{Label, ObjRef, RuntimeContext, TypeRef};

/// Discriminant of a [`TypeDesc`], used by the converter's dispatch table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Fixed-point/enum-capable integer.
    Int,
    /// Binary floating point.
    Float,
    /// Pointer to null-terminated text.
    String,
    /// Struct with named or positional fields.
    Composite,
    /// Fixed-length inline array.
    Array,
    /// Length-prefixed, heap-allocated array.
    OpenArray,
    /// Typed slot holding a managed pointer to another object.
    Reference,
    /// Named, registered alias; the only way type graphs may cycle.
    User,
    /// Computed/polymorphic storage behind callbacks.
    Virtual,
}

/// A named enum value carried by an enum-capable [`IntDesc`].
#[derive(Clone, Debug, PartialEq)]
pub struct EnumValue {
    /// Name of the value.
    pub id: Label,
    /// The value itself, widened to 64 bits.
    pub value: u64,
}

/// Fixed-point/enum-capable integer descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct IntDesc {
    /// Storage width in bits (8, 16, 32 or 64).
    pub bits: u8,
    /// Number of fractional bits; the stored value is `real * 2^frac_bits`.
    pub frac_bits: u8,
    /// Two's-complement interpretation when set.
    pub signed: bool,
    /// Optional named values, making this an enum type.
    pub enums: Option<Vec<EnumValue>>,
}

impl IntDesc {
    /// Plain integer of the given width.
    pub fn plain(bits: u8, signed: bool) -> Self {
        Self {
            bits,
            frac_bits: 0,
            signed,
            enums: None,
        }
    }

    /// Storage size in bytes.
    pub fn size(&self) -> u32 {
        u32::from(self.bits + 7) / 8
    }

    /// Largest representable value, as an unsigned quantity.
    pub fn max_value(&self) -> u64 {
        let value_bits = u32::from(self.bits) - u32::from(self.signed);
        if value_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << value_bits) - 1
        }
    }

    /// Smallest representable value (0 for unsigned).
    pub fn min_value(&self) -> i64 {
        if !self.signed {
            0
        } else if self.bits >= 64 {
            i64::MIN
        } else {
            -(1i64 << (self.bits - 1))
        }
    }
}

/// Binary floating point descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct FloatDesc {
    /// Storage width in bits; conversion math covers 32 and 64.
    pub bits: u8,
    /// Width of the exponent field.
    pub exponent_bits: u8,
    /// Whether a sign bit is present.
    pub signed: bool,
}

impl FloatDesc {
    /// IEEE single precision.
    pub fn f32() -> Self {
        Self {
            bits: 32,
            exponent_bits: 8,
            signed: true,
        }
    }

    /// IEEE double precision.
    pub fn f64() -> Self {
        Self {
            bits: 64,
            exponent_bits: 11,
            signed: true,
        }
    }

    /// Storage size in bytes.
    pub fn size(&self) -> u32 {
        u32::from(self.bits + 7) / 8
    }

    /// Width of the mantissa field.
    pub fn mantissa_bits(&self) -> u8 {
        self.bits - self.exponent_bits - u8::from(self.signed)
    }

    /// Largest finite value representable under this descriptor.
    pub fn max_value(&self) -> f64 {
        let mantissa = u32::from(self.mantissa_bits()).min(52);
        let exponent = u32::from(self.exponent_bits).min(11).max(1);
        let frac = 2.0 - 2.0f64.powi(-(mantissa as i32));
        let emax = (1i32 << (exponent - 1)) - 1;
        frac * 2.0f64.powi(emax)
    }

    /// Smallest value representable under this descriptor (0 if unsigned).
    pub fn min_value(&self) -> f64 {
        if self.signed {
            -self.max_value()
        } else {
            0.0
        }
    }
}

/// Pointer-to-null-terminated-text descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct StringDesc {
    /// Size of one code unit in bytes (1, 2, 4 or 8).
    pub char_size: u8,
    /// Whether the slot (and wire offset) is 8 bytes instead of 4.
    pub wide: bool,
}

impl StringDesc {
    /// Narrow (utf-8 style) string with 4-byte slots.
    pub fn narrow() -> Self {
        Self {
            char_size: 1,
            wide: false,
        }
    }

    /// Slot size in bytes.
    pub fn slot_size(&self) -> u32 {
        if self.wide {
            8
        } else {
            4
        }
    }
}

/// One field of a [`CompositeDesc`].
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    /// Field name; `None` for anonymous/positional fields.
    pub id: Option<Label>,
    /// Field type.
    pub ty: TypeRef,
    /// Byte offset inside the composite payload.
    pub offset: u32,
    /// Byte size of the field.
    pub size: u32,
}

/// Struct descriptor: ordered fields, total size = max field extent.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositeDesc {
    /// Fields in insertion order.
    pub fields: Vec<Field>,
    /// Total payload size in bytes.
    pub size: u32,
    /// Alignment of the composite.
    pub align: u32,
    /// Optional template establishing defaults for fields absent from a
    /// conversion source. Must be exactly `size` bytes when present.
    pub defaults: Option<Vec<u8>>,
}

impl CompositeDesc {
    /// Finds a field by name.
    pub fn find(&self, id: &Label) -> Option<&Field> {
        self.fields
            .iter()
            .find(|field| field.id.as_ref() == Some(id))
    }
}

/// Fixed-length inline array descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayDesc {
    /// Element type.
    pub element: TypeRef,
    /// Element count.
    pub count: u32,
    /// Distance between consecutive elements in bytes.
    pub stride: u32,
}

/// Length-prefixed, heap-allocated, resizable array descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenArrayDesc {
    /// Element type.
    pub element: TypeRef,
    /// Distance between consecutive elements in bytes.
    pub stride: u32,
    /// Whether the slot (and wire offset) is 8 bytes instead of 4.
    pub wide: bool,
}

impl OpenArrayDesc {
    /// Slot size in bytes.
    pub fn slot_size(&self) -> u32 {
        if self.wide {
            8
        } else {
            4
        }
    }
}

/// Typed slot holding a managed pointer to another object.
#[derive(Clone, Debug, PartialEq)]
pub struct RefDesc {
    /// Expected pointee type; `None` means dynamically typed.
    pub element: Option<TypeRef>,
    /// Whether the slot (and wire offset) is 8 bytes instead of 4.
    pub wide: bool,
}

impl RefDesc {
    /// Dynamically-typed reference with 4-byte slots.
    pub fn untyped() -> Self {
        Self {
            element: None,
            wide: false,
        }
    }

    /// Reference to `element` with 4-byte slots.
    pub fn to(element: TypeRef) -> Self {
        Self {
            element: Some(element),
            wide: false,
        }
    }

    /// Slot size in bytes.
    pub fn slot_size(&self) -> u32 {
        if self.wide {
            8
        } else {
            4
        }
    }
}

bitflags::bitflags! {
    /// Behavior flags carried by a [`UserDesc`].
    pub struct UserFlags: u16 {
        /// Objects of this type are re-converted when loaded.
        const CHANGE = 1 << 0;
        /// Eligible for external-file storage when writing.
        const WRITE_TO_BIN = 1 << 1;
        /// Defined dynamically by a loaded container rather than built in.
        const FROM_FILE = 1 << 2;
    }
}

/// Post-construction hook of an init-callback user type. Receives the freshly
/// converted payload bytes and the physical region of the load, if any.
pub type InitFn = Arc<dyn Fn(&mut [u8], Option<&[u8]>)>;

/// Named, registered alias descriptor; the `User` break that makes recursive
/// type graphs expressible without infinite descriptor expansion.
#[derive(Clone)]
pub struct UserDesc {
    /// Registered name.
    pub name: Label,
    /// Aliased type; `None` until resolved against the registry.
    pub aliased: Option<TypeRef>,
    /// Behavior flags.
    pub flags: UserFlags,
    /// Optional post-construction hook run after conversion into this type.
    pub init: Option<InitFn>,
}

impl UserDesc {
    /// Plain named alias with no flags or callbacks.
    pub fn named(name: impl Into<Label>, aliased: TypeRef) -> Self {
        Self {
            name: name.into(),
            aliased: Some(aliased),
            flags: UserFlags::WRITE_TO_BIN,
            init: None,
        }
    }
}

impl fmt::Debug for UserDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDesc")
            .field("name", &self.name)
            .field("aliased", &self.aliased)
            .field("flags", &self.flags)
            .field("init", &self.init.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Callbacks giving a [`VirtualDesc`] its behavior.
pub trait VirtualOps {
    /// Resolves the polymorphic slot to a concrete object, if possible.
    fn deref(&self, ctx: &mut RuntimeContext, data: &[u8]) -> Option<ObjRef>;

    /// Converts `src` (of type `src_ty`) into this virtual type's storage.
    /// Returns false when the pairing is not supported.
    fn convert(
        &self,
        ctx: &mut RuntimeContext,
        dst: &mut [u8],
        src_ty: Option<TypeRef>,
        src: &[u8],
    ) -> bool;
}

/// Computed/polymorphic storage descriptor.
#[derive(Clone)]
pub struct VirtualDesc {
    /// Declared slot size in bytes.
    pub size: u32,
    /// Behavior callbacks.
    pub ops: Arc<dyn VirtualOps>,
}

impl fmt::Debug for VirtualDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDesc")
            .field("size", &self.size)
            .finish()
    }
}

/// The closed set of type descriptors.
///
/// A type graph built from these is acyclic except through [`User`] nodes,
/// which reference other entries by handle and so can close cycles without
/// expanding forever.
///
/// [`User`]: TypeDesc::User
#[derive(Clone, Debug)]
pub enum TypeDesc {
    /// See [`IntDesc`].
    Int(IntDesc),
    /// See [`FloatDesc`].
    Float(FloatDesc),
    /// See [`StringDesc`].
    String(StringDesc),
    /// See [`CompositeDesc`].
    Composite(CompositeDesc),
    /// See [`ArrayDesc`].
    Array(ArrayDesc),
    /// See [`OpenArrayDesc`].
    OpenArray(OpenArrayDesc),
    /// See [`RefDesc`].
    Reference(RefDesc),
    /// See [`UserDesc`].
    User(UserDesc),
    /// See [`VirtualDesc`].
    Virtual(VirtualDesc),
}

impl TypeDesc {
    /// This descriptor's discriminant.
    pub fn kind(&self) -> TypeKind {
        match self {
            Self::Int(_) => TypeKind::Int,
            Self::Float(_) => TypeKind::Float,
            Self::String(_) => TypeKind::String,
            Self::Composite(_) => TypeKind::Composite,
            Self::Array(_) => TypeKind::Array,
            Self::OpenArray(_) => TypeKind::OpenArray,
            Self::Reference(_) => TypeKind::Reference,
            Self::User(_) => TypeKind::User,
            Self::Virtual(_) => TypeKind::Virtual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_bounds() {
        let i8_desc = IntDesc::plain(8, true);
        assert_eq!(i8_desc.min_value(), -128);
        assert_eq!(i8_desc.max_value(), 127);

        let u16_desc = IntDesc::plain(16, false);
        assert_eq!(u16_desc.min_value(), 0);
        assert_eq!(u16_desc.max_value(), 65535);

        let u64_desc = IntDesc::plain(64, false);
        assert_eq!(u64_desc.max_value(), u64::MAX);
    }

    #[test]
    fn float_bounds_match_ieee() {
        let single = FloatDesc::f32();
        assert_eq!(single.mantissa_bits(), 23);
        assert!((single.max_value() - f64::from(f32::MAX)).abs() < 1e22);
        assert!(single.min_value() < 0.0);
    }
}
