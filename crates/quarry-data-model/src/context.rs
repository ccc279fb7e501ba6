use std::sync::Arc;

use log::warn;
use quarry_utils::StableHashMap;

use crate::{
    BufRef, Label, ModelError, ObjRef, ObjectArena, ObjectHeader, OpenArrayBuf, SideArena, StrRef,
    TypeDesc, TypeRef, TypeSlot, TypeTable, ValueFlags,
};

bitflags::bitflags! {
    /// Flags steering the graph-level `convert` dispatcher.
    pub struct ConvertFlags: u32 {
        /// Permit plugin matching on the result type, not just exact type.
        const RECURSE = 1 << 0;
        /// Deep-walk the object before any top-level transform.
        const CHECK_INSIDE = 1 << 1;
        /// Like `CHECK_INSIDE`, but also rebuilds plain containers.
        const FULL_CHECK = 1 << 2;
        /// Externally-backed objects pass through untouched.
        const ALLOW_EXTERNALS = 1 << 3;
        /// Externally-backed objects are eagerly loaded.
        const EXPAND_EXTERNALS = 1 << 4;
        /// Force 32-bit slot width for produced data.
        const MEMORY32 = 1 << 5;
        /// Plugin pass asking for change-on-load expansion of a user type.
        const CHANGE = 1 << 6;
    }
}

/// A registered converter plugin: "if the source looks like X, produce Y".
///
/// Plugins are consulted in registration order; the first one returning
/// `Some` wins.
pub trait Converter {
    /// Attempts the transform. Returning `None` passes to the next plugin.
    fn try_convert(
        &self,
        ctx: &mut RuntimeContext,
        obj: ObjRef,
        target: Option<TypeRef>,
        flags: ConvertFlags,
    ) -> Option<ObjRef>;
}

/// The seam where file-format handlers resolve externally-backed objects.
pub trait ExternalResolver {
    /// Loads the object stored at `path`, or `None` if it cannot be read.
    fn read_external(&self, ctx: &mut RuntimeContext, path: &str) -> Option<ObjRef>;
}

/// Owns every registry and arena the engine touches: the type table, the
/// object graph, string/open-array heaps, the named-type registry, the
/// converter plugin list and the external-resolution seam.
///
/// All API calls take the context explicitly; two contexts never share
/// state, which makes the engine multi-instance and testable in isolation.
pub struct RuntimeContext {
    /// Type descriptor arena.
    pub types: TypeTable,
    /// Managed object arena.
    pub objects: ObjectArena,
    strings: SideArena<Vec<u8>>,
    buffers: SideArena<OpenArrayBuf>,
    registry: StableHashMap<u32, TypeRef>,
    converters: Vec<Arc<dyn Converter>>,
    resolver: Option<Arc<dyn ExternalResolver>>,
    /// Separately-managed physical region of the most recent load, if any.
    pub physical: Option<Vec<u8>>,
}

impl RuntimeContext {
    /// Creates an empty context with the primitive types pre-registered.
    pub fn new() -> Self {
        Self {
            types: TypeTable::new(),
            objects: ObjectArena::new(),
            strings: SideArena::new(),
            buffers: SideArena::new(),
            registry: StableHashMap::default(),
            converters: Vec::new(),
            resolver: None,
            physical: None,
        }
    }

    // ---- objects ----------------------------------------------------------

    /// Allocates an object with a zeroed payload sized by its type.
    pub fn alloc_object(&mut self, ty: TypeSlot, id: Option<Label>, flags: ValueFlags) -> ObjRef {
        let size = match ty {
            TypeSlot::Type(t) => self.types.size_of(t) as usize,
            _ => 0,
        };
        self.alloc_with_payload(ty, id, flags, vec![0; size])
    }

    /// Allocates an object around an existing payload.
    pub fn alloc_with_payload(
        &mut self,
        ty: TypeSlot,
        id: Option<Label>,
        flags: ValueFlags,
        payload: Vec<u8>,
    ) -> ObjRef {
        self.objects.insert(
            ObjectHeader {
                ty,
                id,
                flags,
                ref_count: 1,
            },
            payload,
        )
    }

    /// Allocates an externally-backed placeholder whose payload is `path`.
    pub fn alloc_external(
        &mut self,
        ty: TypeSlot,
        path: &str,
        id: Option<Label>,
    ) -> ObjRef {
        let path_ref = self.new_string(path.as_bytes().to_vec());
        let mut payload = vec![0; 4];
        crate::scalar::write_slot(&mut payload, 0, false, path_ref.index());
        self.alloc_with_payload(ty, id, ValueFlags::EXTERNAL, payload)
    }

    /// The path of an externally-backed object.
    pub fn external_path(&self, obj: ObjRef) -> Option<String> {
        if !self.objects.header(obj).flags.contains(ValueFlags::EXTERNAL) {
            return None;
        }
        let slot = crate::scalar::read_slot(self.objects.payload(obj), 0, false);
        let path_ref = StrRef::from_index(slot)?;
        String::from_utf8(self.string_bytes(path_ref).to_vec()).ok()
    }

    /// Adds a handle to an object.
    pub fn retain(&mut self, obj: ObjRef) {
        self.objects.header_mut(obj).ref_count += 1;
    }

    /// Drops a handle, destroying the object (and releasing everything it
    /// owns, recursively) when the count reaches zero.
    pub fn release(&mut self, obj: ObjRef) {
        crate::graph::release(self, obj);
    }

    /// The resolved type of an object, if it has one.
    pub fn obj_type(&self, obj: ObjRef) -> Option<TypeRef> {
        self.objects.header(obj).ty.type_ref()
    }

    /// A copy of the object's payload bytes.
    pub fn payload_copy(&self, obj: ObjRef) -> Vec<u8> {
        self.objects.payload(obj).to_vec()
    }

    // ---- strings & buffers ------------------------------------------------

    /// Stores an owned string buffer (raw code units, no terminator).
    pub fn new_string(&mut self, units: Vec<u8>) -> StrRef {
        StrRef(self.strings.insert(units))
    }

    /// The code units of a string buffer.
    pub fn string_bytes(&self, s: StrRef) -> &[u8] {
        self.strings.get(s.index())
    }

    /// The string as text, for narrow single-byte strings.
    pub fn string_text(&self, s: StrRef) -> Result<String, ModelError> {
        Ok(String::from_utf8(self.string_bytes(s).to_vec())?)
    }

    /// Frees a string buffer.
    pub fn free_string(&mut self, s: StrRef) {
        self.strings.remove(s.index());
    }

    /// Whether a string handle is live.
    pub fn string_is_live(&self, s: StrRef) -> bool {
        self.strings.contains(s.index())
    }

    /// Stores an owned open-array buffer.
    pub fn new_buffer(&mut self, buf: OpenArrayBuf) -> BufRef {
        BufRef(self.buffers.insert(buf))
    }

    /// An open-array buffer.
    pub fn buffer(&self, b: BufRef) -> &OpenArrayBuf {
        self.buffers.get(b.index())
    }

    /// Mutable open-array buffer access.
    pub fn buffer_mut(&mut self, b: BufRef) -> &mut OpenArrayBuf {
        self.buffers.get_mut(b.index())
    }

    /// Frees an open-array buffer.
    pub fn free_buffer(&mut self, b: BufRef) {
        self.buffers.remove(b.index());
    }

    // ---- named-type registry ----------------------------------------------

    /// Registers a `User` descriptor under its name. If the name is already
    /// taken the existing registration wins and is returned.
    pub fn register_user(&mut self, t: TypeRef) -> TypeRef {
        let name = match self.types.get(t) {
            TypeDesc::User(user) => user.name.clone(),
            other => {
                warn!("attempted to register non-user type {:?}", other.kind());
                return t;
            }
        };
        let crc = name.crc();
        if let Some(&existing) = self.registry.get(&crc) {
            if existing != t {
                warn!("named type '{}' already registered; keeping first", name);
            }
            existing
        } else {
            self.registry.insert(crc, t);
            t
        }
    }

    /// Looks up a registered named type.
    pub fn find_user(&self, name: &Label) -> Option<TypeRef> {
        self.find_user_crc(name.crc())
    }

    /// Looks up a registered named type by name CRC.
    pub fn find_user_crc(&self, crc: u32) -> Option<TypeRef> {
        self.registry.get(&crc).copied()
    }

    // ---- converter plugins -------------------------------------------------

    /// Appends a converter plugin. Order of registration is match order.
    pub fn register_converter(&mut self, converter: Arc<dyn Converter>) {
        self.converters.push(converter);
    }

    /// A snapshot of the plugin list, cheap to iterate while the context is
    /// mutably borrowed by the plugins themselves.
    pub fn converters(&self) -> Vec<Arc<dyn Converter>> {
        self.converters.clone()
    }

    // ---- external seam -----------------------------------------------------

    /// Installs the external-file resolver.
    pub fn set_resolver(&mut self, resolver: Arc<dyn ExternalResolver>) {
        self.resolver = Some(resolver);
    }

    /// The installed resolver, if any.
    pub fn resolver(&self) -> Option<Arc<dyn ExternalResolver>> {
        self.resolver.clone()
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keeps_first_registration() {
        let mut ctx = RuntimeContext::new();
        let int_t = ctx.types.builtin().i32;
        let a = ctx
            .types
            .add(TypeDesc::User(crate::UserDesc::named("thing", int_t)));
        let b = ctx
            .types
            .add(TypeDesc::User(crate::UserDesc::named("thing", int_t)));

        assert_eq!(ctx.register_user(a), a);
        assert_eq!(ctx.register_user(b), a);
        assert_eq!(ctx.find_user(&Label::text("thing")), Some(a));
        assert_eq!(ctx.find_user_crc(crate::name_crc("thing")), Some(a));
    }

    #[test]
    fn external_placeholder_round_trips_its_path() {
        let mut ctx = RuntimeContext::new();
        let obj = ctx.alloc_external(TypeSlot::None, "textures/stone.dds", None);
        assert_eq!(
            ctx.external_path(obj).as_deref(),
            Some("textures/stone.dds")
        );
    }
}
