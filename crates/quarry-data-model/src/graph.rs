//! Recursive walks over the object graph: destruction, duplication and
//! traversal-mark cleanup. All walks are driven by type descriptors over raw
//! payload bytes; every out-of-line slot (string, open array, reference) is
//! an arena index read through the scalar codec.

use log::warn;

use crate::scalar::{read_slot, write_slot};
use crate::{BufRef, ObjRef, RuntimeContext, StrRef, TypeDesc, TypeRef, TypeSlot, ValueFlags};

/// Drops one handle to `obj`; at zero the object is destroyed and everything
/// its payload owns is released recursively.
pub fn release(ctx: &mut RuntimeContext, obj: ObjRef) {
    if !ctx.objects.contains(obj) {
        warn!("release of dead object handle {}", obj.index());
        return;
    }
    {
        let header = ctx.objects.header_mut(obj);
        if header.ref_count > 1 {
            header.ref_count -= 1;
            return;
        }
    }
    let (header, payload) = ctx.objects.remove(obj);

    if header.flags.contains(ValueFlags::EXTERNAL) {
        if let Some(path) = StrRef::from_index(read_slot(&payload, 0, false)) {
            if ctx.string_is_live(path) {
                ctx.free_string(path);
            }
        }
        return;
    }
    if header.flags.contains(ValueFlags::REDIRECT) {
        if let Some(child) = ObjRef::from_index(read_slot(&payload, 0, false)) {
            release(ctx, child);
        }
        return;
    }
    if let TypeSlot::Type(t) = header.ty {
        release_payload(ctx, t, &payload, 0);
    }
}

/// Releases everything a payload of type `t` owns, without touching the
/// payload bytes themselves.
pub fn release_payload(ctx: &mut RuntimeContext, t: TypeRef, payload: &[u8], offset: usize) {
    let desc = ctx.types.get(t).clone();
    match desc {
        TypeDesc::String(string) => {
            if let Some(s) = StrRef::from_index(read_slot(payload, offset, string.wide)) {
                ctx.free_string(s);
            }
        }
        TypeDesc::OpenArray(array) => {
            if let Some(b) = BufRef::from_index(read_slot(payload, offset, array.wide)) {
                let buf = ctx.buffer(b).clone();
                ctx.free_buffer(b);
                for i in 0..buf.count {
                    release_payload(ctx, array.element, &buf.data, (i * array.stride) as usize);
                }
            }
        }
        TypeDesc::Reference(reference) => {
            if let Some(child) = ObjRef::from_index(read_slot(payload, offset, reference.wide)) {
                release(ctx, child);
            }
        }
        TypeDesc::Composite(composite) => {
            for field in &composite.fields {
                release_payload(ctx, field.ty, payload, offset + field.offset as usize);
            }
        }
        TypeDesc::Array(array) => {
            for i in 0..array.count {
                release_payload(ctx, array.element, payload, offset + (i * array.stride) as usize);
            }
        }
        TypeDesc::User(user) => {
            if let Some(aliased) = user.aliased {
                release_payload(ctx, aliased, payload, offset);
            }
        }
        // virtual slots define their own storage; their callbacks own it
        TypeDesc::Int(_) | TypeDesc::Float(_) | TypeDesc::Virtual(_) => {}
    }
}

/// Copies an object. The copy owns fresh string and open-array buffers (no
/// heap aliasing with the source); referenced children are shared (their
/// counts bumped) unless `deep`, in which case they are duplicated too.
pub fn duplicate(ctx: &mut RuntimeContext, obj: ObjRef, deep: bool) -> ObjRef {
    let header = ctx.objects.header(obj).clone();
    let mut payload = ctx.objects.payload(obj).to_vec();

    let kept = header.flags
        & (ValueFlags::EXTERNAL
            | ValueFlags::REDIRECT
            | ValueFlags::HAS_EXTERNAL
            | ValueFlags::ALWAYS_MERGE);

    if header.flags.contains(ValueFlags::EXTERNAL) {
        if let Some(path) = StrRef::from_index(read_slot(&payload, 0, false)) {
            let units = ctx.string_bytes(path).to_vec();
            let copy = ctx.new_string(units);
            write_slot(&mut payload, 0, false, copy.index());
        }
    } else if header.flags.contains(ValueFlags::REDIRECT) {
        if let Some(child) = ObjRef::from_index(read_slot(&payload, 0, false)) {
            ctx.retain(child);
        }
    } else if let TypeSlot::Type(t) = header.ty {
        duplicate_payload(ctx, t, &mut payload, 0, deep);
    }

    ctx.alloc_with_payload(header.ty, header.id, kept, payload)
}

/// Re-owns every out-of-line allocation reachable from a payload that was
/// byte-copied from another object.
pub fn duplicate_payload(
    ctx: &mut RuntimeContext,
    t: TypeRef,
    payload: &mut [u8],
    offset: usize,
    deep: bool,
) {
    let desc = ctx.types.get(t).clone();
    match desc {
        TypeDesc::String(string) => {
            if let Some(s) = StrRef::from_index(read_slot(payload, offset, string.wide)) {
                let units = ctx.string_bytes(s).to_vec();
                let copy = ctx.new_string(units);
                write_slot(payload, offset, string.wide, copy.index());
            }
        }
        TypeDesc::OpenArray(array) => {
            if let Some(b) = BufRef::from_index(read_slot(payload, offset, array.wide)) {
                let mut buf = ctx.buffer(b).clone();
                for i in 0..buf.count {
                    duplicate_payload(
                        ctx,
                        array.element,
                        &mut buf.data,
                        (i * array.stride) as usize,
                        deep,
                    );
                }
                let copy = ctx.new_buffer(buf);
                write_slot(payload, offset, array.wide, copy.index());
            }
        }
        TypeDesc::Reference(reference) => {
            if let Some(child) = ObjRef::from_index(read_slot(payload, offset, reference.wide)) {
                if deep {
                    let copy = duplicate(ctx, child, true);
                    write_slot(payload, offset, reference.wide, copy.index());
                } else {
                    ctx.retain(child);
                }
            }
        }
        TypeDesc::Composite(composite) => {
            for field in &composite.fields {
                duplicate_payload(ctx, field.ty, payload, offset + field.offset as usize, deep);
            }
        }
        TypeDesc::Array(array) => {
            for i in 0..array.count {
                duplicate_payload(
                    ctx,
                    array.element,
                    payload,
                    offset + (i * array.stride) as usize,
                    deep,
                );
            }
        }
        TypeDesc::User(user) => {
            if let Some(aliased) = user.aliased {
                duplicate_payload(ctx, aliased, payload, offset, deep);
            }
        }
        TypeDesc::Int(_) | TypeDesc::Float(_) | TypeDesc::Virtual(_) => {}
    }
}

/// Collects the object handles held by reference slots of a payload.
pub fn collect_refs(
    ctx: &RuntimeContext,
    t: TypeRef,
    payload: &[u8],
    offset: usize,
    out: &mut Vec<ObjRef>,
) {
    match ctx.types.get(t) {
        TypeDesc::Reference(reference) => {
            if let Some(child) = ObjRef::from_index(read_slot(payload, offset, reference.wide)) {
                out.push(child);
            }
        }
        TypeDesc::OpenArray(array) => {
            let (element, stride, wide) = (array.element, array.stride, array.wide);
            if let Some(b) = BufRef::from_index(read_slot(payload, offset, wide)) {
                let buf = ctx.buffer(b);
                for i in 0..buf.count {
                    collect_refs(ctx, element, &buf.data, (i * stride) as usize, out);
                }
            }
        }
        TypeDesc::Composite(composite) => {
            for field in &composite.fields {
                collect_refs(ctx, field.ty, payload, offset + field.offset as usize, out);
            }
        }
        TypeDesc::Array(array) => {
            for i in 0..array.count {
                collect_refs(
                    ctx,
                    array.element,
                    payload,
                    offset + (i * array.stride) as usize,
                    out,
                );
            }
        }
        TypeDesc::User(user) => {
            if let Some(aliased) = user.aliased {
                collect_refs(ctx, aliased, payload, offset, out);
            }
        }
        _ => {}
    }
}

/// Clears [`ValueFlags::TEMP`] traversal marks from `root` and everything
/// reachable from it. Safe on cyclic graphs.
pub fn clear_temp_flags(ctx: &mut RuntimeContext, root: ObjRef) {
    let mut stack = vec![root];
    let mut seen = Vec::new();
    while let Some(obj) = stack.pop() {
        if !ctx.objects.contains(obj) || seen.contains(&obj) {
            continue;
        }
        seen.push(obj);
        let header = ctx.objects.header_mut(obj);
        header.flags -= ValueFlags::TEMP;
        if header.flags.contains(ValueFlags::EXTERNAL) {
            continue;
        }
        if header.flags.contains(ValueFlags::REDIRECT) {
            let payload = ctx.objects.payload(obj);
            if let Some(child) = ObjRef::from_index(read_slot(payload, 0, false)) {
                stack.push(child);
            }
            continue;
        }
        if let Some(t) = ctx.obj_type(obj) {
            let payload = ctx.payload_copy(obj);
            collect_refs(ctx, t, &payload, 0, &mut stack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompositeBuilder, Label, StringDesc, TypeDesc};

    fn string_payload(ctx: &mut RuntimeContext, text: &str) -> (TypeRef, Vec<u8>) {
        let ty = ctx.types.builtin().string;
        let s = ctx.new_string(text.as_bytes().to_vec());
        let mut payload = vec![0; 4];
        write_slot(&mut payload, 0, false, s.index());
        (ty, payload)
    }

    #[test]
    fn release_frees_owned_strings() {
        let mut ctx = RuntimeContext::new();
        let (ty, payload) = string_payload(&mut ctx, "hello");
        let s = StrRef::from_index(read_slot(&payload, 0, false)).unwrap();
        let obj = ctx.alloc_with_payload(TypeSlot::Type(ty), None, ValueFlags::empty(), payload);

        assert!(ctx.string_is_live(s));
        ctx.release(obj);
        assert!(!ctx.string_is_live(s));
        assert!(!ctx.objects.contains(obj));
    }

    #[test]
    fn shared_children_survive_one_release() {
        let mut ctx = RuntimeContext::new();
        let int_t = ctx.types.builtin().i32;
        let child = ctx.alloc_object(TypeSlot::Type(int_t), None, ValueFlags::empty());
        let ref_t = ctx.types.reference_to(int_t);

        let mut make_holder = |ctx: &mut RuntimeContext| {
            let mut payload = vec![0; 4];
            write_slot(&mut payload, 0, false, child.index());
            ctx.retain(child);
            ctx.alloc_with_payload(TypeSlot::Type(ref_t), None, ValueFlags::empty(), payload)
        };
        let a = make_holder(&mut ctx);
        let b = make_holder(&mut ctx);
        // the allocation handle itself still holds one count
        ctx.release(child);

        ctx.release(a);
        assert!(ctx.objects.contains(child));
        ctx.release(b);
        assert!(!ctx.objects.contains(child));
    }

    #[test]
    fn duplicate_reowns_strings_but_shares_children() {
        let mut ctx = RuntimeContext::new();
        let int_t = ctx.types.builtin().i32;
        let child = ctx.alloc_object(TypeSlot::Type(int_t), None, ValueFlags::empty());
        let ref_t = ctx.types.reference_to(int_t);
        let str_t = ctx.types.add(TypeDesc::String(StringDesc::narrow()));
        let comp = CompositeBuilder::new()
            .field(&ctx.types, "name", str_t)
            .field(&ctx.types, "child", ref_t)
            .build();
        let comp_t = ctx.types.add(TypeDesc::Composite(comp));

        let name = ctx.new_string(b"rock".to_vec());
        let mut payload = vec![0; 8];
        write_slot(&mut payload, 0, false, name.index());
        write_slot(&mut payload, 4, false, child.index());
        let obj = ctx.alloc_with_payload(TypeSlot::Type(comp_t), None, ValueFlags::empty(), payload);

        let copy = duplicate(&mut ctx, obj, false);
        let copy_name =
            StrRef::from_index(read_slot(ctx.objects.payload(copy), 0, false)).unwrap();
        assert_ne!(copy_name, name);
        assert_eq!(ctx.string_bytes(copy_name), b"rock");
        // the child is shared, not copied
        assert_eq!(read_slot(ctx.objects.payload(copy), 4, false), child.index());
        assert_eq!(ctx.objects.header(child).ref_count, 2);
    }

    #[test]
    fn clear_temp_flags_handles_cycles() {
        let mut ctx = RuntimeContext::new();
        let node_t = ctx.types.add(TypeDesc::User(crate::UserDesc {
            name: Label::text("cycle-node"),
            aliased: None,
            flags: crate::UserFlags::WRITE_TO_BIN,
            init: None,
        }));
        let ref_t = ctx.types.reference_to(node_t);
        match ctx.types.get_mut(node_t) {
            TypeDesc::User(user) => user.aliased = Some(ref_t),
            _ => unreachable!(),
        }

        let a = ctx.alloc_object(TypeSlot::Type(node_t), None, ValueFlags::TEMP);
        let b = ctx.alloc_object(TypeSlot::Type(node_t), None, ValueFlags::TEMP);
        write_slot(ctx.objects.payload_mut(a), 0, false, b.index());
        write_slot(ctx.objects.payload_mut(b), 0, false, a.index());
        ctx.retain(a);
        ctx.retain(b);

        clear_temp_flags(&mut ctx, a);
        assert!(!ctx.objects.header(a).flags.contains(ValueFlags::TEMP));
        assert!(!ctx.objects.header(b).flags.contains(ValueFlags::TEMP));
    }
}
