use log::{debug, warn};
use quarry_data_model::scalar::{read_slot, write_slot};
use quarry_data_model::{
    graph, BufRef, ConvertFlags, MatchCriteria, ObjRef, RuntimeContext, TypeDesc, TypeKind,
    TypeRef, TypeSlot, UserFlags, ValueFlags,
};
use quarry_utils::HashMap;

use crate::{batch_convert, follow_redirect, ConvertError};

/// Default recursion budget for graph-level conversion. Exhausting it yields
/// a null result rather than unbounded recursion.
pub const DEFAULT_DEPTH: i32 = 64;

/// Where a reference slot lives: directly in an object payload, or inside an
/// open-array buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Place {
    Obj(ObjRef),
    Buf(BufRef),
}

#[derive(Clone, Copy, Debug)]
struct SlotLoc {
    place: Place,
    offset: usize,
    wide: bool,
}

/// Per-object state of the copy-on-write pre-pass: conversion either
/// finished with a result, or is still in flight with slots waiting to be
/// patched once it lands.
enum Tracked {
    Pending(Vec<SlotLoc>),
    Done(Option<ObjRef>),
}

/// Call-local state of one top-level `convert`. Dropped unconditionally when
/// the call returns, so overlapping graphs in later calls start clean.
#[derive(Default)]
struct Session {
    changes: HashMap<u32, Tracked>,
}

fn read_place(ctx: &RuntimeContext, loc: SlotLoc) -> Option<ObjRef> {
    let bytes = match loc.place {
        Place::Obj(obj) => ctx.objects.payload(obj),
        Place::Buf(buf) => &ctx.buffer(buf).data,
    };
    ObjRef::from_index(read_slot(bytes, loc.offset, loc.wide))
}

/// Replaces the object held by a slot, keeping reference counts balanced.
/// The new handle's count is transferred into the slot (callers hand over an
/// owned count); the displaced object loses the slot's count.
fn install_place(ctx: &mut RuntimeContext, loc: SlotLoc, new: Option<ObjRef>) {
    let old = read_place(ctx, loc);
    if old == new {
        // the slot already owns one count; drop the incoming duplicate
        if let Some(new) = new {
            graph::release(ctx, new);
        }
        return;
    }
    let index = new.map_or(0, ObjRef::index);
    match loc.place {
        Place::Obj(obj) => write_slot(ctx.objects.payload_mut(obj), loc.offset, loc.wide, index),
        Place::Buf(buf) => write_slot(&mut ctx.buffer_mut(buf).data, loc.offset, loc.wide, index),
    }
    if let Some(old) = old {
        graph::release(ctx, old);
    }
}

/// Graph-level conversion with plugin dispatch.
///
/// Consults the context's converter plugins in registration order (strict
/// pass first, then a `RECURSE`-relaxed pass), honors the external-reference
/// policy flags, duplicates shared subgraphs copy-on-write under
/// `CHECK_INSIDE`/`FULL_CHECK`, and bounds recursion by `depth`.
///
/// Returns an owned handle (release it when done), or `None` when the
/// conversion is impossible or the budget ran out.
pub fn convert(
    ctx: &mut RuntimeContext,
    obj: ObjRef,
    target: Option<TypeRef>,
    flags: ConvertFlags,
    depth: i32,
) -> Option<ObjRef> {
    let external = ctx
        .objects
        .header(obj)
        .flags
        .contains(ValueFlags::EXTERNAL);
    let deep = flags.intersects(ConvertFlags::CHECK_INSIDE | ConvertFlags::FULL_CHECK);

    let mut session = Session::default();
    let result = inner_convert(ctx, &mut session, Some(obj), target, flags, depth);

    if deep && !external {
        // guaranteed teardown: temp marks cleared, mapping table dropped,
        // success or not
        if ctx.objects.contains(obj) {
            graph::clear_temp_flags(ctx, obj);
        }
        if let Some(result) = result {
            if ctx.objects.contains(result) {
                graph::clear_temp_flags(ctx, result);
            }
        }
    }
    result
}

fn finish(ctx: &mut RuntimeContext, p: ObjRef, owned: bool) -> Option<ObjRef> {
    if !owned {
        ctx.retain(p);
    }
    Some(p)
}

fn drop_if(ctx: &mut RuntimeContext, p: ObjRef, owned: bool) {
    if owned {
        graph::release(ctx, p);
    }
}

fn user_flags_of(ctx: &RuntimeContext, t: Option<TypeRef>) -> UserFlags {
    match t.map(|t| ctx.types.get(t)) {
        Some(TypeDesc::User(user)) => user.flags,
        _ => UserFlags::empty(),
    }
}

fn is_type(ctx: &RuntimeContext, p: ObjRef, target: Option<TypeRef>, criteria: MatchCriteria) -> bool {
    let ty = if ctx.objects.header(p).flags.contains(ValueFlags::CRC_TYPE) {
        None
    } else {
        ctx.obj_type(p)
    };
    ctx.types.same_shape(ty, target, criteria)
}

fn inner_convert(
    ctx: &mut RuntimeContext,
    session: &mut Session,
    p: Option<ObjRef>,
    target: Option<TypeRef>,
    mut flags: ConvertFlags,
    depth: i32,
) -> Option<ObjRef> {
    let mut p = p?;
    let mut owned = false;

    // externals: pass through, refuse, or eagerly expand per policy
    if ctx.objects.header(p).flags.contains(ValueFlags::EXTERNAL) {
        let header_flags = ctx.objects.header(p).flags;
        if flags.contains(ConvertFlags::ALLOW_EXTERNALS)
            || header_flags.contains(ValueFlags::EXT_REF)
        {
            return finish(ctx, p, owned);
        }
        if !flags.contains(ConvertFlags::EXPAND_EXTERNALS) {
            return None;
        }
        let id = ctx.objects.header(p).id.clone();
        let resolved = read_external_obj(ctx, p)?;
        if let (Some(id), true) = (id, ctx.objects.header(resolved).id.is_none()) {
            ctx.objects.header_mut(resolved).id = Some(id);
        }
        p = resolved;
        owned = true;
    }

    // redirects are unwrapped before any matching
    if ctx.objects.header(p).flags.contains(ValueFlags::REDIRECT) {
        let mut subtype = ctx.obj_type(p);
        if let Some(t) = subtype {
            if let TypeDesc::Reference(r) = ctx.types.get(t) {
                subtype = r.element;
            }
        }
        let inner = ObjRef::from_index(read_slot(ctx.objects.payload(p), 0, false));
        let converted = inner_convert(ctx, session, inner, subtype, flags, depth - 1);
        let Some(q) = converted else {
            drop_if(ctx, p, owned);
            return None;
        };
        if ctx.obj_type(q) != subtype {
            let redirect = make_redirect(ctx, q, target.or(subtype));
            drop_if(ctx, p, owned);
            return Some(redirect);
        }
        if target == subtype {
            drop_if(ctx, p, owned);
            return Some(q);
        }
        drop_if(ctx, p, owned);
        p = q;
        owned = true;
    }

    let p_ty = ctx.obj_type(p);
    let change = user_flags_of(ctx, p_ty).contains(UserFlags::CHANGE);

    if change && is_type(ctx, p, target, MatchCriteria::MATCH_NULLS) {
        debug!("expanding change-on-load type of object {}", p.index());
        let saved = flags;
        if flags.contains(ConvertFlags::EXPAND_EXTERNALS)
            && user_flags_of(ctx, p_ty).contains(UserFlags::WRITE_TO_BIN)
        {
            flags = (flags - ConvertFlags::EXPAND_EXTERNALS) | ConvertFlags::ALLOW_EXTERNALS;
        }

        if flags.intersects(ConvertFlags::FULL_CHECK | ConvertFlags::CHECK_INSIDE) && depth > 0 {
            let q = check_inside_obj(ctx, session, p, flags, depth - 1);
            if q != p {
                drop_if(ctx, p, owned);
                p = q;
                owned = true;
            } else {
                graph::release(ctx, q);
            }
            if flags != saved {
                graph::clear_temp_flags(ctx, p);
            }
        } else if flags.contains(ConvertFlags::EXPAND_EXTERNALS)
            && ctx
                .objects
                .header(p)
                .flags
                .contains(ValueFlags::HAS_EXTERNAL)
        {
            let q = expand_externals(ctx, p);
            if q != p {
                drop_if(ctx, p, owned);
                p = q;
                owned = true;
            }
        }

        for plugin in ctx.converters() {
            if let Some(p2) = plugin.try_convert(ctx, p, None, ConvertFlags::CHANGE) {
                if p2 == p {
                    graph::release(ctx, p2);
                    break;
                }
                if ctx.objects.header(p2).id.is_none() {
                    ctx.objects.header_mut(p2).id = ctx.objects.header(p).id.clone();
                }
                if target == ctx.obj_type(p) {
                    drop_if(ctx, p, owned);
                    return Some(p2);
                }
                let result = inner_convert(ctx, session, Some(p2), target, flags, depth - 1);
                graph::release(ctx, p2);
                drop_if(ctx, p, owned);
                return result;
            }
        }
    } else if change
        && user_flags_of(ctx, p_ty).contains(UserFlags::WRITE_TO_BIN)
        && !flags.contains(ConvertFlags::ALLOW_EXTERNALS)
        && ctx
            .objects
            .header(p)
            .flags
            .contains(ValueFlags::HAS_EXTERNAL)
    {
        let retry = (flags - ConvertFlags::EXPAND_EXTERNALS) | ConvertFlags::ALLOW_EXTERNALS;
        let result = inner_convert(ctx, session, Some(p), target, retry, depth);
        drop_if(ctx, p, owned);
        return result;
    } else if !flags.intersects(
        ConvertFlags::ALLOW_EXTERNALS | ConvertFlags::FULL_CHECK | ConvertFlags::CHECK_INSIDE,
    ) && flags.contains(ConvertFlags::EXPAND_EXTERNALS)
        && ctx
            .objects
            .header(p)
            .flags
            .contains(ValueFlags::HAS_EXTERNAL)
    {
        let q = expand_externals(ctx, p);
        if q != p {
            drop_if(ctx, p, owned);
            p = q;
            owned = true;
        }
    }

    let deep = flags.intersects(ConvertFlags::FULL_CHECK | ConvertFlags::CHECK_INSIDE);
    let p_ty = ctx.obj_type(p);

    if (target.is_none() || target == p_ty) && !deep {
        return finish(ctx, p, owned);
    }

    if ctx.objects.header(p).flags.contains(ValueFlags::CRC_TYPE) || p_ty.is_none() || depth < 0 {
        drop_if(ctx, p, owned);
        return None;
    }

    if deep && depth > 0 {
        let q = check_inside_obj(ctx, session, p, flags, depth - 1);
        if q != p {
            drop_if(ctx, p, owned);
            p = q;
            owned = true;
        } else {
            graph::release(ctx, q);
        }
    }

    let p_ty = ctx.obj_type(p);
    let target_t = match target {
        None => return finish(ctx, p, owned),
        Some(t) if Some(t) == p_ty => return finish(ctx, p, owned),
        Some(t) => t,
    };

    if ctx
        .types
        .same_shape(p_ty, Some(target_t), MatchCriteria::empty())
    {
        // same bit layout under a different name: retag in place
        if user_flags_of(ctx, Some(target_t)).contains(UserFlags::CHANGE) {
            ctx.objects.header_mut(p).ty = TypeSlot::Type(target_t);
        }
        return finish(ctx, p, owned);
    }

    let skipped_src = p_ty.and_then(|t| ctx.types.skip_user(t));
    let skipped_dst = ctx.types.skip_user(target_t);

    if !change {
        if let Some(s) = skipped_src {
            if let TypeDesc::Reference(r) = ctx.types.get(s).clone() {
                let child = ObjRef::from_index(read_slot(ctx.objects.payload(p), 0, r.wide));
                let result = inner_convert(
                    ctx,
                    session,
                    child,
                    target,
                    flags | ConvertFlags::RECURSE,
                    depth - 1,
                );
                drop_if(ctx, p, owned);
                return result;
            }
            if let TypeDesc::Virtual(virt) = ctx.types.get(s).clone() {
                if !ctx
                    .types
                    .entry_flags(s)
                    .contains(quarry_data_model::TypeEntryFlags::FIXED)
                {
                    let payload = ctx.payload_copy(p);
                    if let Some(resolved) = virt.ops.deref(ctx, &payload) {
                        let result = inner_convert(
                            ctx,
                            session,
                            Some(resolved),
                            target,
                            flags | ConvertFlags::RECURSE,
                            depth - 1,
                        );
                        drop_if(ctx, p, owned);
                        return result;
                    }
                }
            }
        }
    }

    if let Some(d) = skipped_dst {
        if let TypeDesc::Reference(r) = ctx.types.get(d).clone() {
            if let Some(element) = r.element {
                let id = ctx.objects.header(p).id.clone();
                let child = inner_convert(
                    ctx,
                    session,
                    Some(p),
                    Some(element),
                    flags | ConvertFlags::RECURSE,
                    depth - 1,
                );
                let wrapper = ctx.alloc_object(TypeSlot::Type(target_t), id, ValueFlags::empty());
                write_slot(
                    ctx.objects.payload_mut(wrapper),
                    0,
                    r.wide,
                    child.map_or(0, ObjRef::index),
                );
                drop_if(ctx, p, owned);
                return Some(wrapper);
            }
        }
    }

    if !matches!(ctx.types.get(target_t), TypeDesc::User(_)) {
        if let Ok(p2) = convert_into_new(ctx, p, target_t) {
            drop_if(ctx, p, owned);
            return Some(p2);
        }
    } else {
        // accept flattened inheritance: the first-field chain reaches target
        let mut inherit = skipped_src;
        while let Some(t) = inherit {
            let first = match ctx.types.get(t) {
                TypeDesc::Composite(comp) => comp.fields.first().map(|f| f.ty),
                _ => None,
            };
            let Some(first) = first else { break };
            if first == target_t {
                return finish(ctx, p, owned);
            }
            inherit = Some(first);
            if !matches!(ctx.types.get(first), TypeDesc::Composite(_)) {
                break;
            }
        }
    }

    // plugin passes: strict first, then relaxed when RECURSE allows it
    for plugin in ctx.converters() {
        if let Some(p2) = plugin.try_convert(ctx, p, Some(target_t), flags - ConvertFlags::RECURSE)
        {
            if ctx.objects.header(p2).id.is_none() {
                ctx.objects.header_mut(p2).id = ctx.objects.header(p).id.clone();
            }
            let result = inner_convert(ctx, session, Some(p2), target, flags, depth - 1);
            graph::release(ctx, p2);
            drop_if(ctx, p, owned);
            return result;
        }
    }
    if flags.contains(ConvertFlags::RECURSE) {
        for plugin in ctx.converters() {
            if let Some(p2) = plugin.try_convert(ctx, p, Some(target_t), flags) {
                if ctx.objects.header(p2).id.is_none() {
                    ctx.objects.header_mut(p2).id = ctx.objects.header(p).id.clone();
                }
                let result = inner_convert(ctx, session, Some(p2), target, flags, depth - 1);
                graph::release(ctx, p2);
                drop_if(ctx, p, owned);
                return result;
            }
        }
    }

    if let Some(d) = skipped_dst {
        if let TypeDesc::Reference(r) = ctx.types.get(d).clone() {
            // untyped reference destination: just box the source
            let id = ctx.objects.header(p).id.clone();
            let wrapper = ctx.alloc_object(TypeSlot::Type(target_t), id, ValueFlags::empty());
            ctx.retain(p);
            write_slot(ctx.objects.payload_mut(wrapper), 0, r.wide, p.index());
            drop_if(ctx, p, owned);
            return Some(wrapper);
        }
    }

    if flags.contains(ConvertFlags::RECURSE) {
        if let Ok(p2) = convert_into_new(ctx, p, target_t) {
            drop_if(ctx, p, owned);
            return Some(p2);
        }
    }

    drop_if(ctx, p, owned);
    None
}

/// Allocates a fresh object of `target` and transcodes `p`'s payload into it.
fn convert_into_new(
    ctx: &mut RuntimeContext,
    p: ObjRef,
    target: TypeRef,
) -> Result<ObjRef, ConvertError> {
    let (src_ty, src_payload) = follow_redirect(ctx, p);
    let id = ctx.objects.header(p).id.clone();
    let size = ctx.types.size_of(target) as usize;
    let mut dst = vec![0u8; size];
    batch_convert(ctx, &src_payload, 0, src_ty, &mut dst, 0, target, 1, true)?;
    Ok(ctx.alloc_with_payload(TypeSlot::Type(target), id, ValueFlags::empty(), dst))
}

/// Builds a redirect wrapper standing in for `inner` under a declared type.
/// Takes ownership of the handed-in count.
fn make_redirect(ctx: &mut RuntimeContext, inner: ObjRef, ty: Option<TypeRef>) -> ObjRef {
    let id = ctx.objects.header(inner).id.clone();
    let has_external = ctx.objects.header(inner).flags
        & (ValueFlags::HAS_EXTERNAL | ValueFlags::EXTERNAL);
    let slot = match ty {
        Some(t) => TypeSlot::Type(t),
        None => TypeSlot::None,
    };
    let mut payload = vec![0u8; 4];
    write_slot(&mut payload, 0, false, inner.index());
    let flags = ValueFlags::REDIRECT
        | if has_external.is_empty() {
            ValueFlags::empty()
        } else {
            ValueFlags::HAS_EXTERNAL
        };
    ctx.alloc_with_payload(slot, id, flags, payload)
}

/// Resolves one externally-backed object through the context's resolver.
fn read_external_obj(ctx: &mut RuntimeContext, p: ObjRef) -> Option<ObjRef> {
    let path = ctx.external_path(p)?;
    let resolver = ctx.resolver()?;
    let resolved = resolver.read_external(ctx, &path);
    match resolved {
        Some(obj) => {
            ctx.objects.header_mut(obj).flags |= ValueFlags::EXT_REF;
            Some(obj)
        }
        None => {
            warn!("could not resolve external '{}'", path);
            None
        }
    }
}

/// Eagerly replaces externally-backed descendants with loaded objects, where
/// the resolver can supply them. Unresolvable externals are left in place.
fn expand_externals(ctx: &mut RuntimeContext, root: ObjRef) -> ObjRef {
    if ctx.resolver().is_none() {
        return root;
    }
    if ctx
        .objects
        .header(root)
        .flags
        .contains(ValueFlags::EXTERNAL)
    {
        if let Some(resolved) = read_external_obj(ctx, root) {
            return resolved;
        }
        return root;
    }

    let mut stack = vec![root];
    let mut seen = Vec::new();
    while let Some(obj) = stack.pop() {
        if seen.contains(&obj) || !ctx.objects.contains(obj) {
            continue;
        }
        seen.push(obj);
        let Some(t) = ctx.obj_type(obj) else { continue };
        let payload = ctx.payload_copy(obj);
        let mut slots = Vec::new();
        collect_ref_slots(ctx, t, Place::Obj(obj), &payload, 0, &mut slots);
        for (loc, _) in slots {
            let Some(child) = read_place(ctx, loc) else { continue };
            if ctx
                .objects
                .header(child)
                .flags
                .contains(ValueFlags::EXTERNAL)
            {
                if let Some(resolved) = read_external_obj(ctx, child) {
                    install_place(ctx, loc, Some(resolved));
                }
            } else {
                stack.push(child);
            }
        }
        let header = ctx.objects.header_mut(obj);
        header.flags -= ValueFlags::HAS_EXTERNAL;
    }
    root
}

/// Collects the locations of every reference slot reachable without crossing
/// another object boundary, paired with each slot's declared pointee type.
fn collect_ref_slots(
    ctx: &RuntimeContext,
    t: TypeRef,
    place: Place,
    bytes: &[u8],
    offset: usize,
    out: &mut Vec<(SlotLoc, Option<TypeRef>)>,
) {
    match ctx.types.get(t) {
        TypeDesc::Reference(r) => out.push((
            SlotLoc {
                place,
                offset,
                wide: r.wide,
            },
            r.element,
        )),
        TypeDesc::Composite(comp) => {
            for field in &comp.fields {
                collect_ref_slots(ctx, field.ty, place, bytes, offset + field.offset as usize, out);
            }
        }
        TypeDesc::Array(array) => {
            for i in 0..array.count {
                collect_ref_slots(
                    ctx,
                    array.element,
                    place,
                    bytes,
                    offset + (i * array.stride) as usize,
                    out,
                );
            }
        }
        TypeDesc::OpenArray(array) => {
            if let Some(b) = BufRef::from_index(read_slot(bytes, offset, array.wide)) {
                let buf = ctx.buffer(b);
                let data = buf.data.clone();
                let count = buf.count;
                for i in 0..count {
                    collect_ref_slots(
                        ctx,
                        array.element,
                        Place::Buf(b),
                        &data,
                        (i * array.stride) as usize,
                        out,
                    );
                }
            }
        }
        TypeDesc::User(user) => {
            if let Some(aliased) = user.aliased {
                collect_ref_slots(ctx, aliased, place, bytes, offset, out);
            }
        }
        _ => {}
    }
}

/// Object-level copy-on-write pre-pass: marks the object visited, converts
/// the pointees its slots declare, duplicating before mutation so shared
/// holders keep seeing the original. Returns an owned handle (possibly the
/// same object).
fn check_inside_obj(
    ctx: &mut RuntimeContext,
    session: &mut Session,
    p: ObjRef,
    flags: ConvertFlags,
    depth: i32,
) -> ObjRef {
    if ctx.objects.header(p).flags.contains(ValueFlags::TEMP) {
        ctx.retain(p);
        return p;
    }
    ctx.objects.header_mut(p).flags |= ValueFlags::TEMP;

    let Some(p_ty) = ctx.obj_type(p) else {
        ctx.retain(p);
        return p;
    };
    let Some(skipped) = ctx.types.skip_user(p_ty) else {
        ctx.retain(p);
        return p;
    };
    if ctx.types.is_plain_data(skipped, false) {
        ctx.retain(p);
        return p;
    }

    if let TypeDesc::Reference(r) = ctx.types.get(skipped).clone() {
        let child = ObjRef::from_index(read_slot(ctx.objects.payload(p), 0, r.wide));
        let converted = inner_convert(ctx, session, child, r.element, flags, depth - 1);
        install_place(
            ctx,
            SlotLoc {
                place: Place::Obj(p),
                offset: 0,
                wide: r.wide,
            },
            converted,
        );
        ctx.retain(p);
        return p;
    }

    let mut current = p;
    let mut owned = false;
    let kind = ctx.types.kind_of(skipped);

    if flags.contains(ConvertFlags::FULL_CHECK)
        && matches!(
            kind,
            TypeKind::Composite | TypeKind::Array | TypeKind::OpenArray
        )
    {
        let copy = graph::duplicate(ctx, current, false);
        let changed = check_inside_value(ctx, session, p_ty, Place::Obj(copy), 0, flags, depth - 1);
        if changed {
            current = copy;
            owned = true;
        } else {
            graph::release(ctx, copy);
        }
    }

    if flags.contains(ConvertFlags::EXPAND_EXTERNALS) {
        let expanded = expand_externals(ctx, current);
        if expanded != current {
            if owned {
                graph::release(ctx, current);
            }
            current = expanded;
            owned = true;
        }
    }

    if ctx.types.contains_references(skipped) {
        retarget_declared_pointees(ctx, session, &mut current, &mut owned, skipped, flags, depth);
    }

    if !owned {
        ctx.retain(current);
    }
    current
}

/// Re-converts reference elements whose pointee no longer matches the
/// declared element type, duplicating the holder first (copy-on-write).
fn retarget_declared_pointees(
    ctx: &mut RuntimeContext,
    session: &mut Session,
    current: &mut ObjRef,
    owned: &mut bool,
    skipped: TypeRef,
    flags: ConvertFlags,
    depth: i32,
) {
    fn mismatches(
        ctx: &RuntimeContext,
        skipped: TypeRef,
        holder: ObjRef,
    ) -> Vec<(SlotLoc, TypeRef)> {
        let payload = ctx.objects.payload(holder).to_vec();
        let mut slots = Vec::new();
        collect_ref_slots(ctx, skipped, Place::Obj(holder), &payload, 0, &mut slots);
        slots
            .into_iter()
            .filter_map(|(loc, declared)| {
                let declared = declared?;
                let child = read_place(ctx, loc)?;
                if ctx
                    .objects
                    .header(child)
                    .flags
                    .contains(ValueFlags::EXTERNAL)
                {
                    return None;
                }
                (ctx.obj_type(child) != Some(declared)).then(|| (loc, declared))
            })
            .collect()
    }

    let mut mismatched = mismatches(ctx, skipped, *current);
    if mismatched.is_empty() {
        return;
    }

    if !*owned {
        let copy = graph::duplicate(ctx, *current, false);
        *current = copy;
        *owned = true;
        // recompute slot locations against the copy
        mismatched = mismatches(ctx, skipped, copy);
    }

    for (loc, declared) in mismatched {
        let child = read_place(ctx, loc);
        let converted = inner_convert(ctx, session, child, Some(declared), flags, depth - 1);
        install_place(ctx, loc, converted);
    }
}

/// Value-level copy-on-write walk. Returns whether anything changed.
fn check_inside_value(
    ctx: &mut RuntimeContext,
    session: &mut Session,
    t: TypeRef,
    place: Place,
    offset: usize,
    flags: ConvertFlags,
    depth: i32,
) -> bool {
    let Some(skipped) = ctx.types.skip_user(t) else {
        return false;
    };
    if ctx.types.is_plain_data(skipped, false) {
        return false;
    }

    match ctx.types.get(skipped).clone() {
        TypeDesc::Reference(r) => {
            let loc = SlotLoc {
                place,
                offset,
                wide: r.wide,
            };
            let Some(child) = read_place(ctx, loc) else {
                return false;
            };

            if ctx.objects.header(child).flags.contains(ValueFlags::TEMP) {
                // the child is being converted higher up the call: either its
                // result already landed, or this slot waits on the patch list
                match session.changes.get_mut(&child.index()) {
                    Some(Tracked::Done(result)) => {
                        let result = *result;
                        if let Some(result) = result {
                            ctx.retain(result);
                        }
                        install_place(ctx, loc, result);
                    }
                    Some(Tracked::Pending(deferred)) => deferred.push(loc),
                    None => {
                        session
                            .changes
                            .insert(child.index(), Tracked::Pending(vec![loc]));
                    }
                }
                true
            } else {
                let mut child_flags = flags;
                if ctx
                    .objects
                    .header(child)
                    .flags
                    .contains(ValueFlags::MEMORY32)
                {
                    child_flags |= ConvertFlags::MEMORY32;
                }
                let converted =
                    inner_convert(ctx, session, Some(child), r.element, child_flags, depth - 1);
                if converted == Some(child) {
                    // unchanged: balance the owned count and move on
                    graph::release(ctx, child);
                    false
                } else {
                    // record the mapping and patch every slot that was
                    // deferred on this child
                    let deferred = match session
                        .changes
                        .insert(child.index(), Tracked::Done(converted))
                    {
                        Some(Tracked::Pending(list)) => list,
                        _ => Vec::new(),
                    };
                    for waiting in deferred {
                        if let Some(result) = converted {
                            ctx.retain(result);
                        }
                        install_place(ctx, waiting, converted);
                    }
                    install_place(ctx, loc, converted);
                    true
                }
            }
        }
        TypeDesc::OpenArray(array) => {
            if ctx.types.is_plain_data(array.element, false) {
                return false;
            }
            let bytes = match place {
                Place::Obj(obj) => ctx.objects.payload(obj),
                Place::Buf(buf) => &ctx.buffer(buf).data,
            };
            let Some(b) = BufRef::from_index(read_slot(bytes, offset, array.wide)) else {
                return false;
            };
            let count = ctx.buffer(b).count;
            let mut changed = false;
            for i in 0..count {
                changed |= check_inside_value(
                    ctx,
                    session,
                    array.element,
                    Place::Buf(b),
                    (i * array.stride) as usize,
                    flags,
                    depth - 1,
                );
            }
            changed
        }
        TypeDesc::Composite(comp) => {
            let mut changed = false;
            for field in &comp.fields {
                changed |= check_inside_value(
                    ctx,
                    session,
                    field.ty,
                    place,
                    offset + field.offset as usize,
                    flags,
                    depth - 1,
                );
            }
            changed
        }
        TypeDesc::Array(array) => {
            let mut changed = false;
            for i in 0..array.count {
                changed |= check_inside_value(
                    ctx,
                    session,
                    array.element,
                    place,
                    offset + (i * array.stride) as usize,
                    flags,
                    depth - 1,
                );
            }
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_data_model::scalar::{read_int, write_int};
    use quarry_data_model::{CompositeBuilder, Converter, Label, RefDesc, UserDesc};
    use std::sync::Arc;

    #[test]
    fn cyclic_reference_chain_hits_the_depth_guard() {
        let mut ctx = RuntimeContext::new();
        let ref_t = ctx.types.add(TypeDesc::Reference(RefDesc::untyped()));
        let a = ctx.alloc_object(TypeSlot::Type(ref_t), None, ValueFlags::empty());
        let b = ctx.alloc_object(TypeSlot::Type(ref_t), None, ValueFlags::empty());
        write_slot(ctx.objects.payload_mut(a), 0, false, b.index());
        write_slot(ctx.objects.payload_mut(b), 0, false, a.index());
        ctx.retain(a);
        ctx.retain(b);

        let f32_t = ctx.types.builtin().f32;
        let result = convert(&mut ctx, a, Some(f32_t), ConvertFlags::empty(), 8);
        assert!(result.is_none(), "must yield null, not overflow the stack");
    }

    struct Doubler;

    impl Converter for Doubler {
        fn try_convert(
            &self,
            ctx: &mut RuntimeContext,
            obj: ObjRef,
            target: Option<TypeRef>,
            _flags: ConvertFlags,
        ) -> Option<ObjRef> {
            let target = target?;
            let wanted = match ctx.types.get(target) {
                TypeDesc::User(user) => user.name == Label::text("doubled"),
                _ => false,
            };
            if !wanted {
                return None;
            }
            let value = read_int(ctx.objects.payload(obj), 0, 4, true);
            let mut payload = vec![0u8; 8];
            write_int(&mut payload, 0, 4, value * 2);
            Some(ctx.alloc_with_payload(TypeSlot::Type(target), None, ValueFlags::empty(), payload))
        }
    }

    struct Rejector;

    impl Converter for Rejector {
        fn try_convert(
            &self,
            _ctx: &mut RuntimeContext,
            _obj: ObjRef,
            _target: Option<TypeRef>,
            _flags: ConvertFlags,
        ) -> Option<ObjRef> {
            None
        }
    }

    #[test]
    fn plugins_are_consulted_in_registration_order() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        // "doubled" aliases a composite, so no structural path exists from a
        // bare i32 and the plugin list decides
        let payload_desc = CompositeBuilder::new()
            .field(&ctx.types, "value", i32_t)
            .field(&ctx.types, "pad", i32_t)
            .build();
        let payload_t = ctx.types.add(TypeDesc::Composite(payload_desc));
        let doubled_t = ctx
            .types
            .add(TypeDesc::User(UserDesc::named("doubled", payload_t)));
        ctx.register_converter(Arc::new(Rejector));
        ctx.register_converter(Arc::new(Doubler));

        let src = ctx.alloc_object(TypeSlot::Type(i32_t), None, ValueFlags::empty());
        write_int(ctx.objects.payload_mut(src), 0, 4, 21);

        let result = convert(&mut ctx, src, Some(doubled_t), ConvertFlags::empty(), 8)
            .expect("plugin should produce a result");
        assert_eq!(ctx.obj_type(result), Some(doubled_t));
        assert_eq!(read_int(ctx.objects.payload(result), 0, 4, true), 42);
    }

    #[test]
    fn shared_subgraphs_convert_once_under_full_check() {
        struct Retag {
            from: TypeRef,
            to: TypeRef,
        }
        impl Converter for Retag {
            fn try_convert(
                &self,
                ctx: &mut RuntimeContext,
                obj: ObjRef,
                _target: Option<TypeRef>,
                flags: ConvertFlags,
            ) -> Option<ObjRef> {
                if !flags.contains(ConvertFlags::CHANGE) {
                    return None;
                }
                if ctx.obj_type(obj) != Some(self.from) {
                    return None;
                }
                let payload = ctx.payload_copy(obj);
                Some(ctx.alloc_with_payload(
                    TypeSlot::Type(self.to),
                    None,
                    ValueFlags::empty(),
                    payload,
                ))
            }
        }

        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let old_t = ctx.types.add(TypeDesc::User(UserDesc {
            name: Label::text("old-node"),
            aliased: Some(i32_t),
            flags: UserFlags::WRITE_TO_BIN | UserFlags::CHANGE,
            init: None,
        }));
        let new_t = ctx
            .types
            .add(TypeDesc::User(UserDesc::named("new-node", i32_t)));
        ctx.register_converter(Arc::new(Retag {
            from: old_t,
            to: new_t,
        }));

        // two untyped reference fields sharing one old-node child
        let ref_t = ctx.types.add(TypeDesc::Reference(RefDesc::untyped()));
        let holder_desc = CompositeBuilder::new()
            .field(&ctx.types, "a", ref_t)
            .field(&ctx.types, "b", ref_t)
            .build();
        let holder_t = ctx.types.add(TypeDesc::Composite(holder_desc));

        let child = ctx.alloc_object(TypeSlot::Type(old_t), None, ValueFlags::empty());
        write_int(ctx.objects.payload_mut(child), 0, 4, 5);
        ctx.retain(child); // second slot's share

        let holder = ctx.alloc_object(TypeSlot::Type(holder_t), None, ValueFlags::empty());
        write_slot(ctx.objects.payload_mut(holder), 0, false, child.index());
        write_slot(ctx.objects.payload_mut(holder), 4, false, child.index());

        let result = convert(&mut ctx, holder, None, ConvertFlags::FULL_CHECK, 16)
            .expect("deep check should succeed");

        let a = ObjRef::from_index(read_slot(ctx.objects.payload(result), 0, false)).unwrap();
        let b = ObjRef::from_index(read_slot(ctx.objects.payload(result), 4, false)).unwrap();
        assert_eq!(a, b, "sharing topology must survive conversion");
        assert_eq!(ctx.obj_type(a), Some(new_t));
        assert_eq!(read_int(ctx.objects.payload(a), 0, 4, true), 5);

        // teardown: no temp marks left anywhere
        assert!(!ctx
            .objects
            .header(result)
            .flags
            .contains(ValueFlags::TEMP));
        assert!(!ctx.objects.header(a).flags.contains(ValueFlags::TEMP));
    }

    #[test]
    fn same_shape_retags_change_flagged_users() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let renamed_t = ctx.types.add(TypeDesc::User(UserDesc {
            name: Label::text("renamed"),
            aliased: Some(i32_t),
            flags: UserFlags::WRITE_TO_BIN | UserFlags::CHANGE,
            init: None,
        }));

        let obj = ctx.alloc_object(TypeSlot::Type(i32_t), None, ValueFlags::empty());
        write_int(ctx.objects.payload_mut(obj), 0, 4, 13);

        let result = convert(&mut ctx, obj, Some(renamed_t), ConvertFlags::empty(), 8)
            .expect("same-layout retag");
        assert_eq!(result, obj, "same bits, new name: converted in place");
        assert_eq!(ctx.obj_type(obj), Some(renamed_t));
        assert_eq!(read_int(ctx.objects.payload(obj), 0, 4, true), 13);
    }
}
