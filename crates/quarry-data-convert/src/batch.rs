use quarry_data_model::scalar::{read_float, read_int, read_slot, read_uint, write_float, write_slot, write_uint};
use quarry_data_model::{
    graph, BufRef, IntDesc, ObjRef, OpenArrayBuf, RuntimeContext, StrRef, TypeDesc, TypeKind,
    TypeRef, TypeSlot, ValueFlags,
};

use crate::{convert, ConvertError, DEFAULT_DEPTH};
use quarry_data_model::ConvertFlags;

/// Element-wise structural transcoding between two independently described
/// memory regions.
///
/// `src`/`dst` are payload buffers in canonical in-memory form (scalars
/// little-endian, out-of-line slots holding arena indices). Converts `count`
/// elements laid out with the given strides. `convert_ptrs` controls whether
/// referenced objects are themselves coerced to the destination's declared
/// pointee types.
///
/// A failed element aborts the whole batch; the destination is not guaranteed
/// consistent for that element, so callers must treat any failure as aborting
/// the batch.
pub fn batch_convert(
    ctx: &mut RuntimeContext,
    src: &[u8],
    src_stride: u32,
    src_type: Option<TypeRef>,
    dst: &mut [u8],
    dst_stride: u32,
    dst_type: TypeRef,
    count: u32,
    convert_ptrs: bool,
) -> Result<(), ConvertError> {
    batch_inner(
        ctx,
        src,
        0,
        src_stride,
        src_type,
        dst,
        0,
        dst_stride,
        dst_type,
        count,
        convert_ptrs,
    )
}

fn batch_inner(
    ctx: &mut RuntimeContext,
    src: &[u8],
    src_off: usize,
    src_stride: u32,
    src_type: Option<TypeRef>,
    dst: &mut [u8],
    dst_off: usize,
    dst_stride: u32,
    dst_type: TypeRef,
    count: u32,
    convert_ptrs: bool,
) -> Result<(), ConvertError> {
    // init-callback users convert through their alias, then run the hook
    if let TypeDesc::User(user) = ctx.types.get(dst_type) {
        if let (Some(init), Some(aliased)) = (user.init.clone(), user.aliased) {
            batch_inner(
                ctx, src, src_off, src_stride, src_type, dst, dst_off, dst_stride, aliased, count,
                convert_ptrs,
            )?;
            let size = ctx.types.size_of(aliased) as usize;
            for i in 0..count as usize {
                let at = dst_off + i * dst_stride as usize;
                init(&mut dst[at..at + size], ctx.physical.as_deref());
            }
            return Ok(());
        }
    }

    let src2 = src_type.and_then(|t| ctx.types.skip_user(t));
    let dst2 = match ctx.types.skip_user(dst_type) {
        Some(t) => t,
        None => {
            // unknown destination layout: raw copy of the source bytes
            if let Some(s2) = src2 {
                copy_elements(ctx, src, src_off, src_stride, dst, dst_off, dst_stride, s2, count);
            }
            return Ok(());
        }
    };

    // structurally identical: bulk copy, then re-own embedded heap data
    if src2.is_some()
        && ctx
            .types
            .same_shape(src2, Some(dst2), quarry_data_model::MatchCriteria::empty())
    {
        copy_elements(ctx, src, src_off, src_stride, dst, dst_off, dst_stride, dst2, count);
        return Ok(());
    }

    let src_kind = src2.map(|t| ctx.types.kind_of(t));
    let dst_kind = ctx.types.kind_of(dst2);

    // unwrap reference sources targeting non-reference destinations
    if src_kind == Some(TypeKind::Reference) && dst_kind != TypeKind::Reference {
        let reference = match ctx.types.get(src2.expect("reference source")) {
            TypeDesc::Reference(r) => r.clone(),
            _ => unreachable!(),
        };
        for i in 0..count as usize {
            let at = src_off + i * src_stride as usize;
            let child = ObjRef::from_index(read_slot(src, at, reference.wide));
            let Some(child) = child else { continue };
            let (child_ty, child_payload) = follow_redirect(ctx, child);
            batch_inner(
                ctx,
                &child_payload,
                0,
                0,
                child_ty,
                dst,
                dst_off + i * dst_stride as usize,
                0,
                dst_type,
                1,
                convert_ptrs,
            )?;
        }
        return Ok(());
    }

    // deref polymorphic sources
    if src_kind == Some(TypeKind::Virtual) && dst_kind != TypeKind::Virtual {
        let virt = match ctx.types.get(src2.expect("virtual source")) {
            TypeDesc::Virtual(virt) => virt.clone(),
            _ => unreachable!(),
        };
        let slot = virt.size.max(1) as usize;
        let stride = if src_stride == 0 { slot } else { src_stride as usize };
        let mut resolved = true;
        for i in 0..count as usize {
            let at = src_off + i * stride;
            let end = (at + slot).min(src.len()).max(at);
            let Some(obj) = virt.ops.deref(ctx, &src[at..end]) else {
                resolved = false;
                break;
            };
            let (child_ty, child_payload) = follow_redirect(ctx, obj);
            batch_inner(
                ctx,
                &child_payload,
                0,
                0,
                child_ty,
                dst,
                dst_off + i * dst_stride as usize,
                0,
                dst2,
                1,
                convert_ptrs,
            )?;
        }
        if resolved {
            return Ok(());
        }
    }

    match ctx.types.get(dst2).clone() {
        TypeDesc::Reference(refd) => {
            for i in 0..count as usize {
                let dst_at = dst_off + i * dst_stride as usize;
                let child = if src_kind == Some(TypeKind::Reference) {
                    let refs = match ctx.types.get(src2.expect("reference source")) {
                        TypeDesc::Reference(r) => r.clone(),
                        _ => unreachable!(),
                    };
                    let at = src_off + i * src_stride as usize;
                    match ObjRef::from_index(read_slot(src, at, refs.wide)) {
                        Some(p) if convert_ptrs => {
                            convert(ctx, p, refd.element, ConvertFlags::ALLOW_EXTERNALS, DEFAULT_DEPTH)
                        }
                        Some(p) => {
                            ctx.retain(p);
                            Some(p)
                        }
                        None => None,
                    }
                } else if let Some(src_ty) = src_type {
                    // box a copy of the raw element, then coerce the box
                    let size = ctx.types.size_of(src_ty) as usize;
                    let at = src_off + i * src_stride as usize;
                    let mut payload = src[at..at + size].to_vec();
                    graph::duplicate_payload(ctx, src_ty, &mut payload, 0, false);
                    let boxed =
                        ctx.alloc_with_payload(TypeSlot::Type(src_ty), None, ValueFlags::empty(), payload);
                    if convert_ptrs {
                        let converted =
                            convert(ctx, boxed, refd.element, ConvertFlags::ALLOW_EXTERNALS, DEFAULT_DEPTH);
                        ctx.release(boxed);
                        converted
                    } else {
                        Some(boxed)
                    }
                } else {
                    None
                };
                write_slot(dst, dst_at, refd.wide, child.map_or(0, ObjRef::index));
            }
            Ok(())
        }

        TypeDesc::Int(intd) => {
            let src2 = src2.ok_or(ConvertError::Unsupported {
                src: None,
                dst: TypeKind::Int,
            })?;
            match ctx.types.get(src2).clone() {
                TypeDesc::Int(ints) => {
                    let shift = i32::from(intd.frac_bits) - i32::from(ints.frac_bits);
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        let value = read_source_int(src, at, &ints);
                        let shifted = if shift < 0 {
                            value >> (-shift).min(127)
                        } else {
                            value << shift.min(127)
                        };
                        write_clamped_int(dst, dst_off + i * dst_stride as usize, &intd, shifted);
                    }
                    Ok(())
                }
                TypeDesc::Float(flts) => {
                    let factor = (1u64 << u32::from(intd.frac_bits).min(63)) as f64;
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        let value = read_float(src, at, flts.bits)
                            .ok_or(ConvertError::FloatWidth(flts.bits))?;
                        let scaled = value * factor;
                        let scaled = if scaled.is_nan() { 0.0 } else { scaled };
                        write_clamped_int(
                            dst,
                            dst_off + i * dst_stride as usize,
                            &intd,
                            clamped_to_i128(scaled),
                        );
                    }
                    Ok(())
                }
                other => Err(ConvertError::Unsupported {
                    src: Some(other.kind()),
                    dst: TypeKind::Int,
                }),
            }
        }

        TypeDesc::Float(fltd) => {
            if fltd.bits != 32 && fltd.bits != 64 {
                return Err(ConvertError::FloatWidth(fltd.bits));
            }
            let src2 = src2.ok_or(ConvertError::Unsupported {
                src: None,
                dst: TypeKind::Float,
            })?;
            let min = fltd.min_value();
            let max = fltd.max_value();
            match ctx.types.get(src2).clone() {
                TypeDesc::Int(ints) => {
                    let factor = (1u64 << u32::from(ints.frac_bits).min(63)) as f64;
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        let value = read_source_int(src, at, &ints) as f64 / factor;
                        write_float(
                            dst,
                            dst_off + i * dst_stride as usize,
                            fltd.bits,
                            value.clamp(min, max),
                        );
                    }
                    Ok(())
                }
                TypeDesc::Float(flts) => {
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        let value = read_float(src, at, flts.bits)
                            .ok_or(ConvertError::FloatWidth(flts.bits))?;
                        write_float(
                            dst,
                            dst_off + i * dst_stride as usize,
                            fltd.bits,
                            if value.is_nan() { value } else { value.clamp(min, max) },
                        );
                    }
                    Ok(())
                }
                other => Err(ConvertError::Unsupported {
                    src: Some(other.kind()),
                    dst: TypeKind::Float,
                }),
            }
        }

        TypeDesc::String(stringd) => {
            let src2 = src2.ok_or(ConvertError::Unsupported {
                src: None,
                dst: TypeKind::String,
            })?;
            match ctx.types.get(src2).clone() {
                TypeDesc::String(strings) => {
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        let units = match StrRef::from_index(read_slot(src, at, strings.wide)) {
                            Some(s) => Some(ctx.string_bytes(s).to_vec()),
                            None => None,
                        };
                        let slot = match units {
                            Some(units) => ctx.new_string(units).index(),
                            None => 0,
                        };
                        write_slot(dst, dst_off + i * dst_stride as usize, stringd.wide, slot);
                    }
                    Ok(())
                }
                TypeDesc::OpenArray(arrays) => {
                    let elem = ctx
                        .types
                        .skip_user(arrays.element)
                        .ok_or(ConvertError::UnresolvedType)?;
                    if ctx.types.kind_of(elem) != TypeKind::Int {
                        return Err(ConvertError::Unsupported {
                            src: Some(TypeKind::OpenArray),
                            dst: TypeKind::String,
                        });
                    }
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        let slot = match BufRef::from_index(read_slot(src, at, arrays.wide)) {
                            Some(b) => {
                                let buf = ctx.buffer(b).clone();
                                let units = recode_units(
                                    &buf.data,
                                    buf.count as usize,
                                    arrays.stride as usize,
                                    stringd.char_size as usize,
                                );
                                ctx.new_string(units).index()
                            }
                            None => 0,
                        };
                        write_slot(dst, dst_off + i * dst_stride as usize, stringd.wide, slot);
                    }
                    Ok(())
                }
                other => Err(ConvertError::Unsupported {
                    src: Some(other.kind()),
                    dst: TypeKind::String,
                }),
            }
        }

        TypeDesc::Array(arrayd) => {
            let dst_count = arrayd.count;
            let dst_elem_stride = arrayd.stride;
            let src2 = match src2 {
                Some(t) => t,
                None => return Ok(()),
            };
            match ctx.types.get(src2).clone() {
                TypeDesc::String(strings) => {
                    strided_clear(
                        dst,
                        dst_off,
                        dst_stride,
                        dst_elem_stride * dst_count,
                        count,
                    );
                    let elem_ty = string_elem(ctx, strings.char_size);
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        if let Some(s) = StrRef::from_index(read_slot(src, at, strings.wide)) {
                            let units = ctx.string_bytes(s).to_vec();
                            let n = (units.len() as u32 / u32::from(strings.char_size))
                                .min(dst_count);
                            batch_inner(
                                ctx,
                                &units,
                                0,
                                u32::from(strings.char_size),
                                Some(elem_ty),
                                dst,
                                dst_off + i * dst_stride as usize,
                                dst_elem_stride,
                                arrayd.element,
                                n,
                                convert_ptrs,
                            )?;
                        }
                    }
                    Ok(())
                }
                TypeDesc::Array(arrays) => {
                    // collapse matching nested ranks into one larger transfer
                    let mut dst_inner = arrayd.clone();
                    let mut src_inner = arrays;
                    let mut inner_count = dst_inner.count;
                    let mut total = inner_count;
                    loop {
                        if src_inner.count != inner_count {
                            break;
                        }
                        let (d_sub, s_sub) = (
                            ctx.types.get(dst_inner.element).clone(),
                            ctx.types.get(src_inner.element).clone(),
                        );
                        match (d_sub, s_sub) {
                            (TypeDesc::Array(d), TypeDesc::Array(s)) => {
                                dst_inner = d;
                                src_inner = s;
                                inner_count = dst_inner.count;
                                total *= inner_count;
                            }
                            _ => break,
                        }
                    }

                    let mut src_stride_outer = src_stride;
                    let mut dst_stride_outer = dst_stride;
                    let mut src_stride_inner = src_inner.stride;
                    let mut dst_stride_inner = dst_inner.stride;
                    let mut outer = count;
                    let mut inner_total = total;

                    if src_inner.count >= inner_count {
                        // iterate over whichever side carries more elements
                        if outer > inner_total {
                            std::mem::swap(&mut src_stride_outer, &mut src_stride_inner);
                            std::mem::swap(&mut dst_stride_outer, &mut dst_stride_inner);
                            std::mem::swap(&mut outer, &mut inner_total);
                        }
                        for i in 0..outer as usize {
                            batch_inner(
                                ctx,
                                src,
                                src_off + i * src_stride_outer as usize,
                                src_stride_inner,
                                Some(src_inner.element),
                                dst,
                                dst_off + i * dst_stride_outer as usize,
                                dst_stride_inner,
                                dst_inner.element,
                                inner_total,
                                convert_ptrs,
                            )?;
                        }
                    } else {
                        strided_clear(
                            dst,
                            dst_off,
                            dst_stride,
                            dst_elem_stride * dst_count,
                            count,
                        );
                        for i in 0..src_inner.count as usize {
                            batch_inner(
                                ctx,
                                src,
                                src_off + i * src_stride_inner as usize,
                                src_stride_outer,
                                Some(src_inner.element),
                                dst,
                                dst_off + i * dst_stride_inner as usize,
                                dst_stride_outer,
                                dst_inner.element,
                                count,
                                convert_ptrs,
                            )?;
                        }
                    }
                    Ok(())
                }
                TypeDesc::OpenArray(arrays) => {
                    for i in 0..count as usize {
                        let at = src_off + i * src_stride as usize;
                        if let Some(b) = BufRef::from_index(read_slot(src, at, arrays.wide)) {
                            let buf = ctx.buffer(b).clone();
                            let n = buf.count.min(dst_count);
                            batch_inner(
                                ctx,
                                &buf.data,
                                0,
                                arrays.stride,
                                Some(arrays.element),
                                dst,
                                dst_off + i * dst_stride as usize,
                                dst_elem_stride,
                                arrayd.element,
                                n,
                                convert_ptrs,
                            )?;
                        }
                    }
                    Ok(())
                }
                _ => {
                    // scalar broadcast into the leading element
                    strided_clear(
                        dst,
                        dst_off,
                        dst_stride,
                        dst_elem_stride * dst_count,
                        count,
                    );
                    batch_inner(
                        ctx,
                        src,
                        src_off,
                        src_stride,
                        src_type,
                        dst,
                        dst_off,
                        dst_stride,
                        arrayd.element,
                        count,
                        convert_ptrs,
                    )
                }
            }
        }

        TypeDesc::OpenArray(arrayd) => {
            let src2 = match src2 {
                Some(t) => t,
                None => return Ok(()),
            };
            for i in 0..count as usize {
                let dst_at = dst_off + i * dst_stride as usize;
                let src_at = src_off + i * src_stride as usize;

                let (src_bytes, src_elem_stride, src_elem_ty, n): (Vec<u8>, u32, Option<TypeRef>, u32) =
                    match ctx.types.get(src2).clone() {
                        TypeDesc::String(strings) => {
                            match StrRef::from_index(read_slot(src, src_at, strings.wide)) {
                                Some(s) => {
                                    let units = ctx.string_bytes(s).to_vec();
                                    let n = units.len() as u32 / u32::from(strings.char_size);
                                    let elem = string_elem(ctx, strings.char_size);
                                    (units, u32::from(strings.char_size), Some(elem), n)
                                }
                                None => {
                                    write_slot(dst, dst_at, arrayd.wide, 0);
                                    continue;
                                }
                            }
                        }
                        TypeDesc::Array(arrays) => {
                            let size = (arrays.stride * arrays.count) as usize;
                            (
                                src[src_at..src_at + size].to_vec(),
                                arrays.stride,
                                Some(arrays.element),
                                arrays.count,
                            )
                        }
                        TypeDesc::OpenArray(arrays) => {
                            match BufRef::from_index(read_slot(src, src_at, arrays.wide)) {
                                Some(b) => {
                                    let buf = ctx.buffer(b).clone();
                                    (buf.data, arrays.stride, Some(arrays.element), buf.count)
                                }
                                None => {
                                    write_slot(dst, dst_at, arrayd.wide, 0);
                                    continue;
                                }
                            }
                        }
                        other => {
                            return Err(ConvertError::Unsupported {
                                src: Some(other.kind()),
                                dst: TypeKind::OpenArray,
                            })
                        }
                    };

                // build the destination buffer locally so a failed element
                // tears it down instead of leaking a partial allocation
                let mut data = vec![0u8; (arrayd.stride * n) as usize];
                if n > 0 {
                    batch_inner(
                        ctx,
                        &src_bytes,
                        0,
                        src_elem_stride,
                        src_elem_ty,
                        &mut data,
                        0,
                        arrayd.stride,
                        arrayd.element,
                        n,
                        convert_ptrs,
                    )?;
                }
                let buf = ctx.new_buffer(OpenArrayBuf { count: n, data });
                write_slot(dst, dst_at, arrayd.wide, buf.index());
            }
            Ok(())
        }

        TypeDesc::Composite(compd) => {
            let src2 = src2.ok_or(ConvertError::Unsupported {
                src: None,
                dst: TypeKind::Composite,
            })?;
            match ctx.types.get(src2).clone() {
                TypeDesc::Composite(comps) => {
                    if let Some(defaults) = compd.defaults.clone() {
                        for i in 0..count as usize {
                            let at = dst_off + i * dst_stride as usize;
                            dst[at..at + defaults.len()].copy_from_slice(&defaults);
                            graph::duplicate_payload(ctx, dst2, dst, at, false);
                        }
                    }
                    for field in &compd.fields {
                        let matched = field
                            .id
                            .as_ref()
                            .and_then(|id| comps.find(id))
                            .map(|e| (e.offset, e.ty));
                        if let Some((src_field_off, src_field_ty)) = matched {
                            batch_inner(
                                ctx,
                                src,
                                src_off + src_field_off as usize,
                                src_stride,
                                Some(src_field_ty),
                                dst,
                                dst_off + field.offset as usize,
                                dst_stride,
                                field.ty,
                                count,
                                convert_ptrs,
                            )?;
                        } else if ctx
                            .types
                            .skip_user(field.ty)
                            .map_or(false, |t| ctx.types.kind_of(t) == TypeKind::Composite)
                        {
                            // flattened-inheritance promotion from the whole source
                            let _ = batch_inner(
                                ctx,
                                src,
                                src_off,
                                src_stride,
                                Some(src2),
                                dst,
                                dst_off + field.offset as usize,
                                dst_stride,
                                field.ty,
                                count,
                                convert_ptrs,
                            );
                        }
                    }
                    Ok(())
                }
                TypeDesc::OpenArray(arrays) => {
                    let elem_is_ref = ctx
                        .types
                        .skip_user(arrays.element)
                        .map_or(false, |t| ctx.types.kind_of(t) == TypeKind::Reference);
                    if !elem_is_ref {
                        return Err(ConvertError::Unsupported {
                            src: Some(TypeKind::OpenArray),
                            dst: TypeKind::Composite,
                        });
                    }
                    for i in 0..count as usize {
                        let src_at = src_off + i * src_stride as usize;
                        let children: Vec<ObjRef> =
                            match BufRef::from_index(read_slot(src, src_at, arrays.wide)) {
                                Some(b) => {
                                    let buf = ctx.buffer(b).clone();
                                    (0..buf.count as usize)
                                        .filter_map(|j| {
                                            ObjRef::from_index(read_slot(
                                                &buf.data,
                                                j * arrays.stride as usize,
                                                false,
                                            ))
                                        })
                                        .collect()
                                }
                                None => Vec::new(),
                            };
                        let mut got = 0usize;
                        for field in &compd.fields {
                            let Some(field_id) = field.id.as_ref() else { continue };
                            let child = children.iter().copied().find(|&c| {
                                ctx.objects.header(c).id.as_ref() == Some(field_id)
                            });
                            if let Some(child) = child {
                                let (child_ty, child_payload) = follow_redirect(ctx, child);
                                batch_inner(
                                    ctx,
                                    &child_payload,
                                    0,
                                    0,
                                    child_ty,
                                    dst,
                                    dst_off + i * dst_stride as usize + field.offset as usize,
                                    0,
                                    field.ty,
                                    1,
                                    convert_ptrs,
                                )?;
                                got += 1;
                            }
                        }
                        if got * 2 < compd.fields.len() {
                            return Err(ConvertError::CompositeMismatch {
                                matched: got,
                                total: compd.fields.len(),
                            });
                        }
                    }
                    Ok(())
                }
                TypeDesc::Array(arrays) => {
                    let n = (arrays.count as usize).min(compd.fields.len());
                    for (i, field) in compd.fields.iter().take(n).enumerate() {
                        batch_inner(
                            ctx,
                            src,
                            src_off + i * arrays.stride as usize,
                            src_stride,
                            Some(arrays.element),
                            dst,
                            dst_off + field.offset as usize,
                            dst_stride,
                            field.ty,
                            count,
                            convert_ptrs,
                        )?;
                    }
                    Ok(())
                }
                other => Err(ConvertError::Unsupported {
                    src: Some(other.kind()),
                    dst: TypeKind::Composite,
                }),
            }
        }

        TypeDesc::Virtual(virt) => {
            let size = virt.size.max(1) as usize;
            for i in 0..count as usize {
                let dst_at = dst_off + i * dst_stride as usize;
                let src_at = src_off + i * src_stride as usize;
                let src_end = (src_at + src_stride.max(1) as usize).min(src.len()).max(src_at);
                let mut slot = dst[dst_at..dst_at + size].to_vec();
                let ok = virt
                    .ops
                    .convert(ctx, &mut slot, src2, &src[src_at..src_end]);
                if !ok {
                    return Err(ConvertError::VirtualRejected);
                }
                dst[dst_at..dst_at + size].copy_from_slice(&slot);
            }
            Ok(())
        }

        TypeDesc::User(_) => unreachable!("destination was skipped to a concrete type"),
    }
}

/// Copies `count` elements of type `t` and re-owns any embedded heap data so
/// the destination never aliases source allocations.
fn copy_elements(
    ctx: &mut RuntimeContext,
    src: &[u8],
    src_off: usize,
    src_stride: u32,
    dst: &mut [u8],
    dst_off: usize,
    dst_stride: u32,
    t: TypeRef,
    count: u32,
) {
    let size = ctx.types.size_of(t) as usize;
    let plain = ctx.types.is_plain_data(t, false);
    for i in 0..count as usize {
        let s = src_off + i * src_stride.max(size as u32) as usize;
        let d = dst_off + i * dst_stride.max(size as u32) as usize;
        dst[d..d + size].copy_from_slice(&src[s..s + size]);
        if !plain {
            graph::duplicate_payload(ctx, t, dst, d, false);
        }
    }
}

fn strided_clear(dst: &mut [u8], dst_off: usize, stride: u32, size: u32, count: u32) {
    for i in 0..count as usize {
        let at = dst_off + i * stride.max(size) as usize;
        dst[at..at + size as usize].fill(0);
    }
}

/// The builtin integer type matching one string code unit.
fn string_elem(ctx: &RuntimeContext, char_size: u8) -> TypeRef {
    let b = ctx.types.builtin();
    match char_size {
        2 => b.u16,
        4 => b.u32,
        8 => b.u64,
        _ => b.u8,
    }
}

/// Re-encodes code units between widths by numeric cast.
fn recode_units(data: &[u8], count: usize, src_unit: usize, dst_unit: usize) -> Vec<u8> {
    let mut out = vec![0u8; count * dst_unit];
    for i in 0..count {
        let unit = read_uint(data, i * src_unit, src_unit);
        write_uint(&mut out, i * dst_unit, dst_unit, unit);
    }
    out
}

fn read_source_int(src: &[u8], offset: usize, desc: &IntDesc) -> i128 {
    if desc.signed {
        i128::from(read_int(src, offset, desc.size() as usize, true))
    } else {
        i128::from(read_uint(src, offset, desc.size() as usize))
    }
}

fn write_clamped_int(dst: &mut [u8], offset: usize, desc: &IntDesc, value: i128) {
    let clamped = value.clamp(i128::from(desc.min_value()), i128::from(desc.max_value()));
    write_uint(dst, offset, desc.size() as usize, clamped as u64);
}

fn clamped_to_i128(value: f64) -> i128 {
    if value >= i128::MAX as f64 {
        i128::MAX
    } else if value <= i128::MIN as f64 {
        i128::MIN
    } else {
        value as i128
    }
}

/// Follows redirect headers down to the object that actually holds data,
/// returning its type and a copy of its payload.
pub(crate) fn follow_redirect(ctx: &RuntimeContext, obj: ObjRef) -> (Option<TypeRef>, Vec<u8>) {
    let mut current = obj;
    for _ in 0..32 {
        let header = ctx.objects.header(current);
        if !header.flags.contains(ValueFlags::REDIRECT) {
            break;
        }
        match ObjRef::from_index(read_slot(ctx.objects.payload(current), 0, false)) {
            Some(next) => current = next,
            None => break,
        }
    }
    (ctx.obj_type(current), ctx.payload_copy(current))
}

/// Single-element assignment between two typed objects, in the byte-buffer
/// call shape.
pub fn assign(
    ctx: &mut RuntimeContext,
    dst_obj: ObjRef,
    src_obj: ObjRef,
    convert_ptrs: bool,
) -> Result<(), ConvertError> {
    let dst_ty = match ctx.obj_type(dst_obj) {
        Some(t) => t,
        None => return Err(ConvertError::UnresolvedType),
    };
    let (src_ty, src_payload) = follow_redirect(ctx, src_obj);
    let mut dst_payload = ctx.objects.swap_payload(dst_obj, Vec::new());
    let result = batch_convert(
        ctx,
        &src_payload,
        0,
        src_ty,
        &mut dst_payload,
        0,
        dst_ty,
        1,
        convert_ptrs,
    );
    ctx.objects.swap_payload(dst_obj, dst_payload);
    result
}

/// Non-pointer-chasing assignment: coerce `src` bytes into `dst` as a pure
/// value operation.
pub fn soft_set(
    ctx: &mut RuntimeContext,
    dst: &mut [u8],
    dst_type: TypeRef,
    src: &[u8],
    src_type: Option<TypeRef>,
) -> Result<(), ConvertError> {
    batch_convert(ctx, src, 0, src_type, dst, 0, dst_type, 1, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_data_model::scalar::{read_float as rf, read_int as ri, write_float as wf, write_int as wi};
    use quarry_data_model::{CompositeBuilder, IntDesc, Label, StringDesc, TypeDesc};

    fn int_type(ctx: &mut RuntimeContext, bits: u8, frac: u8, signed: bool) -> TypeRef {
        ctx.types.add(TypeDesc::Int(IntDesc {
            bits,
            frac_bits: frac,
            signed,
            enums: None,
        }))
    }

    #[test]
    fn int_conversion_clamps_instead_of_wrapping() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let u8_t = ctx.types.builtin().u8;
        let i8_t = ctx.types.builtin().i8;

        let mut src = [0u8; 4];
        let mut dst = [0u8; 1];

        wi(&mut src, 0, 4, 300);
        batch_convert(&mut ctx, &src, 0, Some(i32_t), &mut dst, 0, u8_t, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 1, false), 255);

        wi(&mut src, 0, 4, -5);
        batch_convert(&mut ctx, &src, 0, Some(i32_t), &mut dst, 0, u8_t, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 1, false), 0);

        wi(&mut src, 0, 4, -200);
        batch_convert(&mut ctx, &src, 0, Some(i32_t), &mut dst, 0, i8_t, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 1, true), -128);
    }

    #[test]
    fn fixed_point_shifts_by_fractional_difference() {
        let mut ctx = RuntimeContext::new();
        let fx8 = int_type(&mut ctx, 16, 8, true); // 8.8 fixed point
        let i32_t = ctx.types.builtin().i32;

        // 2.5 in 8.8 is 640; integer conversion floors to 2
        let mut src = [0u8; 2];
        wi(&mut src, 0, 2, 640);
        let mut dst = [0u8; 4];
        batch_convert(&mut ctx, &src, 0, Some(fx8), &mut dst, 0, i32_t, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 4, true), 2);

        // 3 as integer becomes 768 in 8.8
        let mut src = [0u8; 4];
        wi(&mut src, 0, 4, 3);
        let mut dst = [0u8; 2];
        batch_convert(&mut ctx, &src, 0, Some(i32_t), &mut dst, 0, fx8, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 2, true), 768);
    }

    #[test]
    fn float_to_int_clamps_to_range() {
        let mut ctx = RuntimeContext::new();
        let f32_t = ctx.types.builtin().f32;
        let i16_t = ctx.types.builtin().i16;

        let mut src = [0u8; 4];
        wf(&mut src, 0, 32, 1.0e10);
        let mut dst = [0u8; 2];
        batch_convert(&mut ctx, &src, 0, Some(f32_t), &mut dst, 0, i16_t, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 2, true), i64::from(i16::MAX));

        wf(&mut src, 0, 32, -1.0e10);
        batch_convert(&mut ctx, &src, 0, Some(f32_t), &mut dst, 0, i16_t, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 2, true), i64::from(i16::MIN));
    }

    #[test]
    fn int_to_float_round_trips_small_values() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let f32_t = ctx.types.builtin().f32;

        let mut src = [0u8; 4];
        wi(&mut src, 0, 4, 7);
        let mut dst = [0u8; 4];
        batch_convert(&mut ctx, &src, 0, Some(i32_t), &mut dst, 0, f32_t, 1, false).unwrap();
        assert_eq!(rf(&dst, 0, 32), Some(7.0));
    }

    #[test]
    fn composite_fields_match_by_name_and_keep_defaults() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let f32_t = ctx.types.builtin().f32;

        let src_desc = CompositeBuilder::new()
            .field(&ctx.types, "x", i32_t)
            .field(&ctx.types, "y", i32_t)
            .build();
        let src_t = ctx.types.add(TypeDesc::Composite(src_desc));

        let mut defaults = vec![0u8; 12];
        wi(&mut defaults, 8, 4, 9); // w defaults to 9
        let dst_desc = CompositeBuilder::new()
            .field(&ctx.types, "y", i32_t)
            .field(&ctx.types, "z", f32_t)
            .field(&ctx.types, "w", i32_t)
            .build_with_defaults(defaults);
        let dst_t = ctx.types.add(TypeDesc::Composite(dst_desc));

        let mut src = vec![0u8; 8];
        wi(&mut src, 0, 4, 11); // x, dropped silently
        wi(&mut src, 4, 4, 22); // y, carried
        let mut dst = vec![0u8; 12];
        batch_convert(&mut ctx, &src, 0, Some(src_t), &mut dst, 0, dst_t, 1, false).unwrap();

        assert_eq!(ri(&dst, 0, 4, true), 22);
        assert_eq!(rf(&dst, 4, 32), Some(0.0));
        assert_eq!(ri(&dst, 8, 4, true), 9);
    }

    #[test]
    fn same_type_conversion_is_a_deep_copy() {
        let mut ctx = RuntimeContext::new();
        let str_t = ctx.types.add(TypeDesc::String(StringDesc::narrow()));
        let i32_t = ctx.types.builtin().i32;
        let desc = CompositeBuilder::new()
            .field(&ctx.types, "name", str_t)
            .field(&ctx.types, "age", i32_t)
            .build();
        let comp_t = ctx.types.add(TypeDesc::Composite(desc));

        let name = ctx.new_string(b"granite".to_vec());
        let mut src = vec![0u8; 8];
        write_slot(&mut src, 0, false, name.index());
        wi(&mut src, 4, 4, 41);

        let mut dst = vec![0u8; 8];
        batch_convert(&mut ctx, &src, 0, Some(comp_t), &mut dst, 0, comp_t, 1, false).unwrap();

        let copied = StrRef::from_index(read_slot(&dst, 0, false)).unwrap();
        assert_ne!(copied, name, "destination must not alias source heap data");
        assert_eq!(ctx.string_bytes(copied), b"granite");
        assert_eq!(ri(&dst, 4, 4, true), 41);

        // converting the copy again produces an equal value
        let mut dst2 = vec![0u8; 8];
        batch_convert(&mut ctx, &dst, 0, Some(comp_t), &mut dst2, 0, comp_t, 1, false).unwrap();
        let copied2 = StrRef::from_index(read_slot(&dst2, 0, false)).unwrap();
        assert_eq!(ctx.string_bytes(copied2), b"granite");
        assert_eq!(ri(&dst2, 4, 4, true), 41);
    }

    #[test]
    fn string_and_char_array_interconvert() {
        let mut ctx = RuntimeContext::new();
        let u8_t = ctx.types.builtin().u8;
        let str_t = ctx.types.add(TypeDesc::String(StringDesc::narrow()));
        let chars_t = ctx.types.open_array_of(u8_t);

        let text = ctx.new_string(b"ore".to_vec());
        let mut src = vec![0u8; 4];
        write_slot(&mut src, 0, false, text.index());

        // string -> open array of bytes
        let mut dst = vec![0u8; 4];
        batch_convert(&mut ctx, &src, 0, Some(str_t), &mut dst, 0, chars_t, 1, false).unwrap();
        let buf = BufRef::from_index(read_slot(&dst, 0, false)).unwrap();
        assert_eq!(ctx.buffer(buf).count, 3);
        assert_eq!(ctx.buffer(buf).data, b"ore");

        // and back
        let mut dst2 = vec![0u8; 4];
        batch_convert(&mut ctx, &dst, 0, Some(chars_t), &mut dst2, 0, str_t, 1, false).unwrap();
        let round = StrRef::from_index(read_slot(&dst2, 0, false)).unwrap();
        assert_eq!(ctx.string_bytes(round), b"ore");
    }

    #[test]
    fn nested_arrays_flatten_into_one_transfer() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let f32_t = ctx.types.builtin().f32;
        let src_row = ctx.types.array_of(i32_t, 2);
        let src_t = ctx.types.array_of(src_row, 2);
        let dst_row = ctx.types.array_of(f32_t, 2);
        let dst_t = ctx.types.array_of(dst_row, 2);

        let mut src = vec![0u8; 16];
        for (i, v) in [1, 2, 3, 4].iter().enumerate() {
            wi(&mut src, i * 4, 4, *v);
        }
        let mut dst = vec![0u8; 16];
        batch_convert(&mut ctx, &src, 0, Some(src_t), &mut dst, 0, dst_t, 1, false).unwrap();
        for (i, v) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            assert_eq!(rf(&dst, i * 4, 32), Some(*v));
        }
    }

    #[test]
    fn open_array_destination_sizes_to_source() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let f32_t = ctx.types.builtin().f32;
        let src_t = ctx.types.array_of(i32_t, 3);
        let dst_t = ctx.types.open_array_of(f32_t);

        let mut src = vec![0u8; 12];
        for (i, v) in [5, 6, 7].iter().enumerate() {
            wi(&mut src, i * 4, 4, *v);
        }
        let mut dst = vec![0u8; 4];
        batch_convert(&mut ctx, &src, 0, Some(src_t), &mut dst, 0, dst_t, 1, false).unwrap();
        let buf = BufRef::from_index(read_slot(&dst, 0, false)).unwrap();
        assert_eq!(ctx.buffer(buf).count, 3);
        for (i, v) in [5.0, 6.0, 7.0].iter().enumerate() {
            assert_eq!(rf(&ctx.buffer(buf).data, i * 4, 32), Some(*v));
        }
    }

    #[test]
    fn unknown_pairings_are_refused() {
        let mut ctx = RuntimeContext::new();
        let str_t = ctx.types.add(TypeDesc::String(StringDesc::narrow()));
        let f32_t = ctx.types.builtin().f32;
        let mut dst = vec![0u8; 4];
        let src = vec![0u8; 4];
        assert!(matches!(
            batch_convert(&mut ctx, &src, 0, Some(str_t), &mut dst, 0, f32_t, 1, false),
            Err(ConvertError::Unsupported { .. })
        ));
    }

    #[test]
    fn composite_promotes_unmatched_composite_fields() {
        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;

        // source: { x: i32 }
        let base = CompositeBuilder::new().field(&ctx.types, "x", i32_t).build();
        let base_t = ctx.types.add(TypeDesc::Composite(base));

        // destination: { base: { x: i32 }, extra: i32 } - "base" is absent
        // from the source by name, so it is filled from the whole source
        let inner = CompositeBuilder::new().field(&ctx.types, "x", i32_t).build();
        let inner_t = ctx.types.add(TypeDesc::Composite(inner));
        let outer = CompositeBuilder::new()
            .field(&ctx.types, "base", inner_t)
            .field(&ctx.types, "extra", i32_t)
            .build();
        let outer_t = ctx.types.add(TypeDesc::Composite(outer));

        let mut src = vec![0u8; 4];
        wi(&mut src, 0, 4, 77);
        let mut dst = vec![0u8; 8];
        batch_convert(&mut ctx, &src, 0, Some(base_t), &mut dst, 0, outer_t, 1, false).unwrap();
        assert_eq!(ri(&dst, 0, 4, true), 77);
        assert_eq!(ri(&dst, 4, 4, true), 0);
    }

    #[test]
    fn user_init_callback_runs_after_conversion() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let mut ctx = RuntimeContext::new();
        let i32_t = ctx.types.builtin().i32;
        let user_t = ctx.types.add(TypeDesc::User(quarry_data_model::UserDesc {
            name: Label::text("counted"),
            aliased: Some(i32_t),
            flags: quarry_data_model::UserFlags::WRITE_TO_BIN,
            init: Some(Arc::new(|payload: &mut [u8], _phys: Option<&[u8]>| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                // the hook sees the converted value
                assert_eq!(payload[0], 3);
            })),
        }));

        let mut src = [0u8; 4];
        wi(&mut src, 0, 4, 3);
        let mut dst = [0u8; 4];
        batch_convert(&mut ctx, &src, 0, Some(i32_t), &mut dst, 0, user_t, 1, false).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(ri(&dst, 0, 4, true), 3);
    }
}
