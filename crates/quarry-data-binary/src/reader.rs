use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, warn};
use quarry_data_convert::{batch_convert, convert, DEFAULT_DEPTH};
use quarry_data_model::scalar::write_slot;
use quarry_data_model::{
    graph, ArrayDesc, CompositeDesc, ConvertFlags, EnumValue, Field, FloatDesc, IntDesc, Label,
    MatchCriteria, ObjRef, OpenArrayBuf, OpenArrayDesc, RefDesc, RuntimeContext, StringDesc,
    TypeDesc, TypeEntryFlags, TypeRef, TypeSlot, UserDesc, UserFlags, ValueFlags,
};
use quarry_utils::HashMap;

use crate::{kind, type_word, BinFlags, BinaryError, RawValue, VALUE_HEADER_SIZE};

/// Bounded chunk size for draining the physical region when it cannot be
/// transferred in one read.
const PHYS_CHUNK: usize = 1 << 20;

/// Loads a container from a stream. The header-declared prefix is the
/// logical blob; trailing bytes become the context's physical region, read
/// in bounded chunks. Returns the root object.
pub fn load<R: Read>(
    ctx: &mut RuntimeContext,
    reader: &mut R,
    flags: BinFlags,
) -> Result<ObjRef, BinaryError> {
    let mut header_bytes = [0u8; VALUE_HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = RawValue::read(&header_bytes, 0).ok_or(BinaryError::Truncated(0))?;

    let declared = header.user as usize;
    let mut blob = header_bytes.to_vec();
    if declared > VALUE_HEADER_SIZE {
        blob.resize(declared, 0);
        reader.read_exact(&mut blob[VALUE_HEADER_SIZE..])?;
    } else {
        reader.read_to_end(&mut blob)?;
    }

    // anything past the logical blob is the separately-managed physical
    // region
    let mut physical = Vec::new();
    let mut chunk = vec![0u8; PHYS_CHUNK];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        physical.extend_from_slice(&chunk[..n]);
    }
    ctx.physical = if physical.is_empty() {
        None
    } else {
        Some(physical)
    };

    load_blob(ctx, &blob, flags)
}

/// Loads a container from bytes already in memory.
pub fn load_bytes(
    ctx: &mut RuntimeContext,
    bytes: &[u8],
    flags: BinFlags,
) -> Result<ObjRef, BinaryError> {
    let header = RawValue::read(bytes, 0).ok_or(BinaryError::Truncated(0))?;
    let declared = header.user as usize;
    let (blob, physical) = if declared >= VALUE_HEADER_SIZE && declared < bytes.len() {
        bytes.split_at(declared)
    } else {
        (bytes, &bytes[bytes.len()..])
    };
    ctx.physical = if physical.is_empty() {
        None
    } else {
        Some(physical.to_vec())
    };
    load_blob(ctx, blob, flags)
}

fn load_blob(
    ctx: &mut RuntimeContext,
    blob: &[u8],
    flags: BinFlags,
) -> Result<ObjRef, BinaryError> {
    let mut fixer = Fixer {
        flags,
        values: HashMap::default(),
        types: HashMap::default(),
    };
    let root = fix_value(ctx, &mut fixer, blob, 0).ok_or(BinaryError::Truncated(0))?;
    ctx.objects.header_mut(root).flags |= ValueFlags::ROOT;
    debug!(
        "loaded container: {} bytes, {} objects, {} type entries",
        blob.len(),
        fixer.values.len(),
        fixer.types.len()
    );
    Ok(root)
}

/// One fix-up pass over a loaded blob: rewrites file-relative offsets into
/// arena handles, resolves types against the registry, and repairs
/// structural mismatches through the conversion engine.
struct Fixer {
    flags: BinFlags,
    /// header offset -> fixed object (memo doubles as the PROCESSED mark)
    values: HashMap<u32, Option<ObjRef>>,
    /// type-table offset -> (resolved handle, dodgy)
    types: HashMap<u32, (TypeRef, bool)>,
}

/// A locally unrecoverable piece of data: offsets out of range, malformed
/// table entries. Recovery zero-fills the enclosing field.
struct FixFault;

fn blob_u16(blob: &[u8], at: usize) -> Result<u16, FixFault> {
    blob.get(at..at + 2)
        .map(LittleEndian::read_u16)
        .ok_or(FixFault)
}

fn blob_u32(blob: &[u8], at: usize) -> Result<u32, FixFault> {
    blob.get(at..at + 4)
        .map(LittleEndian::read_u32)
        .ok_or(FixFault)
}

fn blob_u64(blob: &[u8], at: usize) -> Result<u64, FixFault> {
    blob.get(at..at + 8)
        .map(LittleEndian::read_u64)
        .ok_or(FixFault)
}

/// Reads a zero-terminated run of `unit`-byte code units.
fn blob_units(blob: &[u8], at: usize, unit: usize) -> Result<Vec<u8>, FixFault> {
    let mut end = at;
    loop {
        let code = blob.get(end..end + unit).ok_or(FixFault)?;
        if code.iter().all(|&b| b == 0) {
            return Ok(blob[at..end].to_vec());
        }
        end += unit;
    }
}

fn blob_name(blob: &[u8], at: usize) -> Result<String, FixFault> {
    let units = blob_units(blob, at, 1)?;
    String::from_utf8(units).map_err(|_| FixFault)
}

/// Decodes a member identifier per the enclosing entry's CRC policy.
fn member_label(blob: &[u8], raw: u32, crc_ids: bool) -> Result<Option<Label>, FixFault> {
    if raw == 0 {
        return Ok(None);
    }
    if crc_ids {
        Ok(Some(Label::Crc(raw)))
    } else {
        Ok(Some(Label::Text(blob_name(blob, raw as usize)?)))
    }
}

/// Resolves one type-table entry, memoized. The second return is the
/// *dodgy* mark: the entry (or a child) could not be reconciled and must not
/// be trusted for direct reinterpretation.
fn fix_type(
    ctx: &mut RuntimeContext,
    fixer: &mut Fixer,
    blob: &[u8],
    offset: u32,
) -> (Option<TypeRef>, bool) {
    if offset == 0 {
        return (None, false);
    }
    if let Some(&(t, dodgy)) = fixer.types.get(&offset) {
        return (Some(t), dodgy);
    }

    let parsed = parse_type(ctx, fixer, blob, offset);
    match parsed {
        Ok((t, dodgy)) => {
            ctx.types.set_entry_flags(t, TypeEntryFlags::FIXED);
            if dodgy {
                ctx.types.set_entry_flags(t, TypeEntryFlags::DODGY);
            }
            fixer.types.insert(offset, (t, dodgy));
            (Some(t), dodgy)
        }
        Err(FixFault) => {
            warn!("malformed type entry at offset {}", offset);
            let placeholder = ctx.types.add(TypeDesc::Int(IntDesc::plain(8, false)));
            ctx.types
                .set_entry_flags(placeholder, TypeEntryFlags::FIXED | TypeEntryFlags::DODGY);
            fixer.types.insert(offset, (placeholder, true));
            (Some(placeholder), true)
        }
    }
}

fn parse_type(
    ctx: &mut RuntimeContext,
    fixer: &mut Fixer,
    blob: &[u8],
    offset: u32,
) -> Result<(TypeRef, bool), FixFault> {
    let at = offset as usize;
    let word = blob_u16(blob, at)?;
    let param1 = *blob.get(at + 2).ok_or(FixFault)?;
    let param2 = *blob.get(at + 3).ok_or(FixFault)?;
    let wide = word & type_word::WIDE != 0;

    // well-known shapes collapse onto the canonical builtin descriptors so
    // separately-loaded containers share one instance
    match word & type_word::KIND_MASK {
        kind::FLOAT if param1 == 0 || (param1 == 32 && param2 == 8) => {
            return Ok((ctx.types.builtin().f32, false));
        }
        kind::FLOAT if param1 == 64 && param2 == 11 => {
            return Ok((ctx.types.builtin().f64, false));
        }
        kind::STRING if !wide && (word & type_word::CHAR_SIZE_MASK) == 0 => {
            return Ok((ctx.types.builtin().string, false));
        }
        _ => {}
    }

    // reserve the handle before descending so recursive entries terminate
    let placeholder = ctx.types.add(TypeDesc::Int(IntDesc::plain(8, false)));
    fixer.types.insert(offset, (placeholder, false));

    let mut dodgy = false;
    let desc = match word & type_word::KIND_MASK {
        kind::INT => {
            let signed = word & type_word::SIGNED != 0;
            let enums = if word & type_word::ENUM != 0 {
                let crc_ids = word & type_word::ENUM_CRC_IDS != 0;
                let count = blob_u32(blob, at + 4)? as usize;
                let value_size = if param1 > 32 { 8 } else { 4 };
                let mut values = Vec::with_capacity(count.min(4096));
                let mut entry = at + 8;
                for _ in 0..count {
                    let id = member_label(blob, blob_u32(blob, entry)?, crc_ids)?
                        .ok_or(FixFault)?;
                    let value = if value_size == 8 {
                        blob_u64(blob, entry + 4)?
                    } else {
                        u64::from(blob_u32(blob, entry + 4)?)
                    };
                    values.push(EnumValue { id, value });
                    entry += 4 + value_size;
                }
                Some(values)
            } else {
                None
            };
            TypeDesc::Int(IntDesc {
                bits: param1,
                frac_bits: param2,
                signed,
                enums,
            })
        }

        kind::FLOAT => TypeDesc::Float(FloatDesc {
            bits: param1,
            exponent_bits: param2,
            signed: word & type_word::SIGNED != 0,
        }),

        kind::STRING => {
            let log2 = ((word & type_word::CHAR_SIZE_MASK) >> type_word::CHAR_SIZE_SHIFT) as u8;
            TypeDesc::String(StringDesc {
                char_size: 1 << log2,
                wide,
            })
        }

        kind::COMPOSITE => {
            let crc_ids = word & type_word::CRC_IDS != 0;
            let count = blob_u32(blob, at + 4)? as usize;
            let mut fields = Vec::with_capacity(count.min(4096));
            let mut size = 0u32;
            let mut align = 1u32;
            let mut entry = at + 8;
            for _ in 0..count {
                let id = member_label(blob, blob_u32(blob, entry)?, crc_ids)?;
                let (child, child_dodgy) = fix_type(ctx, fixer, blob, blob_u32(blob, entry + 4)?);
                dodgy |= child_dodgy;
                let child = child.ok_or(FixFault)?;
                let field_offset = blob_u32(blob, entry + 8)?;
                let field_size = blob_u32(blob, entry + 12)?;
                size = size.max(field_offset + field_size);
                align = align.max(ctx.types.align_of(child).max(1));
                fields.push(Field {
                    id,
                    ty: child,
                    offset: field_offset,
                    size: field_size,
                });
                entry += 16;
            }
            TypeDesc::Composite(CompositeDesc {
                fields,
                size,
                align,
                defaults: None,
            })
        }

        kind::ARRAY => {
            let count = blob_u32(blob, at + 4)?;
            let (child, child_dodgy) = fix_type(ctx, fixer, blob, blob_u32(blob, at + 8)?);
            dodgy |= child_dodgy;
            TypeDesc::Array(ArrayDesc {
                element: child.ok_or(FixFault)?,
                count,
                stride: blob_u32(blob, at + 12)?,
            })
        }

        kind::OPEN_ARRAY => {
            let (child, child_dodgy) = fix_type(ctx, fixer, blob, blob_u32(blob, at + 4)?);
            dodgy |= child_dodgy;
            TypeDesc::OpenArray(OpenArrayDesc {
                element: child.ok_or(FixFault)?,
                stride: blob_u32(blob, at + 8)?,
                wide,
            })
        }

        kind::REFERENCE => {
            let (child, child_dodgy) = fix_type(ctx, fixer, blob, blob_u32(blob, at + 4)?);
            dodgy |= child_dodgy;
            TypeDesc::Reference(RefDesc {
                element: child,
                wide,
            })
        }

        kind::USER => {
            let crc_id = word & type_word::USER_CRC_ID != 0;
            let raw_id = blob_u32(blob, at + 4)?;
            let name = member_label(blob, raw_id, crc_id)?.ok_or(FixFault)?;
            let (child, child_dodgy) = fix_type(ctx, fixer, blob, blob_u32(blob, at + 8)?);
            dodgy |= child_dodgy;

            let mut flags = UserFlags::FROM_FILE | UserFlags::WRITE_TO_BIN;
            if word & type_word::USER_CHANGE != 0 {
                flags |= UserFlags::CHANGE;
            }

            // reconcile against the registry: adopt, supersede, or conflict
            if let Some(registered) = ctx.find_user(&name) {
                let registered_aliased = match ctx.types.get(registered) {
                    TypeDesc::User(user) => user.aliased,
                    _ => None,
                };
                if registered_aliased.is_none() {
                    if let TypeDesc::User(user) = ctx.types.get_mut(registered) {
                        user.aliased = child;
                    }
                    fixer.types.insert(offset, (registered, dodgy));
                    return Ok((registered, dodgy));
                }
                if ctx
                    .types
                    .same_shape(child, registered_aliased, MatchCriteria::MATCH_NULLS)
                {
                    fixer.types.insert(offset, (registered, false));
                    return Ok((registered, false));
                }
                if !ctx.types.is_dodgy(registered) {
                    warn!("named type '{}' conflicts with registry", name);
                    *ctx.types.get_mut(placeholder) = TypeDesc::User(UserDesc {
                        name,
                        aliased: child,
                        flags,
                        init: None,
                    });
                    return Ok((placeholder, true));
                }
            }

            *ctx.types.get_mut(placeholder) = TypeDesc::User(UserDesc {
                name,
                aliased: child,
                flags,
                init: None,
            });
            ctx.register_user(placeholder);
            return Ok((placeholder, dodgy));
        }

        _ => return Err(FixFault),
    };

    *ctx.types.get_mut(placeholder) = desc;
    Ok((placeholder, dodgy))
}

/// Rebuilds a type tree with every dodgy `User` replaced by its registry
/// counterpart, so the raw bytes can be transcoded into a trustworthy shape.
fn make_corrected(ctx: &mut RuntimeContext, t: TypeRef) -> TypeRef {
    match ctx.types.get(t).clone() {
        TypeDesc::Composite(comp) => {
            let mut changed = false;
            let fields: Vec<Field> = comp
                .fields
                .iter()
                .map(|field| {
                    let corrected = make_corrected(ctx, field.ty);
                    changed |= corrected != field.ty;
                    Field {
                        id: field.id.clone(),
                        ty: corrected,
                        offset: field.offset,
                        size: field.size,
                    }
                })
                .collect();
            if !changed {
                return t;
            }
            // re-derive the layout from the corrected children
            let mut rebuilt = quarry_data_model::CompositeBuilder::new();
            for field in fields {
                rebuilt = match field.id {
                    Some(id) => rebuilt.field(&ctx.types, id, field.ty),
                    None => rebuilt.anon_field(&ctx.types, field.ty),
                };
            }
            ctx.types.add(TypeDesc::Composite(rebuilt.build()))
        }
        TypeDesc::Array(array) => {
            let corrected = make_corrected(ctx, array.element);
            if corrected == array.element {
                t
            } else {
                ctx.types.array_of(corrected, array.count)
            }
        }
        TypeDesc::OpenArray(array) => {
            let corrected = make_corrected(ctx, array.element);
            if corrected == array.element {
                t
            } else {
                ctx.types.open_array_of(corrected)
            }
        }
        TypeDesc::User(user) => {
            if !ctx.types.is_dodgy(t) {
                return t;
            }
            if let Some(registered) = ctx.find_user(&user.name) {
                return registered;
            }
            let corrected = user.aliased.map(|aliased| make_corrected(ctx, aliased));
            ctx.types.add(TypeDesc::User(UserDesc {
                name: user.name,
                aliased: corrected.or(user.aliased),
                flags: user.flags,
                init: None,
            }))
        }
        _ => t,
    }
}

/// Fixes one on-disk value, memoized by header offset, returning its live
/// object.
fn fix_value(
    ctx: &mut RuntimeContext,
    fixer: &mut Fixer,
    blob: &[u8],
    header_off: u32,
) -> Option<ObjRef> {
    if let Some(&cached) = fixer.values.get(&header_off) {
        return cached;
    }

    let Some(raw) = RawValue::read(blob, header_off as usize) else {
        fixer.values.insert(header_off, None);
        return None;
    };

    let id = if raw.flags.contains(ValueFlags::CRC_ID) {
        (raw.id != 0).then(|| Label::Crc(raw.id))
    } else if raw.id != 0 {
        blob_name(blob, raw.id as usize).ok().map(Label::Text)
    } else {
        None
    };

    let mut flags =
        (raw.flags - (ValueFlags::TEMP | ValueFlags::ROOT | ValueFlags::PROCESSED))
            | ValueFlags::PROCESSED;

    // resolve the type: table offset, or registry lookup for compact CRCs
    let (ty_slot, dodgy) = if raw.flags.contains(ValueFlags::CRC_TYPE) {
        match ctx.find_user_crc(raw.ty) {
            Some(t) => {
                flags -= ValueFlags::CRC_TYPE;
                (TypeSlot::Type(t), false)
            }
            None => {
                warn!("cannot resolve type with crc {:08x}", raw.ty);
                (TypeSlot::Crc(raw.ty), false)
            }
        }
    } else {
        match fix_type(ctx, fixer, blob, raw.ty) {
            (Some(t), dodgy) => (TypeSlot::Type(t), dodgy),
            (None, _) => (TypeSlot::None, false),
        }
    };

    // externally-backed values: eager expansion or a lazy placeholder
    if flags.contains(ValueFlags::EXTERNAL) {
        let path = blob_name(blob, header_off as usize + VALUE_HEADER_SIZE).unwrap_or_default();
        if fixer.flags.contains(BinFlags::EXPAND_EXTERNALS) {
            if let Some(resolver) = ctx.resolver() {
                if let Some(resolved) = resolver.read_external(ctx, &path) {
                    let header = ctx.objects.header_mut(resolved);
                    header.flags |= ValueFlags::EXT_REF;
                    if header.id.is_none() {
                        header.id = id;
                    }
                    fixer.values.insert(header_off, Some(resolved));
                    return Some(resolved);
                }
            }
            warn!("external '{}' could not be expanded", path);
        }
        let placeholder = ctx.alloc_external(ty_slot, &path, id);
        fixer.values.insert(header_off, Some(placeholder));
        return Some(placeholder);
    }

    let flip = flags.contains(ValueFlags::BIG_ENDIAN);
    // payloads are canonical little-endian once fixed
    flags -= ValueFlags::BIG_ENDIAN;

    let ty = ty_slot.type_ref();
    let size = ty.map_or(0, |t| ctx.types.size_of(t)) as usize;
    let data_off = header_off as usize + VALUE_HEADER_SIZE;
    let mut payload = vec![0u8; size];
    let available = blob.len().saturating_sub(data_off).min(size);
    if available > 0 {
        payload[..available].copy_from_slice(&blob[data_off..data_off + available]);
    }

    // allocate and memoize before fixing so reference cycles terminate
    let obj = ctx.alloc_with_payload(ty_slot, id, flags, Vec::new());
    fixer.values.insert(header_off, Some(obj));

    let mut has_external = false;
    if let Some(t) = ty {
        match fix_data(ctx, fixer, blob, t, &mut payload, 0, flip) {
            Ok(ext) => has_external = ext,
            Err(FixFault) => {
                warn!("unrecoverable payload at offset {}; zero-filled", header_off);
                payload.fill(0);
            }
        }
    }
    *ctx.objects.payload_mut(obj) = payload;
    if has_external {
        ctx.objects.header_mut(obj).flags |= ValueFlags::HAS_EXTERNAL;
    }

    // structural mismatch: transcode the fixed bytes into a corrected type
    // and install the replacement behind a redirect
    if dodgy {
        if let Some(t) = ty {
            let corrected = make_corrected(ctx, t);
            if corrected != t {
                debug!(
                    "repairing mismatched type at offset {}: rebuilding as corrected shape",
                    header_off
                );
                let src = ctx.payload_copy(obj);
                let mut dst = vec![0u8; ctx.types.size_of(corrected) as usize];
                let convert_ptrs = !fixer.flags.contains(BinFlags::DONT_CONVERT);
                match batch_convert(ctx, &src, 0, Some(t), &mut dst, 0, corrected, 1, convert_ptrs)
                {
                    Ok(()) => {
                        let replacement = ctx.alloc_with_payload(
                            TypeSlot::Type(corrected),
                            ctx.objects.header(obj).id.clone(),
                            ctx.objects.header(obj).flags
                                & (ValueFlags::CRC_ID | ValueFlags::HAS_EXTERNAL),
                            dst,
                        );
                        // other holders keep their pointers and follow the
                        // redirect; new readers get the replacement directly
                        let old_payload = ctx.objects.payload_mut(obj).clone();
                        graph::release_payload(ctx, t, &old_payload, 0);
                        let mut slot = vec![0u8; 4];
                        write_slot(&mut slot, 0, false, replacement.index());
                        *ctx.objects.payload_mut(obj) = slot;
                        let header = ctx.objects.header_mut(obj);
                        header.ty = TypeSlot::None;
                        header.flags |= ValueFlags::REDIRECT;
                        fixer.values.insert(header_off, Some(replacement));
                        return Some(replacement);
                    }
                    Err(err) => {
                        warn!("repair conversion failed at offset {}: {}", header_off, err);
                    }
                }
            }
        }
    }

    Some(obj)
}

/// Walks a payload by type, converting every offset-valued field into a live
/// arena handle, with endian-aware scalar fix-up. Returns whether an
/// external descendant was seen.
fn fix_data(
    ctx: &mut RuntimeContext,
    fixer: &mut Fixer,
    blob: &[u8],
    t: TypeRef,
    payload: &mut [u8],
    pay_off: usize,
    flip: bool,
) -> Result<bool, FixFault> {
    if ctx.types.is_plain_data(t, flip) {
        return Ok(false);
    }

    match ctx.types.get(t).clone() {
        TypeDesc::Int(int) => {
            swap_scalar(payload, pay_off, int.size() as usize, flip);
            Ok(false)
        }
        TypeDesc::Float(float) => {
            swap_scalar(payload, pay_off, float.size() as usize, flip);
            Ok(false)
        }

        TypeDesc::String(string) => {
            let offset = slot_value(payload, pay_off, string.wide)?;
            let index = if offset == 0 {
                0
            } else {
                let units = blob_units(blob, offset as usize, string.char_size as usize)?;
                ctx.new_string(units).index()
            };
            write_slot(payload, pay_off, string.wide, index);
            Ok(false)
        }

        TypeDesc::Composite(comp) => {
            let mut has_external = false;
            for field in &comp.fields {
                match fix_data(ctx, fixer, blob, field.ty, payload, pay_off + field.offset as usize, flip)
                {
                    Ok(ext) => has_external |= ext,
                    Err(FixFault) => {
                        // recover locally: zero this field, keep siblings
                        let start = pay_off + field.offset as usize;
                        let end = (start + field.size as usize).min(payload.len());
                        payload[start..end].fill(0);
                        warn!("zero-filled unrecoverable field at offset {}", field.offset);
                    }
                }
            }
            Ok(has_external)
        }

        TypeDesc::Array(array) => {
            let mut has_external = false;
            for i in 0..array.count as usize {
                let at = pay_off + i * array.stride as usize;
                match fix_data(ctx, fixer, blob, array.element, payload, at, flip) {
                    Ok(ext) => has_external |= ext,
                    Err(FixFault) => {
                        let end =
                            (pay_off + array.count as usize * array.stride as usize).min(payload.len());
                        payload[at..end].fill(0);
                        warn!("zero-filled unrecoverable array tail at element {}", i);
                        break;
                    }
                }
            }
            Ok(has_external)
        }

        TypeDesc::OpenArray(array) => {
            let offset = slot_value(payload, pay_off, array.wide)? as usize;
            if offset == 0 {
                return Ok(false);
            }
            if offset < 4 {
                return Err(FixFault);
            }
            let count = blob_u32(blob, offset - 4)?;
            let byte_len = count as usize * array.stride as usize;
            let mut data = blob
                .get(offset..offset + byte_len)
                .ok_or(FixFault)?
                .to_vec();
            let mut has_external = false;
            if !ctx.types.is_plain_data(array.element, flip) {
                for i in 0..count as usize {
                    match fix_data(
                        ctx,
                        fixer,
                        blob,
                        array.element,
                        &mut data,
                        i * array.stride as usize,
                        flip,
                    ) {
                        Ok(ext) => has_external |= ext,
                        Err(FixFault) => {
                            // drop the unrecoverable tail
                            data.truncate(i * array.stride as usize);
                            let buf = ctx.new_buffer(OpenArrayBuf {
                                count: i as u32,
                                data,
                            });
                            write_slot(payload, pay_off, array.wide, buf.index());
                            warn!("truncated unrecoverable open array at element {}", i);
                            return Ok(has_external);
                        }
                    }
                }
            }
            let buf = ctx.new_buffer(OpenArrayBuf { count, data });
            write_slot(payload, pay_off, array.wide, buf.index());
            Ok(has_external)
        }

        TypeDesc::Reference(reference) => {
            let stored = slot_value(payload, pay_off, reference.wide)?;
            if stored == 0 {
                write_slot(payload, pay_off, reference.wide, 0);
                return Ok(false);
            }
            let payload_off = stored as usize;
            if payload_off < VALUE_HEADER_SIZE {
                return Err(FixFault);
            }
            let already = fixer
                .values
                .contains_key(&((payload_off - VALUE_HEADER_SIZE) as u32));
            let child = fix_value(ctx, fixer, blob, (payload_off - VALUE_HEADER_SIZE) as u32)
                .ok_or(FixFault)?;
            if already {
                // another slot adopted the creation count; this one shares
                ctx.retain(child);
            }
            if !reference.wide {
                ctx.objects.header_mut(child).flags |= ValueFlags::MEMORY32;
            }

            let child_flags = ctx.objects.header(child).flags;
            let has_external =
                child_flags.intersects(ValueFlags::EXTERNAL | ValueFlags::HAS_EXTERNAL);

            // repair declared-type mismatches through the engine
            let mut stored_child = child;
            if !fixer.flags.contains(BinFlags::DONT_CONVERT) {
                if let Some(declared) = reference.element {
                    let matches = ctx.types.same_shape(
                        ctx.obj_type(child),
                        Some(declared),
                        MatchCriteria::MATCH_NULLS,
                    );
                    if !matches {
                        if let Some(converted) =
                            convert(ctx, child, Some(declared), ConvertFlags::empty(), DEFAULT_DEPTH)
                        {
                            graph::release(ctx, child);
                            stored_child = converted;
                        }
                    }
                }
            }

            write_slot(payload, pay_off, reference.wide, stored_child.index());
            Ok(has_external)
        }

        TypeDesc::User(user) => {
            let mut has_external = false;
            if let Some(aliased) = user.aliased {
                has_external = fix_data(ctx, fixer, blob, aliased, payload, pay_off, flip)?;
            }
            if let (Some(init), Some(aliased)) = (user.init.clone(), user.aliased) {
                let size = ctx.types.size_of(aliased) as usize;
                let end = (pay_off + size).min(payload.len());
                init(&mut payload[pay_off..end], ctx.physical.as_deref());
            }
            Ok(has_external)
        }

        TypeDesc::Virtual(virt) => {
            let stored = slot_value(payload, pay_off, false)?;
            if stored == 0 {
                return Ok(false);
            }
            let payload_off = stored as usize;
            if payload_off < VALUE_HEADER_SIZE {
                return Err(FixFault);
            }
            let child = fix_value(ctx, fixer, blob, (payload_off - VALUE_HEADER_SIZE) as u32)
                .ok_or(FixFault)?;
            let child_ty = ctx.obj_type(child);
            let child_payload = ctx.payload_copy(child);
            let size = virt.size.max(4) as usize;
            let end = (pay_off + size).min(payload.len());
            let mut slot = payload[pay_off..end].to_vec();
            if !virt.ops.convert(ctx, &mut slot, child_ty, &child_payload) {
                return Err(FixFault);
            }
            payload[pay_off..end].copy_from_slice(&slot);
            Ok(false)
        }
    }
}

/// Reads a stored offset (always little-endian) from a slot.
fn slot_value(payload: &[u8], at: usize, wide: bool) -> Result<u64, FixFault> {
    if wide {
        payload
            .get(at..at + 8)
            .map(LittleEndian::read_u64)
            .ok_or(FixFault)
    } else {
        payload
            .get(at..at + 4)
            .map(|b| u64::from(LittleEndian::read_u32(b)))
            .ok_or(FixFault)
    }
}

/// Rewrites one big-endian scalar to canonical little-endian in place.
fn swap_scalar(payload: &mut [u8], at: usize, size: usize, flip: bool) {
    if !flip {
        return;
    }
    match size {
        2 => {
            let v = BigEndian::read_u16(&payload[at..at + 2]);
            LittleEndian::write_u16(&mut payload[at..at + 2], v);
        }
        4 => {
            let v = BigEndian::read_u32(&payload[at..at + 4]);
            LittleEndian::write_u32(&mut payload[at..at + 4], v);
        }
        8 => {
            let v = BigEndian::read_u64(&payload[at..at + 8]);
            LittleEndian::write_u64(&mut payload[at..at + 8], v);
        }
        _ => {}
    }
}
