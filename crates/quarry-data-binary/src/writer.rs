use std::io::Write;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::warn;
use quarry_data_convert::{convert, DEFAULT_DEPTH};
use quarry_data_model::scalar::read_slot;
use quarry_data_model::{
    BufRef, ConvertFlags, Label, ObjRef, RuntimeContext, StrRef, TypeDesc, TypeEntryFlags,
    TypeRef, UserFlags, ValueFlags,
};
use quarry_utils::HashMap;

use crate::{
    align_up, kind, type_word, BinFlags, BinaryError, RawValue, FILE_ALIGN, VALUE_HEADER_SIZE,
};

/// Growable blob with positioned writes. Structural integers are always
/// little-endian; data scalars go through [`Blob::write_scalar`].
struct Blob {
    buf: Vec<u8>,
}

impl Blob {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn ensure(&mut self, end: usize) {
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
    }

    fn write_bytes(&mut self, at: usize, data: &[u8]) {
        self.ensure(at + data.len());
        self.buf[at..at + data.len()].copy_from_slice(data);
    }

    fn write_u16(&mut self, at: usize, value: u16) {
        self.ensure(at + 2);
        LittleEndian::write_u16(&mut self.buf[at..at + 2], value);
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.ensure(at + 4);
        LittleEndian::write_u32(&mut self.buf[at..at + 4], value);
    }

    fn write_u64(&mut self, at: usize, value: u64) {
        self.ensure(at + 8);
        LittleEndian::write_u64(&mut self.buf[at..at + 8], value);
    }

    /// Writes one data scalar of `size` bytes, swapped when `flip`.
    fn write_scalar(&mut self, at: usize, src: &[u8], size: usize, flip: bool) {
        self.ensure(at + size);
        if flip {
            match size {
                2 => BigEndian::write_u16(
                    &mut self.buf[at..at + 2],
                    LittleEndian::read_u16(&src[..2]),
                ),
                4 => BigEndian::write_u32(
                    &mut self.buf[at..at + 4],
                    LittleEndian::read_u32(&src[..4]),
                ),
                8 => BigEndian::write_u64(
                    &mut self.buf[at..at + 8],
                    LittleEndian::read_u64(&src[..8]),
                ),
                // any other width is written out as-is
                _ => self.buf[at..at + size].copy_from_slice(&src[..size]),
            }
        } else {
            self.buf[at..at + size].copy_from_slice(&src[..size]);
        }
    }
}

struct WriteState {
    blob: Blob,
    tail: usize,
    flags: BinFlags,
    big: bool,
    /// type handle -> type-table offset; each distinct type written once
    types: HashMap<u32, u32>,
    /// shared object handle -> header offset of its single on-disk copy
    objects: HashMap<u32, u32>,
    base: Option<std::path::PathBuf>,
}

impl WriteState {
    fn align_tail(&mut self, align: usize) -> usize {
        self.tail = align_up(self.tail, align);
        self.tail
    }

    fn append_cstr(&mut self, units: &[u8], unit: usize) -> u32 {
        let at = self.tail;
        self.blob.write_bytes(at, units);
        // one zero code unit terminates the run
        self.blob.write_bytes(at + units.len(), &vec![0u8; unit]);
        self.tail = at + units.len() + unit;
        at as u32
    }
}

/// Serializes the object graph rooted at `root` and writes the whole blob in
/// one call. A stream failure aborts the operation; nothing is retried and
/// no partial-file contract is offered.
pub fn write<W: Write>(
    ctx: &mut RuntimeContext,
    root: ObjRef,
    flags: BinFlags,
    out: &mut W,
) -> Result<u64, BinaryError> {
    let blob = build(ctx, root, flags, None)?;
    out.write_all(&blob)?;
    Ok(blob.len() as u64)
}

/// Serializes to a file, resolving relative external paths against its
/// parent directory.
pub fn write_file(
    ctx: &mut RuntimeContext,
    root: ObjRef,
    flags: BinFlags,
    path: &Path,
) -> Result<u64, BinaryError> {
    let blob = build(ctx, root, flags, path.parent())?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(&blob)?;
    Ok(blob.len() as u64)
}

/// Builds the container blob in memory.
pub fn build(
    ctx: &mut RuntimeContext,
    root: ObjRef,
    flags: BinFlags,
    base: Option<&Path>,
) -> Result<Vec<u8>, BinaryError> {
    let mut root = root;
    let mut root_owned = false;

    // external roots must be materialized before they can be laid out
    if ctx
        .objects
        .header(root)
        .flags
        .contains(ValueFlags::EXTERNAL)
    {
        let resolved = convert(
            ctx,
            root,
            None,
            ConvertFlags::EXPAND_EXTERNALS,
            DEFAULT_DEPTH,
        )
        .ok_or(BinaryError::ExternalRoot)?;
        root = resolved;
        root_owned = true;
    }

    // virtual roots resolve through their deref callback
    if let Some(t) = ctx.obj_type(root) {
        if let Some(skipped) = ctx.types.skip_user(t) {
            if let TypeDesc::Virtual(virt) = ctx.types.get(skipped).clone() {
                let payload = ctx.payload_copy(root);
                let resolved = virt.ops.deref(ctx, &payload);
                if root_owned {
                    quarry_data_model::graph::release(ctx, root);
                    root_owned = false;
                }
                root = resolved.ok_or(BinaryError::UntypedRoot)?;
            }
        }
    }

    let root_ty = ctx.obj_type(root).ok_or(BinaryError::UntypedRoot)?;
    let root_size = ctx.types.size_of(root_ty) as usize;

    let mut st = WriteState {
        blob: Blob::new(),
        tail: VALUE_HEADER_SIZE + root_size,
        flags,
        big: flags.contains(BinFlags::BIG_ENDIAN),
        types: HashMap::default(),
        objects: HashMap::default(),
        base: base.map(Path::to_path_buf),
    };
    st.blob.ensure(st.tail);

    let mut header_flags = ValueFlags::empty();
    if st.big {
        header_flags |= ValueFlags::BIG_ENDIAN;
    }
    header_flags |= ctx.objects.header(root).flags & ValueFlags::HAS_EXTERNAL;

    // root type: expanded into the table, or compacted to a CRC32
    let (ty_field, crc_type) = dump_root_type(ctx, &mut st, root_ty);
    if crc_type {
        header_flags |= ValueFlags::CRC_TYPE;
    }

    // dump types referenced by an untyped root reference early, so they sit
    // near the start of the file
    dump_pointee_types(ctx, &mut st, root, root_ty);

    let flip = st.big;
    let payload = ctx.payload_copy(root);
    dump_data(ctx, &mut st, root_ty, &payload, 0, VALUE_HEADER_SIZE, flip)?;

    let root_id = ctx.objects.header(root).id.clone();
    let (id_field, crc_id) = dump_label(ctx, &mut st, &root_id);
    if crc_id && root_id.is_some() {
        header_flags |= ValueFlags::CRC_ID;
    }

    let total = align_up(st.tail, FILE_ALIGN as usize);
    st.blob.ensure(total);

    RawValue {
        id: id_field,
        ty: ty_field,
        user: total as u32,
        flags: header_flags,
        refs: 0,
    }
    .write(&mut st.blob.buf, 0);

    if root_owned {
        quarry_data_model::graph::release(ctx, root);
    }
    Ok(st.blob.buf)
}

fn expand_user(ctx: &RuntimeContext, st: &WriteState, t: TypeRef) -> bool {
    let fixed = ctx.types.entry_flags(t).contains(TypeEntryFlags::FIXED);
    let writable = match ctx.types.get(t) {
        TypeDesc::User(user) => user.flags.contains(UserFlags::WRITE_TO_BIN),
        _ => false,
    };
    st.flags.contains(BinFlags::WRITE_ALL_TYPES)
        || fixed
        || (st.flags.contains(BinFlags::WRITE_READ_TYPES) && writable)
}

fn dump_root_type(ctx: &mut RuntimeContext, st: &mut WriteState, t: TypeRef) -> (u32, bool) {
    if let TypeDesc::User(user) = ctx.types.get(t) {
        if !expand_user(ctx, st, t) {
            return (user.name.crc(), true);
        }
    }
    (dump_type(ctx, st, t), false)
}

/// Writes referenced types reachable from an untyped root reference ahead of
/// the data so a reader meets them first.
fn dump_pointee_types(ctx: &mut RuntimeContext, st: &mut WriteState, root: ObjRef, root_ty: TypeRef) {
    let Some(skipped) = ctx.types.skip_user(root_ty) else {
        return;
    };
    let TypeDesc::Reference(r) = ctx.types.get(skipped).clone() else {
        return;
    };
    if r.element.is_some() {
        return;
    }
    let Some(child) = ObjRef::from_index(read_slot(ctx.objects.payload(root), 0, r.wide)) else {
        return;
    };
    if ctx
        .objects
        .header(child)
        .flags
        .contains(ValueFlags::CRC_TYPE)
    {
        return;
    }
    if let Some(t) = ctx.obj_type(child) {
        let compact = matches!(ctx.types.get(t), TypeDesc::User(_)) && !expand_user(ctx, st, t);
        if !compact {
            dump_type(ctx, st, t);
        }
    }
}

/// Writes identifiers of objects: a name offset under `STRING_IDS`, a CRC32
/// otherwise. Returns the field value and whether the CRC flag applies.
fn dump_label(_ctx: &RuntimeContext, st: &mut WriteState, id: &Option<Label>) -> (u32, bool) {
    match id {
        None => (0, true),
        Some(label) => match label.as_text() {
            Some(text) if st.flags.contains(BinFlags::STRING_IDS) => {
                (st.append_cstr(text.as_bytes(), 1), false)
            }
            _ => (label.crc(), true),
        },
    }
}

/// Member identifiers (fields, enum values): offset when names are spelled
/// out, CRC otherwise; the enclosing entry's `CRC_IDS` flag says which.
fn dump_member_label(st: &mut WriteState, id: &Option<Label>, crc_ids: bool) -> u32 {
    match id {
        None => 0,
        Some(label) => match label.as_text() {
            Some(text) if !crc_ids => st.append_cstr(text.as_bytes(), 1),
            _ => label.crc(),
        },
    }
}

/// Writes one type-table entry (memoized) and every entry it references,
/// returning its offset.
fn dump_type(ctx: &mut RuntimeContext, st: &mut WriteState, t: TypeRef) -> u32 {
    if let Some(&offset) = st.types.get(&t.index()) {
        return offset;
    }

    let desc = ctx.types.get(t).clone();

    // virtual storage has no wire layout; it degrades to an untyped reference
    if matches!(desc, TypeDesc::Virtual(_)) {
        let entry = st.align_tail(4);
        st.types.insert(t.index(), entry as u32);
        st.tail = entry + 8;
        st.blob.write_u16(entry, kind::REFERENCE);
        st.blob.write_bytes(entry + 2, &[0, 0]);
        st.blob.write_u32(entry + 4, 0);
        return entry as u32;
    }

    let entry = st.align_tail(4);
    // memoize before descending so recursive types terminate
    st.types.insert(t.index(), entry as u32);

    match desc {
        TypeDesc::Int(int) => {
            let enum_mode = int.enums.is_some() && st.flags.contains(BinFlags::ENUMS);
            let crc_ids = !st.flags.contains(BinFlags::STRING_IDS);
            let mut word = kind::INT;
            if int.signed {
                word |= type_word::SIGNED;
            }
            if enum_mode {
                word |= type_word::ENUM;
                if crc_ids {
                    word |= type_word::ENUM_CRC_IDS;
                }
            }
            st.blob.write_u16(entry, word);
            st.blob.write_bytes(entry + 2, &[int.bits, int.frac_bits]);
            if enum_mode {
                let values = int.enums.as_ref().expect("enum mode").clone();
                let value_size = if int.bits > 32 { 8 } else { 4 };
                st.tail = entry + 8 + values.len() * (4 + value_size);
                st.blob.write_u32(entry + 4, values.len() as u32);
                let mut at = entry + 8;
                for value in &values {
                    let id = dump_member_label(st, &Some(value.id.clone()), crc_ids);
                    st.blob.write_u32(at, id);
                    if value_size == 8 {
                        st.blob.write_u64(at + 4, value.value);
                    } else {
                        st.blob.write_u32(at + 4, value.value as u32);
                    }
                    at += 4 + value_size;
                }
            } else {
                st.tail = entry + 4;
            }
        }

        TypeDesc::Float(float) => {
            let mut word = kind::FLOAT;
            if float.signed {
                word |= type_word::SIGNED;
            }
            st.tail = entry + 4;
            st.blob.write_u16(entry, word);
            st.blob
                .write_bytes(entry + 2, &[float.bits, float.exponent_bits]);
        }

        TypeDesc::String(string) => {
            let log2 = string.char_size.trailing_zeros() as u16;
            let mut word = kind::STRING | (log2 << type_word::CHAR_SIZE_SHIFT);
            if string.wide {
                word |= type_word::WIDE;
            }
            st.tail = entry + 4;
            st.blob.write_u16(entry, word);
            st.blob.write_bytes(entry + 2, &[0, 0]);
        }

        TypeDesc::Composite(comp) => {
            let crc_ids = !st.flags.contains(BinFlags::STRING_IDS);
            let mut word = kind::COMPOSITE;
            if crc_ids {
                word |= type_word::CRC_IDS;
            }
            st.tail = entry + 8 + comp.fields.len() * 16;
            st.blob.write_u16(entry, word);
            st.blob.write_bytes(entry + 2, &[0, 0]);
            st.blob.write_u32(entry + 4, comp.fields.len() as u32);
            let mut at = entry + 8;
            for field in &comp.fields {
                let id = dump_member_label(st, &field.id, crc_ids);
                let child = dump_type(ctx, st, field.ty);
                st.blob.write_u32(at, id);
                st.blob.write_u32(at + 4, child);
                st.blob.write_u32(at + 8, field.offset);
                st.blob.write_u32(at + 12, field.size);
                at += 16;
            }
        }

        TypeDesc::Array(array) => {
            st.tail = entry + 16;
            st.blob.write_u16(entry, kind::ARRAY);
            st.blob.write_bytes(entry + 2, &[0, 0]);
            let child = dump_type(ctx, st, array.element);
            st.blob.write_u32(entry + 4, array.count);
            st.blob.write_u32(entry + 8, child);
            st.blob.write_u32(entry + 12, array.stride);
        }

        TypeDesc::OpenArray(array) => {
            let mut word = kind::OPEN_ARRAY;
            if array.wide {
                word |= type_word::WIDE;
            }
            st.tail = entry + 12;
            let log2_align = ctx.types.align_of(array.element).max(1).trailing_zeros() as u8;
            st.blob.write_u16(entry, word);
            st.blob.write_bytes(entry + 2, &[log2_align, 0]);
            let child = dump_type(ctx, st, array.element);
            st.blob.write_u32(entry + 4, child);
            st.blob.write_u32(entry + 8, array.stride);
        }

        TypeDesc::Reference(reference) => {
            let mut word = kind::REFERENCE;
            if reference.wide {
                word |= type_word::WIDE;
            }
            st.tail = entry + 8;
            st.blob.write_u16(entry, word);
            st.blob.write_bytes(entry + 2, &[0, 0]);
            let child = match reference.element {
                Some(element) => dump_type(ctx, st, element),
                None => 0,
            };
            st.blob.write_u32(entry + 4, child);
        }

        TypeDesc::User(user) => {
            let crc_id = !st.flags.contains(BinFlags::STRING_IDS) || user.name.as_text().is_none();
            let mut word = kind::USER;
            if crc_id {
                word |= type_word::USER_CRC_ID;
            }
            if user.flags.contains(UserFlags::CHANGE) {
                word |= type_word::USER_CHANGE;
            }
            if user.flags.contains(UserFlags::WRITE_TO_BIN) {
                word |= type_word::USER_WRITE;
            }
            st.tail = entry + 12;
            st.blob.write_u16(entry, word);
            st.blob.write_bytes(entry + 2, &[0, 0]);
            let id = if crc_id {
                user.name.crc()
            } else {
                let text = user.name.as_text().expect("text name").to_owned();
                st.append_cstr(text.as_bytes(), 1)
            };
            let child = if expand_user(ctx, st, t) {
                match user.aliased {
                    Some(aliased) => dump_type(ctx, st, aliased),
                    None => 0,
                }
            } else {
                0
            };
            st.blob.write_u32(entry + 4, id);
            st.blob.write_u32(entry + 8, child);
        }

        TypeDesc::Virtual(_) => unreachable!("handled above"),
    }

    entry as u32
}

/// Recursively writes one value of type `t` from canonical payload bytes
/// into the blob at `file_off`.
fn dump_data(
    ctx: &mut RuntimeContext,
    st: &mut WriteState,
    t: TypeRef,
    payload: &[u8],
    pay_off: usize,
    file_off: usize,
    flip: bool,
) -> Result<(), BinaryError> {
    let size = ctx.types.size_of(t) as usize;
    if ctx.types.is_plain_data(t, flip) {
        st.blob
            .write_bytes(file_off, &payload[pay_off..pay_off + size]);
        return Ok(());
    }

    match ctx.types.get(t).clone() {
        TypeDesc::Int(_) | TypeDesc::Float(_) => {
            st.blob
                .write_scalar(file_off, &payload[pay_off..pay_off + size], size, flip);
        }

        TypeDesc::String(string) => {
            match StrRef::from_index(read_slot(payload, pay_off, string.wide)) {
                Some(s) => {
                    let units = ctx.string_bytes(s).to_vec();
                    st.align_tail(4);
                    let at = st.append_cstr(&units, string.char_size as usize);
                    if string.wide {
                        st.blob.write_u64(file_off, u64::from(at));
                    } else {
                        st.blob.write_u32(file_off, at);
                    }
                }
                None => {
                    if string.wide {
                        st.blob.write_u64(file_off, 0);
                    } else {
                        st.blob.write_u32(file_off, 0);
                    }
                }
            }
        }

        TypeDesc::Composite(comp) => {
            for field in &comp.fields {
                dump_data(
                    ctx,
                    st,
                    field.ty,
                    payload,
                    pay_off + field.offset as usize,
                    file_off + field.offset as usize,
                    flip,
                )?;
            }
        }

        TypeDesc::Array(array) => {
            for i in 0..array.count as usize {
                dump_data(
                    ctx,
                    st,
                    array.element,
                    payload,
                    pay_off + i * array.stride as usize,
                    file_off + i * array.stride as usize,
                    flip,
                )?;
            }
        }

        TypeDesc::OpenArray(array) => {
            let buf = BufRef::from_index(read_slot(payload, pay_off, array.wide))
                .map(|b| ctx.buffer(b).clone());
            match buf {
                Some(buf) if buf.count > 0 => {
                    let elem_align = ctx.types.align_of(array.element).max(4) as usize;
                    let data_off = align_up(st.tail + 4, elem_align);
                    st.blob.write_u32(data_off - 4, buf.count);
                    st.tail = data_off + buf.count as usize * array.stride as usize;
                    st.blob.ensure(st.tail);
                    if ctx.types.is_plain_data(array.element, flip) {
                        st.blob.write_bytes(data_off, &buf.data);
                    } else {
                        for i in 0..buf.count as usize {
                            dump_data(
                                ctx,
                                st,
                                array.element,
                                &buf.data,
                                i * array.stride as usize,
                                data_off + i * array.stride as usize,
                                flip,
                            )?;
                        }
                    }
                    if array.wide {
                        st.blob.write_u64(file_off, data_off as u64);
                    } else {
                        st.blob.write_u32(file_off, data_off as u32);
                    }
                }
                _ => {
                    if array.wide {
                        st.blob.write_u64(file_off, 0);
                    } else {
                        st.blob.write_u32(file_off, 0);
                    }
                }
            }
        }

        TypeDesc::Reference(reference) => {
            let child = ObjRef::from_index(read_slot(payload, pay_off, reference.wide));
            let location = dump_ref(ctx, st, child, reference.element, flip)?;
            if reference.wide {
                st.blob.write_u64(file_off, u64::from(location));
            } else {
                st.blob.write_u32(file_off, location);
            }
        }

        TypeDesc::User(user) => {
            if let Some(aliased) = user.aliased {
                dump_data(ctx, st, aliased, payload, pay_off, file_off, flip)?;
            }
        }

        TypeDesc::Virtual(virt) => {
            // polymorphic slots resolve to a concrete object, written as a
            // reference
            let slice_end = (pay_off + virt.size.max(4) as usize).min(payload.len());
            let resolved = virt.ops.deref(ctx, &payload[pay_off..slice_end]);
            let location = dump_ref(ctx, st, resolved, None, flip)?;
            st.blob.write_u32(file_off, location);
        }
    }
    Ok(())
}

/// Writes the object behind a reference slot (once, for shared pointees) and
/// returns the payload offset to store, or 0 for null/unwritable pointees.
fn dump_ref(
    ctx: &mut RuntimeContext,
    st: &mut WriteState,
    child: Option<ObjRef>,
    declared: Option<TypeRef>,
    flip: bool,
) -> Result<u32, BinaryError> {
    let Some(child) = child else { return Ok(0) };

    let shared = ctx.objects.header(child).ref_count > 1;
    if shared {
        if let Some(&header_off) = st.objects.get(&child.index()) {
            return Ok(header_off + VALUE_HEADER_SIZE as u32);
        }
    }

    if ctx
        .objects
        .header(child)
        .flags
        .contains(ValueFlags::CRC_TYPE)
    {
        warn!("skipping crc-typed pointee {}", child.index());
        return Ok(0);
    }

    // correctness pass: coerce the pointee to its declared type first
    let (p, p_owned) = if st.flags.contains(BinFlags::DONT_CONVERT) {
        (Some(child), false)
    } else {
        let policy = if st.flags.contains(BinFlags::EXPAND_EXTERNALS) {
            ConvertFlags::EXPAND_EXTERNALS
        } else {
            ConvertFlags::ALLOW_EXTERNALS
        };
        (
            convert(ctx, child, declared, policy | ConvertFlags::RECURSE, DEFAULT_DEPTH),
            true,
        )
    };

    let Some(mut p) = p else { return Ok(0) };
    // redirects write their true value
    while ctx.objects.header(p).flags.contains(ValueFlags::REDIRECT) {
        match ObjRef::from_index(read_slot(ctx.objects.payload(p), 0, false)) {
            Some(next) => p = next,
            None => break,
        }
    }

    if ctx.objects.header(p).flags.contains(ValueFlags::CRC_TYPE) {
        if p_owned {
            quarry_data_model::graph::release(ctx, p);
        }
        return Ok(0);
    }

    let mut value_flags = ctx.objects.header(p).flags
        & (ValueFlags::EXTERNAL | ValueFlags::HAS_EXTERNAL | ValueFlags::ALWAYS_MERGE);
    if st.big {
        value_flags |= ValueFlags::BIG_ENDIAN;
    }

    let id = ctx.objects.header(p).id.clone();
    let (id_field, crc_id) = dump_label(ctx, st, &id);
    if crc_id && id.is_some() {
        value_flags |= ValueFlags::CRC_ID;
    }

    let external_path = ctx.external_path(p);
    let (ty_field, header_off) = if let Some(path) = external_path {
        let path = match (&st.base, st.flags.contains(BinFlags::RELATIVE_PATHS)) {
            (Some(base), true) => Path::new(&path)
                .strip_prefix(base)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(path),
            _ => path,
        };
        let ty_field = match ctx.obj_type(p) {
            Some(t) => dump_type(ctx, st, t),
            None => 0,
        };
        let header_off = st.align_tail(4);
        st.tail = header_off + VALUE_HEADER_SIZE;
        st.append_cstr(path.as_bytes(), 1);
        (ty_field, header_off)
    } else {
        let Some(p_ty) = ctx.obj_type(p) else {
            if p_owned {
                quarry_data_model::graph::release(ctx, p);
            }
            return Ok(0);
        };
        let compact =
            matches!(ctx.types.get(p_ty), TypeDesc::User(_)) && !expand_user(ctx, st, p_ty);
        let ty_field = if compact {
            value_flags |= ValueFlags::CRC_TYPE;
            match ctx.types.get(p_ty) {
                TypeDesc::User(user) => user.name.crc(),
                _ => unreachable!(),
            }
        } else {
            dump_type(ctx, st, p_ty)
        };

        let align = ctx.types.align_of(p_ty).max(4) as usize;
        let header_off = align_up(st.tail, align);
        let size = ctx.types.size_of(p_ty) as usize;
        st.tail = header_off + VALUE_HEADER_SIZE + size;
        st.blob.ensure(st.tail);
        // record the location before descending, so cycles through this
        // object resolve to the copy being written
        if shared {
            st.objects.insert(child.index(), header_off as u32);
        }
        let payload = ctx.payload_copy(p);
        dump_data(
            ctx,
            st,
            p_ty,
            &payload,
            0,
            header_off + VALUE_HEADER_SIZE,
            flip,
        )?;
        (ty_field, header_off)
    };

    RawValue {
        id: id_field,
        ty: ty_field,
        user: 0,
        flags: value_flags,
        refs: ctx.objects.header(p).ref_count.min(u32::from(u16::MAX)) as u16,
    }
    .write_into(&mut st.blob, header_off);

    if shared && !st.objects.contains_key(&child.index()) {
        st.objects.insert(child.index(), header_off as u32);
    }
    if p_owned {
        quarry_data_model::graph::release(ctx, p);
    }
    Ok(header_off as u32 + VALUE_HEADER_SIZE as u32)
}

impl RawValue {
    fn write_into(&self, blob: &mut Blob, offset: usize) {
        blob.ensure(offset + VALUE_HEADER_SIZE);
        self.write(&mut blob.buf, offset);
    }
}
