use quarry_data_binary::{load, load_bytes, write, write_file, BinFlags, BinaryError};
use quarry_data_model::scalar::{read_float, read_int, read_slot, write_float, write_int, write_slot};
use quarry_data_model::{
    CompositeBuilder, IntDesc, Label, ObjRef, OpenArrayBuf, RefDesc, RuntimeContext, StringDesc,
    TypeDesc, TypeRef, TypeSlot, UserDesc, ValueFlags,
};

fn full_fidelity() -> BinFlags {
    BinFlags::WRITE_ALL_TYPES | BinFlags::STRING_IDS | BinFlags::ENUMS
}

/// { x: f32, y: f32, z: f32 }
fn vec3_type(ctx: &mut RuntimeContext) -> TypeRef {
    let f32_t = ctx.types.builtin().f32;
    let desc = CompositeBuilder::new()
        .field(&ctx.types, "x", f32_t)
        .field(&ctx.types, "y", f32_t)
        .field(&ctx.types, "z", f32_t)
        .build();
    ctx.types.add(TypeDesc::Composite(desc))
}

fn make_vec3(ctx: &mut RuntimeContext, t: TypeRef, x: f32, y: f32, z: f32) -> ObjRef {
    let obj = ctx.alloc_object(TypeSlot::Type(t), None, ValueFlags::empty());
    let payload = ctx.objects.payload_mut(obj);
    write_float(payload, 0, 32, f64::from(x));
    write_float(payload, 4, 32, f64::from(y));
    write_float(payload, 8, 32, f64::from(z));
    obj
}

/// Builds the documented example: two holders of { position: Reference<Vec3>,
/// name: String } sharing one Vec3 instance, under one root.
fn build_shared_scene(ctx: &mut RuntimeContext) -> ObjRef {
    let vec3_t = vec3_type(ctx);
    let ref_vec3 = ctx.types.reference_to(vec3_t);
    let str_t = ctx.types.add(TypeDesc::String(StringDesc::narrow()));
    let holder_desc = CompositeBuilder::new()
        .field(&ctx.types, "position", ref_vec3)
        .field(&ctx.types, "name", str_t)
        .build();
    let holder_t = ctx.types.add(TypeDesc::Composite(holder_desc));
    let ref_holder = ctx.types.reference_to(holder_t);
    let i32_t = ctx.types.builtin().i32;
    let scores_t = ctx.types.open_array_of(i32_t);
    let root_desc = CompositeBuilder::new()
        .field(&ctx.types, "a", ref_holder)
        .field(&ctx.types, "b", ref_holder)
        .field(&ctx.types, "scores", scores_t)
        .build();
    let root_t = ctx.types.add(TypeDesc::Composite(root_desc));

    let shared = make_vec3(ctx, vec3_t, 1.0, 2.0, 3.0);
    ctx.retain(shared);
    ctx.retain(shared); // two holder slots share it

    let mut make_holder = |ctx: &mut RuntimeContext, name: &str| {
        let name_ref = ctx.new_string(name.as_bytes().to_vec());
        let mut payload = vec![0u8; 8];
        write_slot(&mut payload, 0, false, shared.index());
        write_slot(&mut payload, 4, false, name_ref.index());
        ctx.alloc_with_payload(TypeSlot::Type(holder_t), None, ValueFlags::empty(), payload)
    };
    let a = make_holder(ctx, "alpha");
    let b = make_holder(ctx, "beta");

    let mut scores = vec![0u8; 12];
    write_int(&mut scores, 0, 4, 10);
    write_int(&mut scores, 4, 4, 20);
    write_int(&mut scores, 8, 4, 30);
    let buf = ctx.new_buffer(OpenArrayBuf {
        count: 3,
        data: scores,
    });

    let mut root_payload = vec![0u8; 12];
    write_slot(&mut root_payload, 0, false, a.index());
    write_slot(&mut root_payload, 4, false, b.index());
    write_slot(&mut root_payload, 8, false, buf.index());
    ctx.alloc_with_payload(TypeSlot::Type(root_t), None, ValueFlags::empty(), root_payload)
}

struct Scene {
    a_pos: ObjRef,
    b_pos: ObjRef,
    a_name: String,
    b_name: String,
    scores: Vec<i64>,
}

fn inspect_scene(ctx: &RuntimeContext, root: ObjRef) -> Scene {
    let root_payload = ctx.objects.payload(root).to_vec();
    let a = ObjRef::from_index(read_slot(&root_payload, 0, false)).expect("holder a");
    let b = ObjRef::from_index(read_slot(&root_payload, 4, false)).expect("holder b");

    let read_holder = |h: ObjRef| {
        let payload = ctx.objects.payload(h);
        let pos = ObjRef::from_index(read_slot(payload, 0, false)).expect("position");
        let name_slot = read_slot(payload, 4, false);
        let name = String::from_utf8(
            ctx.string_bytes(quarry_data_model::StrRef::from_index(name_slot).expect("name"))
                .to_vec(),
        )
        .unwrap();
        (pos, name)
    };
    let (a_pos, a_name) = read_holder(a);
    let (b_pos, b_name) = read_holder(b);

    let scores_buf = read_slot(&root_payload, 8, false);
    let buf = ctx.buffer(quarry_data_model::BufRef::from_index(scores_buf).expect("scores"));
    let scores = (0..buf.count as usize)
        .map(|i| read_int(&buf.data, i * 4, 4, true))
        .collect();

    Scene {
        a_pos,
        b_pos,
        a_name,
        b_name,
        scores,
    }
}

fn vec3_values(ctx: &RuntimeContext, v: ObjRef) -> (f64, f64, f64) {
    let payload = ctx.objects.payload(v);
    (
        read_float(payload, 0, 32).unwrap(),
        read_float(payload, 4, 32).unwrap(),
        read_float(payload, 8, 32).unwrap(),
    )
}

#[test]
fn round_trip_preserves_values_and_sharing() {
    let mut ctx = RuntimeContext::new();
    let root = build_shared_scene(&mut ctx);

    let mut blob = Vec::new();
    write(&mut ctx, root, full_fidelity(), &mut blob).expect("write");

    let mut loaded_ctx = RuntimeContext::new();
    let loaded = load_bytes(&mut loaded_ctx, &blob, BinFlags::empty()).expect("load");

    assert!(loaded_ctx
        .objects
        .header(loaded)
        .flags
        .contains(ValueFlags::ROOT));

    let scene = inspect_scene(&loaded_ctx, loaded);
    assert_eq!(scene.a_name, "alpha");
    assert_eq!(scene.b_name, "beta");
    assert_eq!(scene.scores, vec![10, 20, 30]);

    // sharing topology: both holders resolve to the same loaded instance
    assert_eq!(scene.a_pos, scene.b_pos);
    assert!(loaded_ctx.objects.header(scene.a_pos).ref_count >= 2);
    assert_eq!(vec3_values(&loaded_ctx, scene.a_pos), (1.0, 2.0, 3.0));
}

#[test]
fn shared_objects_are_written_exactly_once() {
    let mut ctx = RuntimeContext::new();
    let root = build_shared_scene(&mut ctx);

    let mut blob = Vec::new();
    write(&mut ctx, root, full_fidelity(), &mut blob).expect("write");

    // the shared Vec3 payload (1.0, 2.0, 3.0 as little-endian f32) must
    // appear exactly once in the blob
    let mut needle = vec![0u8; 12];
    write_float(&mut needle, 0, 32, 1.0);
    write_float(&mut needle, 4, 32, 2.0);
    write_float(&mut needle, 8, 32, 3.0);
    let hits = blob
        .windows(needle.len())
        .filter(|window| *window == needle.as_slice())
        .count();
    assert_eq!(hits, 1);
}

#[test]
fn big_endian_containers_load_with_identical_values() {
    let mut ctx = RuntimeContext::new();
    let root = build_shared_scene(&mut ctx);

    let mut le_blob = Vec::new();
    write(&mut ctx, root, full_fidelity(), &mut le_blob).expect("write le");
    let mut be_blob = Vec::new();
    write(&mut ctx, root, full_fidelity() | BinFlags::BIG_ENDIAN, &mut be_blob)
        .expect("write be");

    assert_ne!(le_blob, be_blob, "scalar bytes must differ across endianness");

    let mut le_ctx = RuntimeContext::new();
    let le_root = load_bytes(&mut le_ctx, &le_blob, BinFlags::empty()).expect("load le");
    let mut be_ctx = RuntimeContext::new();
    let be_root = load_bytes(&mut be_ctx, &be_blob, BinFlags::empty()).expect("load be");

    let le_scene = inspect_scene(&le_ctx, le_root);
    let be_scene = inspect_scene(&be_ctx, be_root);
    assert_eq!(
        vec3_values(&le_ctx, le_scene.a_pos),
        vec3_values(&be_ctx, be_scene.a_pos)
    );
    assert_eq!(le_scene.scores, be_scene.scores);
}

#[test]
fn compact_user_types_resolve_through_the_registry() {
    // writer context registers the named type and writes it compactly
    let mut ctx = RuntimeContext::new();
    let vec3_t = vec3_type(&mut ctx);
    let user_t = ctx
        .types
        .add(TypeDesc::User(UserDesc::named("vec3", vec3_t)));
    ctx.register_user(user_t);

    let ref_t = ctx.types.add(TypeDesc::Reference(RefDesc::untyped()));
    let root_desc = CompositeBuilder::new()
        .field(&ctx.types, "v", ref_t)
        .build();
    let root_t = ctx.types.add(TypeDesc::Composite(root_desc));

    let v = make_vec3(&mut ctx, vec3_t, 4.0, 5.0, 6.0);
    ctx.objects.header_mut(v).ty = TypeSlot::Type(user_t);
    let mut payload = vec![0u8; 4];
    write_slot(&mut payload, 0, false, v.index());
    let root = ctx.alloc_with_payload(TypeSlot::Type(root_t), None, ValueFlags::empty(), payload);

    // neither WRITE_ALL_TYPES nor WRITE_READ_TYPES: user types compact to CRCs
    let mut blob = Vec::new();
    write(&mut ctx, root, BinFlags::STRING_IDS, &mut blob).expect("write");

    // reader context has its own registration of the same name
    let mut loaded_ctx = RuntimeContext::new();
    let loaded_vec3 = vec3_type(&mut loaded_ctx);
    let loaded_user = loaded_ctx
        .types
        .add(TypeDesc::User(UserDesc::named("vec3", loaded_vec3)));
    loaded_ctx.register_user(loaded_user);

    let loaded = load_bytes(&mut loaded_ctx, &blob, BinFlags::empty()).expect("load");
    let child = ObjRef::from_index(read_slot(loaded_ctx.objects.payload(loaded), 0, false))
        .expect("child");
    assert_eq!(loaded_ctx.obj_type(child), Some(loaded_user));
    assert_eq!(vec3_values(&loaded_ctx, child), (4.0, 5.0, 6.0));
}

#[test]
fn registry_shape_change_is_repaired_by_conversion() {
    // written with { health: i32, speed: i32 } under the name "creature"
    let mut ctx = RuntimeContext::new();
    let i32_t = ctx.types.builtin().i32;
    let old_shape = CompositeBuilder::new()
        .field(&ctx.types, "health", i32_t)
        .field(&ctx.types, "speed", i32_t)
        .build();
    let old_t = ctx.types.add(TypeDesc::Composite(old_shape));
    let user_t = ctx
        .types
        .add(TypeDesc::User(UserDesc::named("creature", old_t)));
    ctx.register_user(user_t);

    let obj = ctx.alloc_object(TypeSlot::Type(user_t), None, ValueFlags::empty());
    write_int(ctx.objects.payload_mut(obj), 0, 4, 80); // health
    write_int(ctx.objects.payload_mut(obj), 4, 4, 12); // speed

    let mut blob = Vec::new();
    write(&mut ctx, obj, full_fidelity(), &mut blob).expect("write");

    // the loading process defines "creature" as { speed: i32 } only
    let mut loaded_ctx = RuntimeContext::new();
    let i32_t = loaded_ctx.types.builtin().i32;
    let new_shape = CompositeBuilder::new()
        .field(&loaded_ctx.types, "speed", i32_t)
        .build();
    let new_t = loaded_ctx.types.add(TypeDesc::Composite(new_shape));
    let new_user = loaded_ctx
        .types
        .add(TypeDesc::User(UserDesc::named("creature", new_t)));
    loaded_ctx.register_user(new_user);

    let loaded = load_bytes(&mut loaded_ctx, &blob, BinFlags::empty()).expect("load");

    // the mismatch surfaces as a changed concrete root type, never an error
    assert_eq!(loaded_ctx.obj_type(loaded), Some(new_user));
    assert_eq!(read_int(loaded_ctx.objects.payload(loaded), 0, 4, true), 12);
}

#[test]
fn corrupt_name_offset_degrades_only_that_subtree() {
    let mut ctx = RuntimeContext::new();
    let i32_t = ctx.types.builtin().i32;
    let good_desc = CompositeBuilder::new()
        .field(&ctx.types, "steady", i32_t)
        .build();
    let good_t = ctx.types.add(TypeDesc::Composite(good_desc));
    let bad_desc = CompositeBuilder::new()
        .field(&ctx.types, "zzfield", i32_t)
        .build();
    let bad_t = ctx.types.add(TypeDesc::Composite(bad_desc));
    let good_ref = ctx.types.reference_to(good_t);
    let bad_ref = ctx.types.reference_to(bad_t);
    let root_desc = CompositeBuilder::new()
        .field(&ctx.types, "good", good_ref)
        .field(&ctx.types, "bad", bad_ref)
        .build();
    let root_t = ctx.types.add(TypeDesc::Composite(root_desc));

    let good = ctx.alloc_object(TypeSlot::Type(good_t), None, ValueFlags::empty());
    write_int(ctx.objects.payload_mut(good), 0, 4, 777);
    let bad = ctx.alloc_object(TypeSlot::Type(bad_t), None, ValueFlags::empty());
    write_int(ctx.objects.payload_mut(bad), 0, 4, 888);
    let mut payload = vec![0u8; 8];
    write_slot(&mut payload, 0, false, good.index());
    write_slot(&mut payload, 4, false, bad.index());
    let root = ctx.alloc_with_payload(TypeSlot::Type(root_t), None, ValueFlags::empty(), payload);

    let mut blob = Vec::new();
    write(&mut ctx, root, full_fidelity(), &mut blob).expect("write");

    // corrupt the name offset of "zzfield": find the name, then the field
    // record holding its offset, and point it past the end of the blob
    let name_at = blob
        .windows(8)
        .position(|w| w == b"zzfield\0")
        .expect("name present") as u32;
    let mut patched = false;
    for i in (0..blob.len() - 16).step_by(4) {
        let word = |at: usize| {
            u32::from_le_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]])
        };
        // the full field record: (name offset, type, offset 0, size 4)
        if word(i) == name_at && word(i + 8) == 0 && word(i + 12) == 4 {
            let bad_offset = blob.len() as u32 + 4096;
            blob[i..i + 4].copy_from_slice(&bad_offset.to_le_bytes());
            patched = true;
            break;
        }
    }
    assert!(patched, "field record not found");

    let mut loaded_ctx = RuntimeContext::new();
    let loaded = load_bytes(&mut loaded_ctx, &blob, BinFlags::empty()).expect("load survives");

    // the good subtree is untouched
    let good_child =
        ObjRef::from_index(read_slot(loaded_ctx.objects.payload(loaded), 0, false))
            .expect("good child");
    assert_eq!(
        read_int(loaded_ctx.objects.payload(good_child), 0, 4, true),
        777
    );
    let good_ty = loaded_ctx.obj_type(good_child).expect("typed");
    assert!(!loaded_ctx.types.is_dodgy(good_ty));

    // the bad subtree is quarantined behind a dodgy type, not a crash
    if let Some(bad_child) =
        ObjRef::from_index(read_slot(loaded_ctx.objects.payload(loaded), 4, false))
    {
        if let Some(bad_ty) = loaded_ctx.obj_type(bad_child) {
            assert!(loaded_ctx.types.is_dodgy(bad_ty));
        }
    }
}

#[test]
fn external_references_round_trip_as_paths() {
    let mut ctx = RuntimeContext::new();
    let ext = ctx.alloc_external(TypeSlot::None, "assets/rock.mesh", None);
    let ref_t = ctx.types.add(TypeDesc::Reference(RefDesc::untyped()));
    let root_desc = CompositeBuilder::new()
        .field(&ctx.types, "mesh", ref_t)
        .build();
    let root_t = ctx.types.add(TypeDesc::Composite(root_desc));
    let mut payload = vec![0u8; 4];
    write_slot(&mut payload, 0, false, ext.index());
    let root = ctx.alloc_with_payload(TypeSlot::Type(root_t), None, ValueFlags::empty(), payload);

    let mut blob = Vec::new();
    write(&mut ctx, root, full_fidelity(), &mut blob).expect("write");
    assert!(blob.windows(17).any(|w| w == b"assets/rock.mesh\0"));

    let mut loaded_ctx = RuntimeContext::new();
    let loaded = load_bytes(&mut loaded_ctx, &blob, BinFlags::empty()).expect("load");
    let child = ObjRef::from_index(read_slot(loaded_ctx.objects.payload(loaded), 0, false))
        .expect("placeholder");
    assert!(loaded_ctx
        .objects
        .header(child)
        .flags
        .contains(ValueFlags::EXTERNAL));
    assert_eq!(
        loaded_ctx.external_path(child).as_deref(),
        Some("assets/rock.mesh")
    );
}

#[test]
fn enum_tables_survive_the_container() {
    let mut ctx = RuntimeContext::new();
    let enum_t = ctx.types.add(TypeDesc::Int(IntDesc {
        bits: 32,
        frac_bits: 0,
        signed: false,
        enums: Some(vec![
            quarry_data_model::EnumValue {
                id: Label::text("granite"),
                value: 1,
            },
            quarry_data_model::EnumValue {
                id: Label::text("basalt"),
                value: 2,
            },
        ]),
    }));
    let root_desc = CompositeBuilder::new()
        .field(&ctx.types, "material", enum_t)
        .build();
    let root_t = ctx.types.add(TypeDesc::Composite(root_desc));
    let root = ctx.alloc_object(TypeSlot::Type(root_t), None, ValueFlags::empty());
    write_int(ctx.objects.payload_mut(root), 0, 4, 2);

    let mut blob = Vec::new();
    write(&mut ctx, root, full_fidelity(), &mut blob).expect("write");

    let mut loaded_ctx = RuntimeContext::new();
    let loaded = load_bytes(&mut loaded_ctx, &blob, BinFlags::empty()).expect("load");
    let loaded_t = loaded_ctx.obj_type(loaded).expect("typed root");
    let field_ty = match loaded_ctx.types.get(loaded_t) {
        TypeDesc::Composite(comp) => comp.fields[0].ty,
        other => panic!("unexpected root type {:?}", other.kind()),
    };
    match loaded_ctx.types.get(field_ty) {
        TypeDesc::Int(int) => {
            let enums = int.enums.as_ref().expect("enum table");
            assert_eq!(enums.len(), 2);
            assert_eq!(enums[0].id, Label::text("granite"));
            assert_eq!(enums[1].value, 2);
        }
        other => panic!("unexpected field type {:?}", other.kind()),
    }
    assert_eq!(read_int(loaded_ctx.objects.payload(loaded), 0, 4, true), 2);
}

#[test]
fn truncated_containers_error_out() {
    let mut ctx = RuntimeContext::new();
    assert!(matches!(
        load_bytes(&mut ctx, &[0u8; 8], BinFlags::empty()),
        Err(BinaryError::Truncated(_))
    ));
}

#[test]
fn containers_round_trip_through_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("scene.qbin");

    let mut ctx = RuntimeContext::new();
    let root = build_shared_scene(&mut ctx);
    let written = write_file(&mut ctx, root, full_fidelity(), &path).expect("write file");
    assert_eq!(written as u64 % 32, 0, "container sizes are 32-byte aligned");

    let mut file = std::fs::File::open(&path).expect("reopen");
    let mut loaded_ctx = RuntimeContext::new();
    let loaded = load(&mut loaded_ctx, &mut file, BinFlags::empty()).expect("load file");
    let scene = inspect_scene(&loaded_ctx, loaded);
    assert_eq!(scene.a_pos, scene.b_pos);
    assert_eq!(scene.a_name, "alpha");
}
