use int_enum::IntEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::adapters::{
    ByteBuffer, ByteBufferInput, ByteBufferInputConfig, ByteBufferOutputConfig, GvoxGlobalPalette,
    GvoxGlobalPaletteParser, GvoxGlobalPaletteSerializeConfig, GvoxOctree, GvoxOctreeParser,
    GvoxOctreeSerializeConfig, GvoxPalette, GvoxPaletteParser, GvoxPaletteSerializeConfig, GvoxRaw,
};
use crate::bits::calc_block_size;
use crate::header::ChannelHeader;
use crate::palette::validate_header;
use crate::region::{LocalPos, RegionCoord};
use crate::scan::BlobOrder;
use crate::{self as gvox_rs, BaseAdapterHandler, ParseAdapterHandler};
use procedural_parse::{Procedural, ProceduralConfig};


fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn range(offset: (i32, i32, i32), extent: (u32, u32, u32)) -> gvox_rs::RegionRange {
    gvox_rs::RegionRange::new(
        gvox_rs::Offset3D::new(offset.0, offset.1, offset.2),
        gvox_rs::Extent3D::new(extent.0, extent.1, extent.2),
    )
}

fn context() -> gvox_rs::Context {
    init_logging();
    let mut gvox_ctx = gvox_rs::Context::new();
    gvox_ctx.register_adapter::<gvox_rs::Parse, Procedural>();
    gvox_ctx
}

/// Blits a procedural source through serializer `D` into a byte buffer.
fn serialize<D: gvox_rs::AdapterDescriptor<gvox_rs::Serialize>>(
    gvox_ctx: &gvox_rs::Context,
    source: &ProceduralConfig,
    s_config: D::Configuration,
) -> Result<Vec<u8>, gvox_rs::GvoxError> {
    let o_config = ByteBufferOutputConfig::new();

    let mut i_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Input, ByteBuffer>()?
        .create_adapter_context(ByteBufferInputConfig::from(Vec::<u8>::new()))?;
    let mut o_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Output, ByteBuffer>()?
        .create_adapter_context(o_config.clone())?;
    let mut p_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Parse, Procedural>()?
        .create_adapter_context(source.clone())?;
    let mut s_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Serialize, D>()?
        .create_adapter_context(s_config)?;

    gvox_rs::blit_region(
        &mut i_ctx,
        &mut o_ctx,
        &mut p_ctx,
        &mut s_ctx,
        Some(&source.range),
        source.channel_flags,
    )?;
    Ok(o_config.take())
}

/// Parses `bytes` with parser `P` and re-serializes the whole stream with `S`.
fn convert<P, S>(
    gvox_ctx: &gvox_rs::Context,
    bytes: Vec<u8>,
    channel_flags: gvox_rs::ChannelFlags,
    s_config: S::Configuration,
) -> Result<Vec<u8>, gvox_rs::GvoxError>
where
    P: gvox_rs::AdapterDescriptor<gvox_rs::Parse, Configuration = ()>,
    S: gvox_rs::AdapterDescriptor<gvox_rs::Serialize>,
{
    let o_config = ByteBufferOutputConfig::new();

    let mut i_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Input, ByteBuffer>()?
        .create_adapter_context(ByteBufferInputConfig::from(bytes))?;
    let mut o_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Output, ByteBuffer>()?
        .create_adapter_context(o_config.clone())?;
    let mut p_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Parse, P>()?
        .create_adapter_context(())?;
    let mut s_ctx = gvox_ctx
        .get_adapter::<gvox_rs::Serialize, S>()?
        .create_adapter_context(s_config)?;

    gvox_rs::blit_region(&mut i_ctx, &mut o_ctx, &mut p_ctx, &mut s_ctx, None, channel_flags)?;
    Ok(o_config.take())
}

fn open_palette(
    bytes: Vec<u8>,
    channel_flags: gvox_rs::ChannelFlags,
) -> Result<(GvoxPaletteParser, gvox_rs::BlitContext), gvox_rs::GvoxError> {
    let blit_ctx = gvox_rs::BlitContext::new();
    let mut input = <ByteBufferInput as BaseAdapterHandler<gvox_rs::Input, ByteBuffer>>::create(
        &ByteBufferInputConfig::from(bytes),
    )?;
    let mut parser = <GvoxPaletteParser as BaseAdapterHandler<gvox_rs::Parse, GvoxPalette>>::create(&())?;
    parser.blit_begin(&blit_ctx, &mut input, None, channel_flags)?;
    Ok((parser, blit_ctx))
}

fn open_global_palette(
    bytes: Vec<u8>,
    channel_flags: gvox_rs::ChannelFlags,
) -> Result<GvoxGlobalPaletteParser, gvox_rs::GvoxError> {
    let blit_ctx = gvox_rs::BlitContext::new();
    let mut input = <ByteBufferInput as BaseAdapterHandler<gvox_rs::Input, ByteBuffer>>::create(
        &ByteBufferInputConfig::from(bytes),
    )?;
    let mut parser =
        <GvoxGlobalPaletteParser as BaseAdapterHandler<gvox_rs::Parse, GvoxGlobalPalette>>::create(&())?;
    parser.blit_begin(&blit_ctx, &mut input, None, channel_flags)?;
    Ok(parser)
}

fn open_octree(
    bytes: Vec<u8>,
    channel_flags: gvox_rs::ChannelFlags,
) -> Result<GvoxOctreeParser, gvox_rs::GvoxError> {
    let blit_ctx = gvox_rs::BlitContext::new();
    let mut input = <ByteBufferInput as BaseAdapterHandler<gvox_rs::Input, ByteBuffer>>::create(
        &ByteBufferInputConfig::from(bytes),
    )?;
    let mut parser = <GvoxOctreeParser as BaseAdapterHandler<gvox_rs::Parse, GvoxOctree>>::create(&())?;
    parser.blit_begin(&blit_ctx, &mut input, None, channel_flags)?;
    Ok(parser)
}

/// Checks every voxel and channel of `source` against `parse`.
fn assert_decodes_to(parse: &dyn ParseAdapterHandler, source: &ProceduralConfig) {
    let blit_ctx = gvox_rs::BlitContext::new();
    let region = parse
        .load_region_range(&blit_ctx, &source.range, source.channel_flags)
        .expect("Failed to load region.");
    source.range.for_each_position(|p| {
        for channel_id in source.channel_flags.ids() {
            assert_eq!(
                gvox_rs::Sample::present(source.expected(&p, channel_id)),
                parse.sample_region(&blit_ctx, &region, &p, channel_id),
                "Mismatch at {p:?}, channel {}.",
                channel_id.index()
            );
        }
    });
    assert_eq!(0, blit_ctx.error_count());
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("Bad slice."))
}

/// A stream prelude claiming `extent`, followed by `fields` and nothing else.
fn bare_stream(magic: &[u8; 4], extent: (u32, u32, u32), fields: &[u32]) -> Vec<u8> {
    let mut bytes = magic.to_vec();
    bytes.extend_from_slice(&range((0, 0, 0), extent).to_bytes());
    for field in fields {
        bytes.extend_from_slice(&field.to_le_bytes());
    }
    bytes
}

fn two_color_source() -> ProceduralConfig {
    ProceduralConfig::from_fn(
        range((0, 0, 0), (16, 16, 16)),
        gvox_rs::ChannelId::COLOR.into(),
        |p, _| Some(if p.x < 8 { 0xAABB_CCFF } else { 0x1122_3344 }),
    )
}

fn random_source(rng: &mut StdRng) -> ProceduralConfig {
    let extent = (rng.gen_range(1..=24), rng.gen_range(1..=24), rng.gen_range(1..=24));
    let offset = (rng.gen_range(-20..20), rng.gen_range(-20..20), rng.gen_range(-20..20));
    let source_range = range(offset, extent);

    let mut channel_flags = gvox_rs::ChannelFlags::empty();
    for _ in 0..rng.gen_range(1..=4) {
        let id = gvox_rs::ChannelId::new(rng.gen_range(0..10)).expect("Bad channel index.");
        channel_flags = channel_flags | id;
    }

    // 0: few values, 1: arbitrary u32, 2: mostly absent
    let kind = rng.gen_range(0..3);
    let count = source_range.extent.volume() as usize * channel_flags.channel_n();
    let values = (0..count)
        .map(|_| match kind {
            0 => Some(rng.gen_range(0..4u32) * 0x0101_0101),
            1 => (!rng.gen_bool(0.05)).then(|| rng.gen()),
            _ => rng.gen_bool(0.1).then(|| rng.gen_range(1..100)),
        })
        .collect();
    ProceduralConfig::from_values(source_range, channel_flags, values)
}

#[test]
fn test_version() {
    let gvox_version = gvox_rs::get_version();
    println!("{}.{}.{}", gvox_version.major, gvox_version.minor, gvox_version.patch);
    assert_eq!(gvox_version.major, 0);
}

#[test]
fn gvox_palette_two_color_volume() {
    let gvox_ctx = context();
    let source = two_color_source();

    let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");

    // 2x2x2 regions, one channel, no blob
    assert_eq!(40 + 8 * ChannelHeader::ENCODED_SIZE, bytes.len());
    assert_eq!(&b"gvp\0"[..], &bytes[0..4]);
    assert_eq!(0, u32_at(&bytes, 28));

    let (parser, blit_ctx) = open_palette(bytes, source.channel_flags).expect("Failed to parse.");
    assert_eq!(0, blit_ctx.error_count());
    assert_eq!(0, parser.blob_size());

    let grid = *parser.grid().expect("Missing grid.");
    let headers = parser.headers().expect("Missing headers.");
    assert_eq!(2, grid.region_nx());
    grid.for_each_region(|region_index, coord| {
        let header = headers.get(region_index, 0).expect("Missing header.");
        assert!(header.variant_n <= 1);
        let color = if coord.x == 0 { 0xAABB_CCFF } else { 0x1122_3344 };
        assert_eq!(color, header.blob_offset);
    });

    assert_decodes_to(&parser, &source);
}

#[test]
fn gvox_palette_random_round_trip() {
    let gvox_ctx = context();
    let mut rng = StdRng::seed_from_u64(0x6776_6f78);

    for _ in 0..24 {
        let source = random_source(&mut rng);
        let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
            .expect("Error while serializing.");
        let (parser, blit_ctx) = open_palette(bytes.clone(), source.channel_flags).expect("Failed to parse.");
        assert_eq!(0, blit_ctx.error_count());
        assert_decodes_to(&parser, &source);

        // blob_size is backpatched to the real blob length
        let headers = parser.headers().expect("Missing headers.");
        assert_eq!(bytes.len() - 40 - headers.byte_len(), u32_at(&bytes, 28) as usize);

        // payloads are disjoint and ordered by region index
        let mut end = 0;
        for header in headers.iter().filter(|h| h.variant_n > 1) {
            validate_header(header, parser.blob_size()).expect("Payload out of bounds.");
            assert!(header.blob_offset as usize >= end);
            end = header.blob_offset as usize + header.blob_len();
        }
    }
}

#[test]
fn gvox_palette_dense_fallback() {
    let gvox_ctx = context();
    let source = ProceduralConfig::from_fn(
        range((0, 0, 0), (16, 8, 8)),
        gvox_rs::ChannelId::MATERIAL_ID.into(),
        |p, _| {
            let i = (p.x % 8 + p.y * 8 + p.z * 64) as u32;
            // region 0 has 367 variants, region 1 has 368
            Some(if p.x < 8 { i % 367 + 1 } else { i % 368 + 1 })
        },
    );

    let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    let (parser, _) = open_palette(bytes, source.channel_flags).expect("Failed to parse.");
    let headers = parser.headers().expect("Missing headers.");

    let compressed = headers.get(0, 0).expect("Missing header.");
    let dense = headers.get(1, 0).expect("Missing header.");
    assert_eq!(367, compressed.variant_n);
    assert_eq!(368, dense.variant_n);
    assert_eq!(2048, compressed.blob_len());
    assert_eq!(calc_block_size(367), compressed.blob_len());
    assert_eq!(2048, dense.blob_len());
    assert_eq!(4096, parser.blob_size());

    assert_decodes_to(&parser, &source);
}

#[test]
fn gvox_palette_partial_regions() {
    let gvox_ctx = context();
    let source = ProceduralConfig::from_fn(
        range((-5, 2, 7), (13, 9, 3)),
        gvox_rs::ChannelId::COLOR | gvox_rs::ChannelId::ROUGHNESS,
        |p, channel_id| match channel_id {
            gvox_rs::ChannelId::COLOR => Some((p.x + 5) as u32 * 3),
            _ => (p.y % 2 == 0).then_some(7),
        },
    );

    let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    let (parser, _) = open_palette(bytes, source.channel_flags).expect("Failed to parse.");

    let grid = parser.grid().expect("Missing grid.");
    assert_eq!(4, grid.region_n());
    assert_eq!(8, parser.headers().expect("Missing headers.").len());
    assert_decodes_to(&parser, &source);

    // padding past the range is not data
    let outside = gvox_rs::Offset3D::new(8, 2, 7);
    assert_eq!(gvox_rs::Sample::ABSENT, parser.sample_at(&outside, gvox_rs::ChannelId::COLOR));
    let padding = gvox_rs::region::LocalPos::new(7, 7, 7);
    assert_eq!(
        gvox_rs::Sample::ABSENT,
        parser.sample(RegionCoord::new(1, 1, 0), gvox_rs::ChannelId::COLOR, padding)
    );
}

#[test]
fn gvox_palette_output_independent_of_threads() {
    let gvox_ctx = context();
    let source = ProceduralConfig::sphere(range((-20, -12, -16), (40, 24, 33)));

    let reference = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::single_threaded())
        .expect("Error while serializing.");

    for (threads, slab_count) in [(1, 32), (2, 1), (4, 7), (8, 32), (3, 100)] {
        let s_config = GvoxPaletteSerializeConfig {
            thread_count: std::num::NonZeroUsize::new(threads),
            slab_count,
            ..GvoxPaletteSerializeConfig::default()
        };
        let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, s_config).expect("Error while serializing.");
        assert_eq!(reference, bytes, "{threads} thread(s), {slab_count} slab(s)");
    }

    let (parser, _) = open_palette(reference, source.channel_flags).expect("Failed to parse.");
    assert_decodes_to(&parser, &source);
}

#[test]
fn gvox_palette_concurrent_blob_order() {
    let gvox_ctx = context();
    let source = ProceduralConfig::sphere(range((-16, -16, -16), (32, 32, 32)));
    let s_config = GvoxPaletteSerializeConfig {
        thread_count: std::num::NonZeroUsize::new(4),
        blob_order: BlobOrder::Concurrent,
        ..GvoxPaletteSerializeConfig::default()
    };

    let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, s_config).expect("Error while serializing.");
    let (parser, blit_ctx) = open_palette(bytes, source.channel_flags).expect("Failed to parse.");
    assert_eq!(0, blit_ctx.error_count());
    assert_decodes_to(&parser, &source);
}

#[test]
fn gvox_palette_uniform_hint_matches_full_scan() {
    let gvox_ctx = context();
    let mut source = ProceduralConfig::from_fn(
        range((0, 0, 0), (24, 16, 8)),
        gvox_rs::ChannelId::COLOR | gvox_rs::ChannelId::NORMAL,
        |p, channel_id| match channel_id {
            gvox_rs::ChannelId::COLOR if p.x < 16 => Some(0xFF00_00FF),
            gvox_rs::ChannelId::COLOR => Some(p.y as u32),
            _ => (p.z > 2).then_some(9),
        },
    );

    let plain = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    source.report_uniform = true;
    let hinted = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    assert_eq!(plain, hinted);
}

#[test]
fn gvox_palette_query_region_flags() {
    let gvox_ctx = context();
    let source = two_color_source();
    let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    let (parser, blit_ctx) = open_palette(bytes, source.channel_flags).expect("Failed to parse.");
    let color = gvox_rs::ChannelId::COLOR;

    let query = |offset, extent| {
        parser
            .query_region_flags(&blit_ctx, &range(offset, extent), color)
            .expect("Query failed.")
    };
    assert_eq!(gvox_rs::REGION_FLAG_UNIFORM, query((0, 0, 0), (8, 16, 16)));
    assert_eq!(gvox_rs::REGION_FLAG_UNIFORM, query((9, 3, 3), (7, 2, 13)));
    assert_eq!(0, query((4, 0, 0), (8, 8, 8)));
    assert_eq!(0, query((-1, 0, 0), (4, 4, 4)));
    assert_eq!(0, query((0, 0, 0), (0, 4, 4)));

    let missing = parser
        .query_region_flags(&blit_ctx, &range((0, 0, 0), (8, 8, 8)), gvox_rs::ChannelId::NORMAL)
        .map_err(|e| e.error_type());
    assert_eq!(Err(gvox_rs::ErrorType::ParseAdapterRequestedChannelNotPresent), missing);
}

#[test]
fn gvox_palette_malformed_region_is_absent() {
    let gvox_ctx = context();
    let source = ProceduralConfig::from_fn(
        range((0, 0, 0), (16, 8, 8)),
        gvox_rs::ChannelId::COLOR.into(),
        |p, _| Some(p.x as u32),
    );
    let mut bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");

    // blob_offset of region 0, channel 0
    bytes[44..48].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());

    let (parser, blit_ctx) = open_palette(bytes.clone(), source.channel_flags).expect("Failed to parse.");
    let errors = blit_ctx.take_errors();
    assert_eq!(1, errors.len());
    assert_eq!(gvox_rs::ErrorType::ParseAdapterInvalidInput, errors[0].error_type());

    let color = gvox_rs::ChannelId::COLOR;
    assert_eq!(gvox_rs::Sample::ABSENT, parser.sample_at(&gvox_rs::Offset3D::new(3, 1, 1), color));
    assert_eq!(
        gvox_rs::Sample::present(12),
        parser.sample_at(&gvox_rs::Offset3D::new(12, 1, 1), color)
    );

    // the blit still succeeds and queues the region error
    let raw = convert::<GvoxPalette, GvoxRaw>(&gvox_ctx, bytes, source.channel_flags, ())
        .expect("Error while converting.");
    assert!(!raw.is_empty());
    assert_eq!(gvox_rs::ErrorType::ParseAdapterInvalidInput, gvox_ctx.result());
    assert!(gvox_ctx.pop_result().is_some());
    assert_eq!(gvox_rs::ErrorType::Success, gvox_ctx.result());
}

#[test]
fn gvox_palette_structural_errors() {
    let gvox_ctx = context();
    let source = two_color_source();
    let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'x';
    let res = convert::<GvoxPalette, GvoxRaw>(&gvox_ctx, bad_magic, source.channel_flags, ())
        .map_err(|e| e.error_type());
    assert_eq!(Err(gvox_rs::ErrorType::ParseAdapterInvalidInput), res);

    let mut truncated = bytes.clone();
    truncated.truncate(50);
    let res = convert::<GvoxPalette, GvoxRaw>(&gvox_ctx, truncated, source.channel_flags, ())
        .map_err(|e| e.error_type());
    assert_eq!(Err(gvox_rs::ErrorType::ParseAdapterInvalidInput), res);

    let res = convert::<GvoxPalette, GvoxRaw>(
        &gvox_ctx,
        bytes.clone(),
        gvox_rs::ChannelId::COLOR | gvox_rs::ChannelId::TRANSPARENCY,
        (),
    )
    .map_err(|e| e.error_type());
    assert_eq!(Err(gvox_rs::ErrorType::ParseAdapterRequestedChannelNotPresent), res);

    let res = convert::<GvoxPalette, GvoxRaw>(&gvox_ctx, bytes, gvox_rs::ChannelFlags::empty(), ())
        .map_err(|e| e.error_type());
    assert_eq!(Err(gvox_rs::ErrorType::InvalidParameter), res);

    // every failure was queued, oldest first
    let results: Vec<_> = gvox_ctx
        .drain_results()
        .iter()
        .map(gvox_rs::GvoxError::error_type)
        .collect();
    assert_eq!(
        vec![
            gvox_rs::ErrorType::ParseAdapterInvalidInput,
            gvox_rs::ErrorType::ParseAdapterInvalidInput,
            gvox_rs::ErrorType::ParseAdapterRequestedChannelNotPresent,
            gvox_rs::ErrorType::InvalidParameter,
        ],
        results
    );
    assert_eq!(0, gvox_ctx.result_count());
}

#[test]
fn gvox_palette_local_sample_stays_in_its_region() {
    let gvox_ctx = context();
    let source = two_color_source();
    let bytes = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    let (parser, _) = open_palette(bytes, source.channel_flags).expect("Failed to parse.");
    let color = gvox_rs::ChannelId::COLOR;
    let origin = RegionCoord::new(0, 0, 0);

    // x = 9 of region 0 would land on region 1's voxel 1
    assert_eq!(gvox_rs::Sample::ABSENT, parser.sample(origin, color, LocalPos::new(9, 0, 0)));
    assert_eq!(gvox_rs::Sample::ABSENT, parser.sample(origin, color, LocalPos::new(0, u32::MAX, 0)));
    assert_eq!(
        gvox_rs::Sample::present(0x1122_3344),
        parser.sample(RegionCoord::new(1, 0, 0), color, LocalPos::new(1, 0, 0))
    );
    assert_eq!(
        gvox_rs::Sample::present(0xAABB_CCFF),
        parser.sample(RegionCoord::new(0, 1, 1), color, LocalPos::new(7, 7, 7))
    );

    // coordinates past the grid, including ones whose position wraps
    for coord in [
        RegionCoord::new(2, 0, 0),
        RegionCoord::new(0, 0, 2),
        RegionCoord::new(u32::MAX, 0, 0),
        RegionCoord::new(0, u32::MAX / 8 + 1, 0),
    ] {
        assert_eq!(
            gvox_rs::Sample::ABSENT,
            parser.sample(coord, color, LocalPos::default()),
            "{coord:?}"
        );
    }
}

#[test]
fn oversized_ranges_are_invalid_input() {
    let gvox_ctx = context();
    let color: gvox_rs::ChannelFlags = gvox_rs::ChannelId::COLOR.into();
    let invalid = Err(gvox_rs::ErrorType::ParseAdapterInvalidInput);

    // region or voxel counts past u64/usize, then counts that fit but
    // exceed the stream
    for extent in [(u32::MAX, u32::MAX, u32::MAX), (1 << 20, 1 << 20, 1 << 20)] {
        let palette = bare_stream(b"gvp\0", extent, &[0, color.bits(), 1]);
        let res = open_palette(palette, color).map(|_| ()).map_err(|e| e.error_type());
        assert_eq!(invalid, res, "gvox_palette {extent:?}");

        let raw = bare_stream(b"gvr\0", extent, &[color.bits(), 1]);
        let res = convert::<GvoxRaw, GvoxRaw>(&gvox_ctx, raw, color, ()).map(|_| ()).map_err(|e| e.error_type());
        assert_eq!(invalid, res, "gvox_raw {extent:?}");

        let global = bare_stream(b"gvgp", extent, &[color.bits(), 1]);
        let res = open_global_palette(global, color).map(|_| ()).map_err(|e| e.error_type());
        assert_eq!(invalid, res, "gvox_global_palette {extent:?}");
    }
}

#[test]
fn gvox_palette_converts_to_raw() {
    let gvox_ctx = context();
    let source = ProceduralConfig::sphere(range((-12, -12, -12), (24, 20, 17)));

    let direct = serialize::<GvoxRaw>(&gvox_ctx, &source, ()).expect("Error while serializing.");
    assert_eq!(36 + 24 * 20 * 17 * 3 * 4, direct.len());

    let palette = serialize::<GvoxPalette>(&gvox_ctx, &source, GvoxPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    let via_palette = convert::<GvoxPalette, GvoxRaw>(&gvox_ctx, palette, source.channel_flags, ())
        .expect("Error while converting.");
    assert_eq!(direct, via_palette);

    // and back again
    let repacked = convert::<GvoxRaw, GvoxPalette>(
        &gvox_ctx,
        direct,
        source.channel_flags,
        GvoxPaletteSerializeConfig::default(),
    )
    .expect("Error while converting.");
    let (parser, _) = open_palette(repacked, source.channel_flags).expect("Failed to parse.");
    assert_decodes_to(&parser, &source);
}

#[test]
fn gvox_global_palette_round_trip() {
    let gvox_ctx = context();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..8 {
        let source = random_source(&mut rng);
        for parallel in [false, true] {
            let s_config = GvoxGlobalPaletteSerializeConfig {
                parallel,
                ..GvoxGlobalPaletteSerializeConfig::default()
            };
            let bytes = serialize::<GvoxGlobalPalette>(&gvox_ctx, &source, s_config)
                .expect("Error while serializing.");
            let parser = open_global_palette(bytes, source.channel_flags).expect("Failed to parse.");
            assert_decodes_to(&parser, &source);

            for channel_id in source.channel_flags.ids() {
                let palette = parser.palette(channel_id).expect("Missing palette.");
                assert!(palette.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}

#[test]
fn gvox_global_palette_uniform_query() {
    let gvox_ctx = context();
    let source = ProceduralConfig::from_fn(
        range((0, 0, 0), (10, 10, 10)),
        gvox_rs::ChannelId::COLOR | gvox_rs::ChannelId::NORMAL,
        |p, channel_id| match channel_id {
            gvox_rs::ChannelId::COLOR => Some(5),
            _ => Some(p.z as u32),
        },
    );
    let bytes = serialize::<GvoxGlobalPalette>(&gvox_ctx, &source, GvoxGlobalPaletteSerializeConfig::default())
        .expect("Error while serializing.");
    let parser = open_global_palette(bytes, source.channel_flags).expect("Failed to parse.");

    let blit_ctx = gvox_rs::BlitContext::new();
    let whole = range((0, 0, 0), (10, 10, 10));
    let flags = |channel_id| {
        parser
            .query_region_flags(&blit_ctx, &whole, channel_id)
            .expect("Query failed.")
    };
    assert_eq!(gvox_rs::REGION_FLAG_UNIFORM, flags(gvox_rs::ChannelId::COLOR));
    assert_eq!(0, flags(gvox_rs::ChannelId::NORMAL));
    assert_eq!(Some(&[5u32][..]), parser.palette(gvox_rs::ChannelId::COLOR));
}

#[test]
fn gvox_octree_round_trip() {
    let gvox_ctx = context();
    let mut rng = StdRng::seed_from_u64(0x6f63_7472);

    for _ in 0..12 {
        let source = random_source(&mut rng);
        for parallel in [false, true] {
            let s_config = GvoxOctreeSerializeConfig {
                parallel,
                ..GvoxOctreeSerializeConfig::default()
            };
            let bytes = serialize::<GvoxOctree>(&gvox_ctx, &source, s_config).expect("Error while serializing.");
            assert_eq!(&b"gvo\0"[..], &bytes[0..4]);
            let parser = open_octree(bytes, source.channel_flags).expect("Failed to parse.");
            assert_decodes_to(&parser, &source);
        }
    }
}

#[test]
fn gvox_octree_converts_to_raw() {
    let gvox_ctx = context();
    let source = ProceduralConfig::sphere(range((-12, -12, -12), (24, 20, 17)));

    let direct = serialize::<GvoxRaw>(&gvox_ctx, &source, ()).expect("Error while serializing.");
    let octree = serialize::<GvoxOctree>(&gvox_ctx, &source, GvoxOctreeSerializeConfig::default())
        .expect("Error while serializing.");
    let via_octree = convert::<GvoxOctree, GvoxRaw>(&gvox_ctx, octree, source.channel_flags, ())
        .expect("Error while converting.");
    assert_eq!(direct, via_octree);
}

#[test]
fn gvox_octree_collapses_uniform_space() {
    let gvox_ctx = context();
    let color = gvox_rs::ChannelId::COLOR;
    let normal = gvox_rs::ChannelId::NORMAL;
    let source = ProceduralConfig::from_fn(
        range((-3, 0, 0), (10, 10, 10)),
        color | normal,
        |p, channel_id| match channel_id {
            gvox_rs::ChannelId::COLOR => Some(5),
            _ => Some(p.z as u32),
        },
    );
    let bytes = serialize::<GvoxOctree>(&gvox_ctx, &source, GvoxOctreeSerializeConfig::default())
        .expect("Error while serializing.");
    let parser = open_octree(bytes, source.channel_flags).expect("Failed to parse.");
    assert_eq!(Some(1), parser.node_count(color));
    assert_decodes_to(&parser, &source);

    let blit_ctx = gvox_rs::BlitContext::new();
    let flags = |offset, extent, channel_id| {
        parser
            .query_region_flags(&blit_ctx, &range(offset, extent), channel_id)
            .expect("Query failed.")
    };
    assert_eq!(gvox_rs::REGION_FLAG_UNIFORM, flags((-3, 0, 0), (10, 10, 10), color));
    assert_eq!(0, flags((-3, 0, 0), (10, 10, 10), normal));
    assert_eq!(gvox_rs::REGION_FLAG_UNIFORM, flags((0, 2, 3), (7, 8, 1), normal));
    assert_eq!(0, flags((0, 2, 3), (7, 8, 2), normal));
    assert_eq!(0, flags((-4, 0, 0), (2, 2, 2), color));
    assert_eq!(0, flags((0, 0, 0), (0, 2, 2), color));

    // two halves along x: one branch over eight leaves
    let halves = serialize::<GvoxOctree>(&gvox_ctx, &two_color_source(), GvoxOctreeSerializeConfig::default())
        .expect("Error while serializing.");
    let parser = open_octree(halves, color.into()).expect("Failed to parse.");
    assert_eq!(Some(9), parser.node_count(color));
    assert_decodes_to(&parser, &two_color_source());
}

#[test]
fn gvox_octree_malformed_input() {
    let color: gvox_rs::ChannelFlags = gvox_rs::ChannelId::COLOR.into();
    let invalid = Err(gvox_rs::ErrorType::ParseAdapterInvalidInput);
    let open = |bytes: Vec<u8>| open_octree(bytes, color).map(|_| ()).map_err(|e| e.error_type());

    // one voxel, depth 0, a single leaf
    let leaf = |nodes: &[u8]| {
        let mut bytes = bare_stream(b"gvo\0", (1, 1, 1), &[color.bits(), 1, 0, nodes.len() as u32]);
        bytes.extend_from_slice(nodes);
        bytes
    };
    let parser = open_octree(leaf(&[0, 5, 0, 0, 0]), color).expect("Failed to parse.");
    let blit_ctx = gvox_rs::BlitContext::new();
    let region = parser
        .load_region_range(&blit_ctx, &range((0, 0, 0), (1, 1, 1)), color)
        .expect("Failed to load region.");
    assert_eq!(
        gvox_rs::Sample::present(5),
        parser.sample_region(&blit_ctx, &region, &gvox_rs::Offset3D::new(0, 0, 0), gvox_rs::ChannelId::COLOR)
    );

    assert_eq!(invalid, open(leaf(&[0, 5, 0, 0, 0, 9])), "trailing byte");
    assert_eq!(invalid, open(leaf(&[0, 5, 0])), "short leaf");
    assert_eq!(invalid, open(leaf(&[7, 5, 0, 0, 0])), "unknown tag");
    assert_eq!(invalid, open(leaf(&[1, 0, 5, 0, 0, 0])), "branch below voxel level");

    let mut bytes = leaf(&[0, 5, 0, 0, 0]);
    bytes[36] = 3;
    assert_eq!(invalid, open(bytes), "depth");

    let mut bytes = leaf(&[0, 5, 0, 0, 0]);
    bytes[40] = 6;
    assert_eq!(invalid, open(bytes), "node count past the stream");

    let extent = (u32::MAX, u32::MAX, u32::MAX);
    let res = open(bare_stream(b"gvo\0", extent, &[color.bits(), 1, 32, 5]));
    assert_eq!(invalid, res, "missing nodes");
}

#[test]
fn adapters_by_name() {
    let gvox_ctx = context();
    for name in ["gvox_palette", "gvox_global_palette", "gvox_octree", "gvox_raw", "procedural"] {
        assert!(gvox_ctx.has_adapter::<gvox_rs::Parse>(name), "{name}");
    }
    for name in ["gvox_palette", "gvox_global_palette", "gvox_octree", "gvox_raw"] {
        assert!(gvox_ctx.has_adapter::<gvox_rs::Serialize>(name), "{name}");
    }
    assert!(gvox_ctx.has_adapter::<gvox_rs::Input>("byte_buffer"));
    assert!(!gvox_ctx.has_adapter::<gvox_rs::Serialize>("procedural"));

    let s_ctx = gvox_ctx
        .create_adapter_context_by_name::<gvox_rs::Serialize>(
            "gvox_palette",
            Box::new(GvoxPaletteSerializeConfig::single_threaded()),
        )
        .expect("Failed to create adapter context.");
    assert_eq!("gvox_palette", s_ctx.name());

    let res = gvox_ctx
        .create_adapter_context_by_name::<gvox_rs::Parse>("missing", Box::new(()))
        .map(|_| ())
        .map_err(|e| e.error_type());
    assert_eq!(Err(gvox_rs::ErrorType::InvalidParameter), res);

    let res = gvox_ctx
        .create_adapter_context_by_name::<gvox_rs::Serialize>("gvox_palette", Box::new(42u32))
        .map(|_| ())
        .map_err(|e| e.error_type());
    assert_eq!(Err(gvox_rs::ErrorType::InvalidParameter), res);

    assert_eq!(2, gvox_ctx.result_count());
    assert!(gvox_rs::Context::empty().get_adapter::<gvox_rs::Parse, GvoxPalette>().is_err());
}

#[test]
fn error_codes() {
    let error = gvox_rs::GvoxError::new(gvox_rs::ErrorType::BoundsViolation, "overrun");
    assert_eq!(-8, error.code());
    assert_eq!("overrun", error.message());
    assert_eq!("BoundsViolation: overrun", error.to_string());
    assert_eq!(-6, gvox_rs::ErrorType::ParseAdapterRequestedChannelNotPresent.int_value());
}
