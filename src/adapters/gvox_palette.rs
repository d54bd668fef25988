//! The `gvox_palette` stream: per-region palettes behind a fixed header table.
//!
//! ```text
//! 0   u32    magic "gvp\0"
//! 4   24     range (i32 offset[3], u32 extent[3])
//! 28  u32    blob_size, written last
//! 32  u32    channel_flags
//! 36  u32    channel_n
//! 40  8 * region_n * channel_n   ChannelHeader table, region-major
//! ..  blob_size                  blob area
//! ```

use fxhash::FxHashSet;
use rayon::ThreadPool;

use super::{
    build_thread_pool, check_channel_count, check_requested_channels, magic_u32, parse_prelude,
    read_at, GvoxPalette, GvoxPaletteSerializeConfig,
};
use crate::blob::BlobAllocator;
use crate::header::{ChannelHeader, ChannelHeaderTable};
use crate::palette::{decode_voxel, validate_header};
use crate::region::{LocalPos, RegionCoord, RegionGrid};
use crate::scan;
use crate::*;

const FORMAT: &str = "gvox_palette";
pub const MAGIC: [u8; 4] = *b"gvp\0";
pub const BLOB_SIZE_OFFSET: usize = 4 + RegionRange::ENCODED_SIZE;
pub const HEADER_SIZE: usize = BLOB_SIZE_OFFSET + 12;

struct PaletteStream {
    grid: RegionGrid,
    channel_flags: ChannelFlags,
    headers: ChannelHeaderTable,
    blob: Vec<u8>,
    /// Header slots whose payload is unusable; they sample as absent.
    malformed: FxHashSet<usize>,
}

impl PaletteStream {
    fn read(blit_ctx: &BlitContext, input: &mut dyn InputAdapterHandler) -> Result<Self, GvoxError> {
        let head = read_at(blit_ctx, input, 0, HEADER_SIZE, "gvox_palette header")?;
        let range = parse_prelude(&head, MAGIC, FORMAT)?;
        let field = |offset: usize| bits::read_u32(&head, offset).unwrap_or(0);
        let blob_size = field(BLOB_SIZE_OFFSET) as usize;
        let channel_flags = ChannelFlags::from_bits_truncate(field(BLOB_SIZE_OFFSET + 4));
        check_channel_count(channel_flags, field(BLOB_SIZE_OFFSET + 8), FORMAT)?;

        let channel_n = channel_flags.channel_n();
        let too_large = || {
            GvoxError::new(
                ErrorType::ParseAdapterInvalidInput,
                format!("{FORMAT}: header table for {range:?} is too large"),
            )
        };
        let grid = RegionGrid::new(range).ok_or_else(too_large)?;
        let table_len = grid
            .region_n()
            .checked_mul(channel_n * ChannelHeader::ENCODED_SIZE)
            .ok_or_else(too_large)?;
        let table_bytes = read_at(blit_ctx, input, HEADER_SIZE, table_len, "gvox_palette header table")?;
        let headers = ChannelHeaderTable::from_bytes(&table_bytes, grid.region_n(), channel_n)?;
        let blob = read_at(blit_ctx, input, HEADER_SIZE + table_len, blob_size, "gvox_palette blob area")?;

        let mut malformed = FxHashSet::default();
        for (slot, header) in headers.iter().enumerate() {
            if let Err(e) = validate_header(header, blob.len()) {
                let region_index = slot / channel_n;
                blit_ctx.push_error(GvoxError::new(
                    e.error_type(),
                    format!("region {:?}: {}", grid.region_coord(region_index), e.message()),
                ));
                malformed.insert(slot);
            }
        }

        log::debug!(
            "parsed {FORMAT}: {range:?}, {} region(s), {channel_n} channel(s), {blob_size} blob bytes",
            grid.region_n()
        );
        Ok(Self {
            grid,
            channel_flags,
            headers,
            blob,
            malformed,
        })
    }

    fn header(&self, region_index: usize, channel_index: usize) -> Option<&ChannelHeader> {
        let slot = region_index * self.headers.channel_n() + channel_index;
        if self.malformed.contains(&slot) {
            return None;
        }
        self.headers.get(region_index, channel_index)
    }

    fn sample(&self, coord: RegionCoord, channel_id: ChannelId, local: LocalPos) -> Sample {
        let Some(channel_index) = self.channel_flags.index_of(channel_id) else {
            return Sample::ABSENT;
        };
        let in_range = local.is_valid()
            && self.grid.contains_coord(coord)
            && self.grid.range().contains(&self.grid.position_of(coord, local));
        if !in_range {
            return Sample::ABSENT;
        }
        self.header(self.grid.region_index(coord), channel_index)
            .and_then(|header| decode_voxel(header, &self.blob, local))
            .map_or(Sample::ABSENT, Sample::present)
    }

    fn query_region_flags(&self, range: &RegionRange, channel_index: usize) -> u32 {
        if range.is_empty() || !self.grid.range().contains_range(range) {
            return 0;
        }
        let Some([rx, ry, rz]) = self.grid.regions_overlapping(range) else {
            return 0;
        };
        let mut value = None;
        for z in rz {
            for y in ry.clone() {
                for x in rx.clone() {
                    let region_index = self.grid.region_index(RegionCoord::new(x, y, z));
                    let Some(header) = self.header(region_index, channel_index) else {
                        return 0;
                    };
                    if header.variant_n > 1 {
                        return 0;
                    }
                    match value {
                        None => value = Some(header.blob_offset),
                        Some(v) if v != header.blob_offset => return 0,
                        Some(_) => {}
                    }
                }
            }
        }
        REGION_FLAG_UNIFORM
    }
}

/// Parses a `gvox_palette` stream into memory and decodes voxels on demand.
#[derive(Default)]
pub struct GvoxPaletteParser {
    stream: Option<PaletteStream>,
}

impl BaseAdapterHandler<Parse, GvoxPalette> for GvoxPaletteParser {
    fn create(_config: &()) -> Result<Self, GvoxError> {
        Ok(Self::default())
    }
}

impl GvoxPaletteParser {
    fn stream(&self) -> Result<&PaletteStream, GvoxError> {
        self.stream.as_ref().ok_or_else(|| {
            GvoxError::new(
                ErrorType::InvalidParameter,
                format!("{FORMAT}: no stream has been parsed yet"),
            )
        })
    }

    pub fn grid(&self) -> Option<&RegionGrid> {
        self.stream.as_ref().map(|s| &s.grid)
    }

    pub fn headers(&self) -> Option<&ChannelHeaderTable> {
        self.stream.as_ref().map(|s| &s.headers)
    }

    pub fn blob_size(&self) -> usize {
        self.stream.as_ref().map_or(0, |s| s.blob.len())
    }

    /// Decodes one voxel by region coordinate and local position in O(1).
    pub fn sample(&self, coord: RegionCoord, channel_id: ChannelId, local: LocalPos) -> Sample {
        self.stream
            .as_ref()
            .map_or(Sample::ABSENT, |s| s.sample(coord, channel_id, local))
    }

    pub fn sample_at(&self, position: &Offset3D, channel_id: ChannelId) -> Sample {
        let Some(stream) = &self.stream else {
            return Sample::ABSENT;
        };
        match stream.grid.locate(position) {
            Some((coord, local)) => stream.sample(coord, channel_id, local),
            None => Sample::ABSENT,
        }
    }
}

impl ParseAdapterHandler for GvoxPaletteParser {
    fn blit_begin(
        &mut self,
        blit_ctx: &BlitContext,
        input: &mut dyn InputAdapterHandler,
        _range: Option<&RegionRange>,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        let stream = PaletteStream::read(blit_ctx, input)?;
        check_requested_channels(stream.channel_flags, channel_flags, FORMAT)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn range(&self) -> Option<RegionRange> {
        self.stream.as_ref().map(|s| *s.grid.range())
    }

    fn channel_flags(&self) -> ChannelFlags {
        self.stream
            .as_ref()
            .map_or(ChannelFlags::empty(), |s| s.channel_flags)
    }

    fn query_region_flags(
        &self,
        _blit_ctx: &BlitContext,
        range: &RegionRange,
        channel_id: ChannelId,
    ) -> Result<u32, GvoxError> {
        let stream = self.stream()?;
        check_requested_channels(stream.channel_flags, channel_id.into(), FORMAT)?;
        let channel_index = stream.channel_flags.index_of(channel_id).unwrap_or(0);
        Ok(stream.query_region_flags(range, channel_index))
    }

    fn load_region_range(
        &self,
        _blit_ctx: &BlitContext,
        range: &RegionRange,
        channel_flags: ChannelFlags,
    ) -> Result<Region, GvoxError> {
        let stream = self.stream()?;
        check_requested_channels(stream.channel_flags, channel_flags, FORMAT)?;
        Ok(Region {
            range: *range,
            channels: channel_flags,
            flags: 0,
        })
    }

    fn sample_region(
        &self,
        _blit_ctx: &BlitContext,
        region: &Region,
        offset: &Offset3D,
        channel_id: ChannelId,
    ) -> Sample {
        if !region.channels.contains_id(channel_id) {
            return Sample::ABSENT;
        }
        self.sample_at(offset, channel_id)
    }
}

/// Serializes a range into a `gvox_palette` stream.
pub struct GvoxPaletteSerializer {
    config: GvoxPaletteSerializeConfig,
    pool: Option<ThreadPool>,
}

impl BaseAdapterHandler<Serialize, GvoxPalette> for GvoxPaletteSerializer {
    fn create(config: &GvoxPaletteSerializeConfig) -> Result<Self, GvoxError> {
        Ok(Self {
            config: *config,
            pool: build_thread_pool(config.parallel, config.thread_count)?,
        })
    }
}

impl GvoxPaletteSerializer {
    fn stream_header(range: &RegionRange, channel_flags: ChannelFlags) -> Vec<u8> {
        let mut head = Vec::with_capacity(HEADER_SIZE);
        head.extend_from_slice(&magic_u32(MAGIC).to_le_bytes());
        head.extend_from_slice(&range.to_bytes());
        head.extend_from_slice(&0u32.to_le_bytes());
        head.extend_from_slice(&channel_flags.bits().to_le_bytes());
        head.extend_from_slice(&(channel_flags.channel_n() as u32).to_le_bytes());
        head
    }
}

impl SerializeAdapterHandler for GvoxPaletteSerializer {
    fn serialize_region(
        &mut self,
        blit_ctx: &BlitContext,
        output: &mut dyn OutputAdapterHandler,
        parse: &dyn ParseAdapterHandler,
        range: &RegionRange,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        let channel_n = channel_flags.channel_n();
        let unrepresentable = || {
            GvoxError::new(
                ErrorType::SerializeAdapterUnrepresentableData,
                format!("{FORMAT}: header table for {range:?} is too large"),
            )
        };
        let grid = RegionGrid::new(*range).ok_or_else(unrepresentable)?;
        let table_len = grid
            .region_n()
            .checked_mul(channel_n * ChannelHeader::ENCODED_SIZE)
            .ok_or_else(unrepresentable)?;

        output.reserve(blit_ctx, HEADER_SIZE + table_len)?;
        output.write(blit_ctx, 0, &Self::stream_header(range, channel_flags))?;

        let pool = self.pool.as_ref();
        let accumulators = scan::scan(blit_ctx, parse, grid, channel_flags, pool, self.config.slab_count)?;
        let blobs = BlobAllocator::with_estimate(range.extent.volume(), channel_n);
        let headers = accumulators.encode(pool, self.config.blob_order, &blobs)?;
        let blob = blobs.into_bytes();

        output.write(blit_ctx, HEADER_SIZE, &headers.to_bytes())?;
        output.write(blit_ctx, HEADER_SIZE + table_len, &blob)?;
        output.write(blit_ctx, BLOB_SIZE_OFFSET, &(blob.len() as u32).to_le_bytes())?;

        log::debug!(
            "serialized {FORMAT}: {} region(s), {channel_n} channel(s), {} blob bytes",
            grid.region_n(),
            blob.len()
        );
        Ok(())
    }
}
