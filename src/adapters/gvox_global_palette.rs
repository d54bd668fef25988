//! The `gvox_global_palette` stream: one sorted palette per channel for the
//! whole range, followed by bit-packed indices for every voxel.
//!
//! ```text
//! 0   u32    magic "gvgp"
//! 4   24     range
//! 28  u32    channel_flags
//! 32  u32    channel_n
//! per channel, ascending:
//!     u32        variant_n
//!     u32[variant_n]   sorted palette
//!     packed indices, ceil_log2(variant_n) bits each, x fastest, plus one pad word
//! ```

use fxhash::FxHashSet;
use rayon::ThreadPool;

use super::{
    build_thread_pool, check_channel_count, check_requested_channels, magic_u32, parse_prelude,
    read_at, sample_dense, voxel_count, GvoxGlobalPalette, GvoxGlobalPaletteSerializeConfig,
};
use crate::bits::{calc_packed_size, ceil_log2, checked_packed_size};
use crate::*;

const FORMAT: &str = "gvox_global_palette";
pub const MAGIC: [u8; 4] = *b"gvgp";
pub const HEADER_SIZE: usize = 4 + RegionRange::ENCODED_SIZE + 8;

struct GlobalChannel {
    palette: Vec<u32>,
    bits_per_variant: u32,
    packed: Vec<u8>,
}

impl GlobalChannel {
    fn get(&self, voxel_index: usize) -> Option<u32> {
        let bits = self.bits_per_variant;
        let index = bits::read_packed(&self.packed, voxel_index * bits as usize, bits)?;
        self.palette.get(index as usize).copied()
    }
}

struct GlobalPaletteStream {
    range: RegionRange,
    channel_flags: ChannelFlags,
    channels: Vec<GlobalChannel>,
}

#[derive(Default)]
pub struct GvoxGlobalPaletteParser {
    stream: Option<GlobalPaletteStream>,
}

impl BaseAdapterHandler<Parse, GvoxGlobalPalette> for GvoxGlobalPaletteParser {
    fn create(_config: &()) -> Result<Self, GvoxError> {
        Ok(Self::default())
    }
}

impl GvoxGlobalPaletteParser {
    fn stream(&self) -> Result<&GlobalPaletteStream, GvoxError> {
        self.stream.as_ref().ok_or_else(|| {
            GvoxError::new(
                ErrorType::InvalidParameter,
                format!("{FORMAT}: no stream has been parsed yet"),
            )
        })
    }

    /// Distinct values of a channel, sorted.
    pub fn palette(&self, channel_id: ChannelId) -> Option<&[u32]> {
        let stream = self.stream.as_ref()?;
        let channel_index = stream.channel_flags.index_of(channel_id)?;
        Some(&stream.channels[channel_index].palette)
    }
}

impl ParseAdapterHandler for GvoxGlobalPaletteParser {
    fn blit_begin(
        &mut self,
        blit_ctx: &BlitContext,
        input: &mut dyn InputAdapterHandler,
        _range: Option<&RegionRange>,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        let head = read_at(blit_ctx, input, 0, HEADER_SIZE, "gvox_global_palette header")?;
        let range = parse_prelude(&head, MAGIC, FORMAT)?;
        let field = |offset: usize| bits::read_u32(&head, offset).unwrap_or(0);
        let stored_flags = ChannelFlags::from_bits_truncate(field(28));
        check_channel_count(stored_flags, field(32), FORMAT)?;
        check_requested_channels(stored_flags, channel_flags, FORMAT)?;

        let voxel_n = voxel_count(&range, ErrorType::ParseAdapterInvalidInput, FORMAT)?;
        let mut position = HEADER_SIZE;
        let mut channels = Vec::with_capacity(stored_flags.channel_n());
        for _ in stored_flags.ids() {
            let count = read_at(blit_ctx, input, position, 4, "gvox_global_palette variant count")?;
            let variant_n = bits::read_u32(&count, 0).unwrap_or(0);
            if variant_n as usize > voxel_n.max(1) {
                return Err(GvoxError::new(
                    ErrorType::ParseAdapterInvalidInput,
                    format!("{FORMAT}: {variant_n} variants for {voxel_n} voxels"),
                ));
            }
            position += 4;

            let palette_bytes = read_at(
                blit_ctx,
                input,
                position,
                variant_n as usize * 4,
                "gvox_global_palette palette",
            )?;
            let palette = palette_bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            position += palette_bytes.len();

            let bits_per_variant = ceil_log2(variant_n);
            let packed_len = checked_packed_size(bits_per_variant, voxel_n).ok_or_else(|| {
                GvoxError::new(
                    ErrorType::ParseAdapterInvalidInput,
                    format!("{FORMAT}: index array for {voxel_n} voxels is too large"),
                )
            })?;
            let packed = read_at(blit_ctx, input, position, packed_len, "gvox_global_palette indices")?;
            position += packed_len;

            channels.push(GlobalChannel {
                palette,
                bits_per_variant,
                packed,
            });
        }

        self.stream = Some(GlobalPaletteStream {
            range,
            channel_flags: stored_flags,
            channels,
        });
        Ok(())
    }

    fn range(&self) -> Option<RegionRange> {
        self.stream.as_ref().map(|s| s.range)
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
        let uniform = !range.is_empty()
            && stream.range.contains_range(range)
            && stream.channels[channel_index].palette.len() == 1;
        Ok(if uniform { REGION_FLAG_UNIFORM } else { 0 })
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
        let Some(stream) = &self.stream else {
            return Sample::ABSENT;
        };
        if !region.channels.contains_id(channel_id) {
            return Sample::ABSENT;
        }
        let (Some(voxel_index), Some(channel_index)) = (
            stream.range.linear_index(offset),
            stream.channel_flags.index_of(channel_id),
        ) else {
            return Sample::ABSENT;
        };
        stream.channels[channel_index]
            .get(voxel_index)
            .map_or(Sample::ABSENT, Sample::present)
    }
}

pub struct GvoxGlobalPaletteSerializer {
    pool: Option<ThreadPool>,
}

impl BaseAdapterHandler<Serialize, GvoxGlobalPalette> for GvoxGlobalPaletteSerializer {
    fn create(config: &GvoxGlobalPaletteSerializeConfig) -> Result<Self, GvoxError> {
        Ok(Self {
            pool: build_thread_pool(config.parallel, config.thread_count)?,
        })
    }
}

impl SerializeAdapterHandler for GvoxGlobalPaletteSerializer {
    fn serialize_region(
        &mut self,
        blit_ctx: &BlitContext,
        output: &mut dyn OutputAdapterHandler,
        parse: &dyn ParseAdapterHandler,
        range: &RegionRange,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        let voxel_n = voxel_count(range, ErrorType::SerializeAdapterUnrepresentableData, FORMAT)?;

        let mut head = Vec::with_capacity(HEADER_SIZE);
        head.extend_from_slice(&magic_u32(MAGIC).to_le_bytes());
        head.extend_from_slice(&range.to_bytes());
        head.extend_from_slice(&channel_flags.bits().to_le_bytes());
        head.extend_from_slice(&(channel_flags.channel_n() as u32).to_le_bytes());
        output.write(blit_ctx, 0, &head)?;

        let mut position = HEADER_SIZE;
        for channel_id in channel_flags.ids() {
            let values = sample_dense(self.pool.as_ref(), blit_ctx, parse, range, channel_id)?;

            let mut palette: Vec<u32> = values.iter().copied().collect::<FxHashSet<_>>().into_iter().collect();
            palette.sort_unstable();
            let variant_n = palette.len() as u32;
            let bits_per_variant = ceil_log2(variant_n);

            let mut block = Vec::with_capacity(4 + palette.len() * 4);
            block.extend_from_slice(&variant_n.to_le_bytes());
            for value in &palette {
                block.extend_from_slice(&value.to_le_bytes());
            }
            let mut packed = vec![0u8; calc_packed_size(bits_per_variant, voxel_n)];
            for (i, value) in values.iter().enumerate() {
                let index = palette.binary_search(value).map_err(|_| {
                    GvoxError::new(
                        ErrorType::Unknown,
                        format!("{FORMAT}: value {value:#010x} missing from palette"),
                    )
                })?;
                bits::write_packed(&mut packed, i * bits_per_variant as usize, bits_per_variant, index as u32)?;
            }

            output.write(blit_ctx, position, &block)?;
            position += block.len();
            output.write(blit_ctx, position, &packed)?;
            position += packed.len();

            log::debug!("{FORMAT}: channel {} has {variant_n} variant(s)", channel_id.index());
        }
        Ok(())
    }
}
