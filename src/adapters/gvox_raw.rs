//! The `gvox_raw` stream: every voxel stored densely.
//!
//! ```text
//! 0   u32    magic "gvr\0"
//! 4   24     range
//! 28  u32    channel_flags
//! 32  u32    channel_n
//! 36  u32[voxel_n * channel_n]   x fastest, channels interleaved per voxel
//! ```

use super::{
    check_channel_count, check_requested_channels, magic_u32, parse_prelude, read_at, voxel_count,
    GvoxRaw,
};
use crate::*;

const FORMAT: &str = "gvox_raw";
pub const MAGIC: [u8; 4] = *b"gvr\0";
pub const HEADER_SIZE: usize = 4 + RegionRange::ENCODED_SIZE + 8;

struct RawStream {
    range: RegionRange,
    channel_flags: ChannelFlags,
    data: Vec<u8>,
}

#[derive(Default)]
pub struct GvoxRawParser {
    stream: Option<RawStream>,
}

impl BaseAdapterHandler<Parse, GvoxRaw> for GvoxRawParser {
    fn create(_config: &()) -> Result<Self, GvoxError> {
        Ok(Self::default())
    }
}

impl GvoxRawParser {
    fn stream(&self) -> Result<&RawStream, GvoxError> {
        self.stream.as_ref().ok_or_else(|| {
            GvoxError::new(
                ErrorType::InvalidParameter,
                format!("{FORMAT}: no stream has been parsed yet"),
            )
        })
    }
}

impl ParseAdapterHandler for GvoxRawParser {
    fn blit_begin(
        &mut self,
        blit_ctx: &BlitContext,
        input: &mut dyn InputAdapterHandler,
        _range: Option<&RegionRange>,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        let head = read_at(blit_ctx, input, 0, HEADER_SIZE, "gvox_raw header")?;
        let range = parse_prelude(&head, MAGIC, FORMAT)?;
        let field = |offset: usize| bits::read_u32(&head, offset).unwrap_or(0);
        let stored_flags = ChannelFlags::from_bits_truncate(field(28));
        check_channel_count(stored_flags, field(32), FORMAT)?;
        check_requested_channels(stored_flags, channel_flags, FORMAT)?;

        let data_len = voxel_count(&range, ErrorType::ParseAdapterInvalidInput, FORMAT)?
            .checked_mul(stored_flags.channel_n() * 4)
            .ok_or_else(|| {
                GvoxError::new(
                    ErrorType::ParseAdapterInvalidInput,
                    format!("{FORMAT}: {range:?} is too large"),
                )
            })?;
        let data = read_at(blit_ctx, input, HEADER_SIZE, data_len, "gvox_raw voxel data")?;
        self.stream = Some(RawStream {
            range,
            channel_flags: stored_flags,
            data,
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
        _range: &RegionRange,
        channel_id: ChannelId,
    ) -> Result<u32, GvoxError> {
        let stream = self.stream()?;
        check_requested_channels(stream.channel_flags, channel_id.into(), FORMAT)?;
        Ok(0)
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
        let channel_n = stream.channel_flags.channel_n();
        bits::read_u32(&stream.data, (voxel_index * channel_n + channel_index) * 4)
            .map_or(Sample::ABSENT, Sample::present)
    }
}

pub struct GvoxRawSerializer;

impl BaseAdapterHandler<Serialize, GvoxRaw> for GvoxRawSerializer {
    fn create(_config: &()) -> Result<Self, GvoxError> {
        Ok(Self)
    }
}

impl SerializeAdapterHandler for GvoxRawSerializer {
    fn serialize_region(
        &mut self,
        blit_ctx: &BlitContext,
        output: &mut dyn OutputAdapterHandler,
        parse: &dyn ParseAdapterHandler,
        range: &RegionRange,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        let channel_n = channel_flags.channel_n();
        let data_len = voxel_count(range, ErrorType::SerializeAdapterUnrepresentableData, FORMAT)?
            .checked_mul(channel_n * 4)
            .ok_or_else(|| {
                GvoxError::new(
                    ErrorType::SerializeAdapterUnrepresentableData,
                    format!("{FORMAT}: {range:?} is too large"),
                )
            })?;
        let slice_len = range.extent.x as usize * range.extent.y as usize * channel_n * 4;

        let mut head = Vec::with_capacity(HEADER_SIZE);
        head.extend_from_slice(&magic_u32(MAGIC).to_le_bytes());
        head.extend_from_slice(&range.to_bytes());
        head.extend_from_slice(&channel_flags.bits().to_le_bytes());
        head.extend_from_slice(&(channel_n as u32).to_le_bytes());
        output.reserve(blit_ctx, HEADER_SIZE + data_len)?;
        output.write(blit_ctx, 0, &head)?;

        let mut slice = Vec::with_capacity(slice_len);
        for zi in 0..range.extent.z {
            let slice_range = RegionRange::new(
                Offset3D::new(range.offset.x, range.offset.y, range.offset.z + zi as i32),
                Extent3D::new(range.extent.x, range.extent.y, 1),
            );
            let region = parse.load_region_range(blit_ctx, &slice_range, channel_flags)?;
            slice.clear();
            slice_range.for_each_position(|p| {
                for channel_id in channel_flags.ids() {
                    let sample = parse.sample_region(blit_ctx, &region, &p, channel_id);
                    let value = if sample.is_present { sample.data } else { 0 };
                    slice.extend_from_slice(&value.to_le_bytes());
                }
            });
            parse.unload_region_range(blit_ctx, region, &slice_range);
            output.write(blit_ctx, HEADER_SIZE + zi as usize * slice_len, &slice)?;
        }
        Ok(())
    }
}
