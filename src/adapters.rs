use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::scan::{par_map, BlobOrder, DEFAULT_SLAB_COUNT};
use crate::*;

mod byte_buffer;
mod gvox_global_palette;
mod gvox_octree;
mod gvox_palette;
mod gvox_raw;

pub use byte_buffer::{ByteBufferInput, ByteBufferOutput};
pub use gvox_global_palette::{GvoxGlobalPaletteParser, GvoxGlobalPaletteSerializer};
pub use gvox_octree::{GvoxOctreeParser, GvoxOctreeSerializer};
pub use gvox_palette::{GvoxPaletteParser, GvoxPaletteSerializer};
pub use gvox_raw::{GvoxRawParser, GvoxRawSerializer};

pub(crate) fn register_standard_adapters(ctx: &mut Context) {
    ctx.register_adapter::<Input, ByteBuffer>();
    ctx.register_adapter::<Output, ByteBuffer>();
    ctx.register_adapter::<Parse, GvoxPalette>();
    ctx.register_adapter::<Serialize, GvoxPalette>();
    ctx.register_adapter::<Parse, GvoxGlobalPalette>();
    ctx.register_adapter::<Serialize, GvoxGlobalPalette>();
    ctx.register_adapter::<Parse, GvoxOctree>();
    ctx.register_adapter::<Serialize, GvoxOctree>();
    ctx.register_adapter::<Parse, GvoxRaw>();
    ctx.register_adapter::<Serialize, GvoxRaw>();
}

pub struct ByteBuffer;

impl AdapterDescriptor<Input> for ByteBuffer {
    type Configuration = ByteBufferInputConfig;
    type Handler = ByteBufferInput;
}

impl AdapterDescriptor<Output> for ByteBuffer {
    type Configuration = ByteBufferOutputConfig;
    type Handler = ByteBufferOutput;
}

impl NamedAdapter for ByteBuffer {
    fn name() -> &'static str {
        "byte_buffer"
    }
}

#[derive(Clone, Debug)]
pub struct ByteBufferInputConfig {
    pub data: Arc<[u8]>,
}

impl From<Vec<u8>> for ByteBufferInputConfig {
    fn from(value: Vec<u8>) -> Self {
        Self { data: value.into() }
    }
}

impl From<&[u8]> for ByteBufferInputConfig {
    fn from(value: &[u8]) -> Self {
        Self { data: value.into() }
    }
}

/// Output sink shared with the caller, who reads the bytes back after the blit.
#[derive(Clone, Debug, Default)]
pub struct ByteBufferOutputConfig {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl ByteBufferOutputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock())
    }
}

pub struct GvoxPalette;

impl AdapterDescriptor<Parse> for GvoxPalette {
    type Configuration = ();
    type Handler = GvoxPaletteParser;
}

impl AdapterDescriptor<Serialize> for GvoxPalette {
    type Configuration = GvoxPaletteSerializeConfig;
    type Handler = GvoxPaletteSerializer;
}

impl NamedAdapter for GvoxPalette {
    fn name() -> &'static str {
        "gvox_palette"
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GvoxPaletteSerializeConfig {
    /// Worker count; hardware concurrency when `None`.
    pub thread_count: Option<NonZeroUsize>,
    /// Slabs the scan splits the longest axis into.
    pub slab_count: u32,
    /// Run the scan and encode on a thread pool.
    pub parallel: bool,
    pub blob_order: BlobOrder,
}

impl Default for GvoxPaletteSerializeConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            slab_count: DEFAULT_SLAB_COUNT,
            parallel: true,
            blob_order: BlobOrder::Ordered,
        }
    }
}

impl GvoxPaletteSerializeConfig {
    pub fn single_threaded() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }
}

pub struct GvoxGlobalPalette;

impl AdapterDescriptor<Parse> for GvoxGlobalPalette {
    type Configuration = ();
    type Handler = GvoxGlobalPaletteParser;
}

impl AdapterDescriptor<Serialize> for GvoxGlobalPalette {
    type Configuration = GvoxGlobalPaletteSerializeConfig;
    type Handler = GvoxGlobalPaletteSerializer;
}

impl NamedAdapter for GvoxGlobalPalette {
    fn name() -> &'static str {
        "gvox_global_palette"
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GvoxGlobalPaletteSerializeConfig {
    pub thread_count: Option<NonZeroUsize>,
    pub parallel: bool,
}

impl Default for GvoxGlobalPaletteSerializeConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            parallel: true,
        }
    }
}

pub struct GvoxOctree;

impl AdapterDescriptor<Parse> for GvoxOctree {
    type Configuration = ();
    type Handler = GvoxOctreeParser;
}

impl AdapterDescriptor<Serialize> for GvoxOctree {
    type Configuration = GvoxOctreeSerializeConfig;
    type Handler = GvoxOctreeSerializer;
}

impl NamedAdapter for GvoxOctree {
    fn name() -> &'static str {
        "gvox_octree"
    }
}

/// Sampling of the source runs on the pool; tree building does not.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GvoxOctreeSerializeConfig {
    pub thread_count: Option<NonZeroUsize>,
    pub parallel: bool,
}

impl Default for GvoxOctreeSerializeConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            parallel: true,
        }
    }
}

pub struct GvoxRaw;

impl AdapterDescriptor<Parse> for GvoxRaw {
    type Configuration = ();
    type Handler = GvoxRawParser;
}

impl AdapterDescriptor<Serialize> for GvoxRaw {
    type Configuration = ();
    type Handler = GvoxRawSerializer;
}

impl NamedAdapter for GvoxRaw {
    fn name() -> &'static str {
        "gvox_raw"
    }
}

pub(crate) fn build_thread_pool(
    parallel: bool,
    thread_count: Option<NonZeroUsize>,
) -> Result<Option<ThreadPool>, GvoxError> {
    if !parallel {
        return Ok(None);
    }
    let num_threads = thread_count.map_or(0, NonZeroUsize::get);
    ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map(Some)
        .map_err(|e| GvoxError::new(ErrorType::Unknown, format!("failed to start worker pool: {e}")))
}

pub(crate) fn magic_u32(magic: [u8; 4]) -> u32 {
    u32::from_le_bytes(magic)
}

/// Reads `len` bytes at `position`. A stream known to be too short is
/// reported as invalid input rather than an input failure.
pub(crate) fn read_at(
    blit_ctx: &BlitContext,
    input: &mut dyn InputAdapterHandler,
    position: usize,
    len: usize,
    what: &str,
) -> Result<Vec<u8>, GvoxError> {
    if let Some(size) = input.size() {
        if position.checked_add(len).map_or(true, |end| end > size) {
            return Err(GvoxError::new(
                ErrorType::ParseAdapterInvalidInput,
                format!("{what} truncated: needs {len} bytes at {position}, stream has {size}"),
            ));
        }
    }
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| {
        GvoxError::new(
            ErrorType::Unknown,
            format!("cannot allocate {len} bytes for {what}: {e}"),
        )
    })?;
    data.resize(len, 0);
    input.read(blit_ctx, position, &mut data)?;
    Ok(data)
}

/// Checks the magic and reads the range that follows it. `bytes` starts at
/// the stream's first byte.
pub(crate) fn parse_prelude(bytes: &[u8], magic: [u8; 4], format: &str) -> Result<RegionRange, GvoxError> {
    let invalid = |msg: String| GvoxError::new(ErrorType::ParseAdapterInvalidInput, msg);
    let found = bits::read_u32(bytes, 0).ok_or_else(|| invalid(format!("{format}: missing magic")))?;
    if found != magic_u32(magic) {
        return Err(invalid(format!(
            "{format}: bad magic {found:#010x}, expected {:#010x}",
            magic_u32(magic)
        )));
    }
    bytes
        .get(4..)
        .and_then(RegionRange::from_bytes)
        .ok_or_else(|| invalid(format!("{format}: missing range")))
}

pub(crate) fn check_channel_count(
    channel_flags: ChannelFlags,
    channel_n: u32,
    format: &str,
) -> Result<(), GvoxError> {
    if channel_flags.is_empty() || channel_flags.channel_n() != channel_n as usize {
        return Err(GvoxError::new(
            ErrorType::ParseAdapterInvalidInput,
            format!(
                "{format}: channel count {channel_n} does not match channel flags {:#010x}",
                channel_flags.bits()
            ),
        ));
    }
    Ok(())
}

pub(crate) fn check_requested_channels(
    available: ChannelFlags,
    requested: ChannelFlags,
    format: &str,
) -> Result<(), GvoxError> {
    if available.contains(requested) {
        Ok(())
    } else {
        Err(GvoxError::new(
            ErrorType::ParseAdapterRequestedChannelNotPresent,
            format!(
                "{format}: requested channels {:#010x} are not all in {:#010x}",
                requested.bits(),
                available.bits()
            ),
        ))
    }
}

/// Samples one channel of the whole range, one z slice per task. Absent
/// voxels read as `0`; the result is x fastest.
pub(crate) fn sample_dense(
    pool: Option<&ThreadPool>,
    blit_ctx: &BlitContext,
    parse: &dyn ParseAdapterHandler,
    range: &RegionRange,
    channel_id: ChannelId,
) -> Result<Vec<u32>, GvoxError> {
    let slices = par_map(pool, (0..range.extent.z).collect(), |zi| {
        let slice_range = RegionRange::new(
            Offset3D::new(range.offset.x, range.offset.y, range.offset.z + zi as i32),
            Extent3D::new(range.extent.x, range.extent.y, 1),
        );
        let region = parse.load_region_range(blit_ctx, &slice_range, channel_id.into())?;
        let mut values = Vec::with_capacity(range.extent.x as usize * range.extent.y as usize);
        slice_range.for_each_position(|p| {
            let sample = parse.sample_region(blit_ctx, &region, &p, channel_id);
            values.push(if sample.is_present { sample.data } else { 0 });
        });
        parse.unload_region_range(blit_ctx, region, &slice_range);
        Ok(values)
    })?;
    Ok(slices.concat())
}

/// Voxel count of `range` as a `usize`. `ty` is the error reported when it
/// does not fit: invalid input for parsers, unrepresentable data for
/// serializers.
pub(crate) fn voxel_count(range: &RegionRange, ty: ErrorType, format: &str) -> Result<usize, GvoxError> {
    range
        .extent
        .checked_volume()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| GvoxError::new(ty, format!("{format}: {:?} has too many voxels", range.extent)))
}
