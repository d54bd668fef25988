//! Voxel data interchange built around the gvox palette region codec.
//!
//! Data moves through four adapters: an input stream, a parse adapter that
//! exposes voxels through a uniform sampling interface, a serialize adapter
//! that re-encodes them, and an output stream. [`blit_region`] wires them up.

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::BitOr;
use std::sync::Arc;

use bitflags::bitflags;
use fxhash::FxHashMap;
use int_enum::IntEnum;
use parking_lot::Mutex;
use thiserror::Error;

pub mod adapters;
pub mod bits;
pub mod blob;
pub mod header;
pub mod palette;
pub mod region;
pub mod scan;

#[cfg(test)]
mod tests;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

pub fn get_version() -> Version {
    Version {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    }
}

/// Result codes shared by every adapter.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntEnum)]
pub enum ErrorType {
    Success = 0,
    Unknown = -1,
    InvalidParameter = -2,
    InputAdapter = -3,
    OutputAdapter = -4,
    ParseAdapterInvalidInput = -5,
    ParseAdapterRequestedChannelNotPresent = -6,
    SerializeAdapterUnrepresentableData = -7,
    BoundsViolation = -8,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{ty:?}: {message}")]
pub struct GvoxError {
    ty: ErrorType,
    message: String,
}

impl GvoxError {
    pub fn new(ty: ErrorType, message: impl Into<String>) -> Self {
        Self {
            ty,
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        self.ty
    }

    /// The numeric gvox result code.
    pub fn code(&self) -> i32 {
        self.ty.int_value()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Offset3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Offset3D {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent3D {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Extent3D {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Voxel count, saturating at `u64::MAX`.
    pub fn volume(&self) -> u64 {
        self.checked_volume().unwrap_or(u64::MAX)
    }

    /// Voxel count, or `None` when it does not fit in a `u64`.
    pub fn checked_volume(&self) -> Option<u64> {
        u64::from(self.x)
            .checked_mul(u64::from(self.y))?
            .checked_mul(u64::from(self.z))
    }
}

/// An axis-aligned box of voxels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RegionRange {
    pub offset: Offset3D,
    pub extent: Extent3D,
}

impl RegionRange {
    /// Serialized size: three `i32` offsets then three `u32` extents.
    pub const ENCODED_SIZE: usize = 24;

    pub const fn new(offset: Offset3D, extent: Extent3D) -> Self {
        Self { offset, extent }
    }

    pub fn is_empty(&self) -> bool {
        self.extent.x == 0 || self.extent.y == 0 || self.extent.z == 0
    }

    fn axis_end(offset: i32, extent: u32) -> i64 {
        i64::from(offset) + i64::from(extent)
    }

    pub fn contains(&self, p: &Offset3D) -> bool {
        let inside = |p: i32, o: i32, e: u32| p >= o && i64::from(p) < Self::axis_end(o, e);
        inside(p.x, self.offset.x, self.extent.x)
            && inside(p.y, self.offset.y, self.extent.y)
            && inside(p.z, self.offset.z, self.extent.z)
    }

    pub fn contains_range(&self, other: &RegionRange) -> bool {
        let inside = |o0: i32, e0: u32, o1: i32, e1: u32| {
            o1 >= o0 && Self::axis_end(o1, e1) <= Self::axis_end(o0, e0)
        };
        inside(self.offset.x, self.extent.x, other.offset.x, other.extent.x)
            && inside(self.offset.y, self.extent.y, other.offset.y, other.extent.y)
            && inside(self.offset.z, self.extent.z, other.offset.z, other.extent.z)
    }

    pub fn intersection(&self, other: &RegionRange) -> Option<RegionRange> {
        let axis = |o0: i32, e0: u32, o1: i32, e1: u32| -> Option<(i32, u32)> {
            let begin = o0.max(o1);
            let end = Self::axis_end(o0, e0).min(Self::axis_end(o1, e1));
            let extent = end - i64::from(begin);
            (extent > 0).then(|| (begin, extent as u32))
        };
        let (ox, ex) = axis(self.offset.x, self.extent.x, other.offset.x, other.extent.x)?;
        let (oy, ey) = axis(self.offset.y, self.extent.y, other.offset.y, other.extent.y)?;
        let (oz, ez) = axis(self.offset.z, self.extent.z, other.offset.z, other.extent.z)?;
        Some(RegionRange::new(Offset3D::new(ox, oy, oz), Extent3D::new(ex, ey, ez)))
    }

    /// Index of `p` in `x + y*ex + z*ex*ey` order, if inside.
    pub fn linear_index(&self, p: &Offset3D) -> Option<usize> {
        if !self.contains(p) {
            return None;
        }
        let x = (p.x - self.offset.x) as usize;
        let y = (p.y - self.offset.y) as usize;
        let z = (p.z - self.offset.z) as usize;
        let ex = self.extent.x as usize;
        let ey = self.extent.y as usize;
        Some(x + y * ex + z * ex * ey)
    }

    /// Calls `f` for every voxel position, x fastest.
    pub fn for_each_position(&self, mut f: impl FnMut(Offset3D)) {
        for zi in 0..self.extent.z {
            for yi in 0..self.extent.y {
                for xi in 0..self.extent.x {
                    f(Offset3D::new(
                        self.offset.x + xi as i32,
                        self.offset.y + yi as i32,
                        self.offset.z + zi as i32,
                    ));
                }
            }
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        let fields = [
            self.offset.x as u32,
            self.offset.y as u32,
            self.offset.z as u32,
            self.extent.x,
            self.extent.y,
            self.extent.z,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let field = |i: usize| bits::read_u32(bytes, i * 4);
        Some(Self {
            offset: Offset3D::new(field(0)? as i32, field(1)? as i32, field(2)? as i32),
            extent: Extent3D::new(field(3)?, field(4)?, field(5)?),
        })
    }
}

/// One channel, identified by its bit in a [`ChannelFlags`] mask.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

impl ChannelId {
    pub const COLOR: Self = Self(0);
    pub const NORMAL: Self = Self(1);
    pub const MATERIAL_ID: Self = Self(2);
    pub const ROUGHNESS: Self = Self(3);
    pub const METALNESS: Self = Self(4);
    pub const TRANSPARENCY: Self = Self(5);
    pub const IOR: Self = Self(6);
    pub const EMISSIVE_COLOR: Self = Self(7);
    pub const HARDNESS: Self = Self(8);
    pub const LIT_COLOR: Self = Self(9);
    pub const LAST: Self = Self(31);

    pub fn new(index: u8) -> Result<Self, GvoxError> {
        if u32::from(index) < u32::BITS {
            Ok(Self(index))
        } else {
            Err(GvoxError::new(
                ErrorType::InvalidParameter,
                format!("channel index {index} does not fit in a 32-bit channel mask"),
            ))
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    pub const fn bit(self) -> u32 {
        1 << self.0
    }
}

bitflags! {
    #[derive(Default)]
    pub struct ChannelFlags: u32 {
        const COLOR = 1 << 0;
        const NORMAL = 1 << 1;
        const MATERIAL_ID = 1 << 2;
        const ROUGHNESS = 1 << 3;
        const METALNESS = 1 << 4;
        const TRANSPARENCY = 1 << 5;
        const IOR = 1 << 6;
        const EMISSIVE_COLOR = 1 << 7;
        const HARDNESS = 1 << 8;
        const LIT_COLOR = 1 << 9;
        const ALL = u32::MAX;
    }
}

impl ChannelFlags {
    pub fn channel_n(self) -> usize {
        self.bits().count_ones() as usize
    }

    pub fn contains_id(self, id: ChannelId) -> bool {
        self.bits() & id.bit() != 0
    }

    /// Active channels in ascending bit order.
    pub fn ids(self) -> impl Iterator<Item = ChannelId> {
        let bits = self.bits();
        (0..u32::BITS as u8)
            .filter(move |i| bits & (1u32 << *i) != 0)
            .map(ChannelId)
    }

    /// Dense index of `id` among the active channels.
    pub fn index_of(self, id: ChannelId) -> Option<usize> {
        self.contains_id(id)
            .then(|| (self.bits() & (id.bit() - 1)).count_ones() as usize)
    }
}

impl From<ChannelId> for ChannelFlags {
    fn from(value: ChannelId) -> Self {
        Self::from_bits_truncate(value.bit())
    }
}

impl BitOr for ChannelId {
    type Output = ChannelFlags;

    fn bitor(self, rhs: Self) -> ChannelFlags {
        ChannelFlags::from(self) | ChannelFlags::from(rhs)
    }
}

impl BitOr<ChannelId> for ChannelFlags {
    type Output = ChannelFlags;

    fn bitor(self, rhs: ChannelId) -> ChannelFlags {
        self | ChannelFlags::from(rhs)
    }
}

/// Set in [`ParseAdapterHandler::query_region_flags`] results when every
/// voxel of the queried range holds the same value.
pub const REGION_FLAG_UNIFORM: u32 = 1 << 0;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub data: u32,
    pub is_present: bool,
}

impl Sample {
    pub const ABSENT: Self = Self {
        data: 0,
        is_present: false,
    };

    pub const fn present(data: u32) -> Self {
        Self {
            data,
            is_present: true,
        }
    }
}

/// A range loaded from a parse adapter, ready to be sampled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub range: RegionRange,
    pub channels: ChannelFlags,
    pub flags: u32,
}

/// Per-blit state shared by every adapter taking part in one [`blit_region`].
///
/// Region-local failures are pushed here instead of aborting the blit.
#[derive(Debug, Default)]
pub struct BlitContext {
    errors: Mutex<Vec<GvoxError>>,
}

impl BlitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_error(&self, error: GvoxError) {
        log::warn!("{error}");
        self.errors.lock().push(error);
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn take_errors(&self) -> Vec<GvoxError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

pub trait InputAdapterHandler: Send {
    fn read(
        &mut self,
        blit_ctx: &BlitContext,
        position: usize,
        data: &mut [u8],
    ) -> Result<(), GvoxError>;

    /// Total stream length, when known.
    fn size(&self) -> Option<usize> {
        None
    }
}

pub trait OutputAdapterHandler: Send {
    fn write(&mut self, blit_ctx: &BlitContext, position: usize, data: &[u8]) -> Result<(), GvoxError>;

    fn reserve(&mut self, _blit_ctx: &BlitContext, _size: usize) -> Result<(), GvoxError> {
        Ok(())
    }
}

/// A voxel source. Loading and sampling take `&self` so a serializer may
/// sample from many threads at once.
pub trait ParseAdapterHandler: Send + Sync {
    fn blit_begin(
        &mut self,
        blit_ctx: &BlitContext,
        input: &mut dyn InputAdapterHandler,
        range: Option<&RegionRange>,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError>;

    fn blit_end(&mut self, _blit_ctx: &BlitContext) -> Result<(), GvoxError> {
        Ok(())
    }

    /// The range of the parsed data, if the format stores one.
    fn range(&self) -> Option<RegionRange>;

    fn channel_flags(&self) -> ChannelFlags;

    fn query_region_flags(
        &self,
        blit_ctx: &BlitContext,
        range: &RegionRange,
        channel_id: ChannelId,
    ) -> Result<u32, GvoxError>;

    fn load_region_range(
        &self,
        blit_ctx: &BlitContext,
        range: &RegionRange,
        channel_flags: ChannelFlags,
    ) -> Result<Region, GvoxError>;

    fn sample_region(
        &self,
        blit_ctx: &BlitContext,
        region: &Region,
        offset: &Offset3D,
        channel_id: ChannelId,
    ) -> Sample;

    fn unload_region_range(&self, _blit_ctx: &BlitContext, _region: Region, _range: &RegionRange) {}
}

pub trait SerializeAdapterHandler: Send {
    fn blit_begin(
        &mut self,
        _blit_ctx: &BlitContext,
        _range: &RegionRange,
        _channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        Ok(())
    }

    fn serialize_region(
        &mut self,
        blit_ctx: &BlitContext,
        output: &mut dyn OutputAdapterHandler,
        parse: &dyn ParseAdapterHandler,
        range: &RegionRange,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError>;

    fn blit_end(&mut self, _blit_ctx: &BlitContext) -> Result<(), GvoxError> {
        Ok(())
    }
}

mod private {
    pub trait Sealed {}
}

pub trait AdapterKind: 'static + private::Sealed {
    type Handler: ?Sized + Send;

    fn factories(registry: &AdapterRegistry) -> &FxHashMap<&'static str, AdapterFactory<Self>>;

    fn factories_mut(
        registry: &mut AdapterRegistry,
    ) -> &mut FxHashMap<&'static str, AdapterFactory<Self>>;
}

pub type AdapterFactory<K> = Box<
    dyn Fn(&dyn Any) -> Result<Box<<K as AdapterKind>::Handler>, GvoxError> + Send + Sync,
>;

/// Erases a concrete handler into the trait object of adapter kind `K`.
pub trait IntoDynHandler<K: AdapterKind> {
    fn into_dyn(self) -> Box<K::Handler>;
}

macro_rules! adapter_kind {
    ($kind:ident, $handler:ident, $field:ident) => {
        pub struct $kind;

        impl private::Sealed for $kind {}

        impl AdapterKind for $kind {
            type Handler = dyn $handler;

            fn factories(registry: &AdapterRegistry) -> &FxHashMap<&'static str, AdapterFactory<Self>> {
                &registry.$field
            }

            fn factories_mut(
                registry: &mut AdapterRegistry,
            ) -> &mut FxHashMap<&'static str, AdapterFactory<Self>> {
                &mut registry.$field
            }
        }

        impl<T: $handler + 'static> IntoDynHandler<$kind> for T {
            fn into_dyn(self) -> Box<dyn $handler> {
                Box::new(self)
            }
        }
    };
}

adapter_kind!(Input, InputAdapterHandler, input);
adapter_kind!(Output, OutputAdapterHandler, output);
adapter_kind!(Parse, ParseAdapterHandler, parse);
adapter_kind!(Serialize, SerializeAdapterHandler, serialize);

pub trait NamedAdapter {
    fn name() -> &'static str;
}

pub trait AdapterDescriptor<K: AdapterKind>: NamedAdapter + 'static {
    type Configuration: Any + Send;
    type Handler: BaseAdapterHandler<K, Self> + IntoDynHandler<K>;
}

pub trait BaseAdapterHandler<K: AdapterKind, D: AdapterDescriptor<K> + ?Sized>: Sized {
    fn create(config: &D::Configuration) -> Result<Self, GvoxError>;
}

/// Adapter factories, one table per kind. Names are unique within a kind.
#[derive(Default)]
pub struct AdapterRegistry {
    input: FxHashMap<&'static str, AdapterFactory<Input>>,
    output: FxHashMap<&'static str, AdapterFactory<Output>>,
    parse: FxHashMap<&'static str, AdapterFactory<Parse>>,
    serialize: FxHashMap<&'static str, AdapterFactory<Serialize>>,
}

impl AdapterRegistry {
    fn register<K: AdapterKind, D: AdapterDescriptor<K>>(&mut self) {
        let factory: AdapterFactory<K> = Box::new(|config: &dyn Any| {
            let config = config.downcast_ref::<D::Configuration>().ok_or_else(|| {
                GvoxError::new(
                    ErrorType::InvalidParameter,
                    format!("wrong configuration type for adapter '{}'", D::name()),
                )
            })?;
            let handler = <D::Handler as BaseAdapterHandler<K, D>>::create(config)?;
            Ok(<D::Handler as IntoDynHandler<K>>::into_dyn(handler))
        });
        K::factories_mut(self).insert(D::name(), factory);
    }

    fn create<K: AdapterKind>(
        &self,
        name: &str,
        config: &dyn Any,
    ) -> Result<(&'static str, Box<K::Handler>), GvoxError> {
        let (name, factory) = K::factories(self).get_key_value(name).ok_or_else(|| {
            GvoxError::new(
                ErrorType::InvalidParameter,
                format!("no adapter named '{name}' is registered"),
            )
        })?;
        Ok((*name, factory(config)?))
    }
}

type ResultList = Arc<Mutex<VecDeque<GvoxError>>>;

/// Owns the adapter registry and the queue of reported errors.
pub struct Context {
    registry: AdapterRegistry,
    results: ResultList,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a context with the standard adapters registered.
    pub fn new() -> Self {
        let mut ctx = Self::empty();
        adapters::register_standard_adapters(&mut ctx);
        ctx
    }

    pub fn empty() -> Self {
        Self {
            registry: AdapterRegistry::default(),
            results: ResultList::default(),
        }
    }

    pub fn register_adapter<K: AdapterKind, D: AdapterDescriptor<K>>(&mut self) {
        self.registry.register::<K, D>();
    }

    pub fn has_adapter<K: AdapterKind>(&self, name: &str) -> bool {
        K::factories(&self.registry).contains_key(name)
    }

    pub fn get_adapter<K: AdapterKind, D: AdapterDescriptor<K>>(
        &self,
    ) -> Result<Adapter<'_, K, D>, GvoxError> {
        if self.has_adapter::<K>(D::name()) {
            Ok(Adapter {
                ctx: self,
                marker: PhantomData,
            })
        } else {
            Err(GvoxError::new(
                ErrorType::InvalidParameter,
                format!("adapter '{}' is not registered", D::name()),
            ))
        }
    }

    /// Creates an adapter context from a name looked up at runtime. `config`
    /// must hold the adapter's configuration type.
    pub fn create_adapter_context_by_name<K: AdapterKind>(
        &self,
        name: &str,
        config: Box<dyn Any>,
    ) -> Result<AdapterContext<K>, GvoxError> {
        let (name, handler) = self
            .registry
            .create::<K>(name, config.as_ref())
            .map_err(|e| {
                self.push_error(e.clone());
                e
            })?;
        Ok(AdapterContext {
            name,
            handler,
            results: self.results.clone(),
        })
    }

    pub fn push_error(&self, error: GvoxError) {
        self.results.lock().push_back(error);
    }

    /// The code of the oldest unread error, or `Success`.
    pub fn result(&self) -> ErrorType {
        self.results
            .lock()
            .front()
            .map_or(ErrorType::Success, GvoxError::error_type)
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().len()
    }

    pub fn pop_result(&self) -> Option<GvoxError> {
        self.results.lock().pop_front()
    }

    pub fn drain_results(&self) -> Vec<GvoxError> {
        self.results.lock().drain(..).collect()
    }
}

/// A registered adapter of a known type.
pub struct Adapter<'a, K: AdapterKind, D: AdapterDescriptor<K>> {
    ctx: &'a Context,
    marker: PhantomData<(K, D)>,
}

impl<'a, K: AdapterKind, D: AdapterDescriptor<K>> Adapter<'a, K, D> {
    pub fn name(&self) -> &'static str {
        D::name()
    }

    pub fn create_adapter_context(
        &self,
        config: D::Configuration,
    ) -> Result<AdapterContext<K>, GvoxError> {
        self.ctx
            .create_adapter_context_by_name::<K>(D::name(), Box::new(config))
    }
}

/// A live adapter instance.
pub struct AdapterContext<K: AdapterKind> {
    name: &'static str,
    handler: Box<K::Handler>,
    results: ResultList,
}

impl<K: AdapterKind> AdapterContext<K> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn handler(&self) -> &K::Handler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut K::Handler {
        &mut self.handler
    }
}

/// Parses `input` and re-serializes `range` (or the parsed range, if `None`)
/// of the selected channels into `output`.
///
/// Region-local errors are queued on the owning [`Context`] and do not fail the
/// blit. A returned error is queued as well.
pub fn blit_region(
    input_ctx: &mut AdapterContext<Input>,
    output_ctx: &mut AdapterContext<Output>,
    parse_ctx: &mut AdapterContext<Parse>,
    serialize_ctx: &mut AdapterContext<Serialize>,
    range: Option<&RegionRange>,
    channel_flags: ChannelFlags,
) -> Result<(), GvoxError> {
    let blit_ctx = BlitContext::new();
    let result = run_blit(
        &blit_ctx,
        input_ctx,
        output_ctx,
        parse_ctx,
        serialize_ctx,
        range,
        channel_flags,
    );

    let mut results = parse_ctx.results.lock();
    results.extend(blit_ctx.take_errors());
    if let Err(e) = &result {
        results.push_back(e.clone());
    }
    result
}

fn run_blit(
    blit_ctx: &BlitContext,
    input_ctx: &mut AdapterContext<Input>,
    output_ctx: &mut AdapterContext<Output>,
    parse_ctx: &mut AdapterContext<Parse>,
    serialize_ctx: &mut AdapterContext<Serialize>,
    range: Option<&RegionRange>,
    channel_flags: ChannelFlags,
) -> Result<(), GvoxError> {
    if channel_flags.is_empty() {
        return Err(GvoxError::new(
            ErrorType::InvalidParameter,
            "no channels were requested",
        ));
    }

    let parse = parse_ctx.handler.as_mut();
    parse.blit_begin(blit_ctx, input_ctx.handler.as_mut(), range, channel_flags)?;

    let Some(range) = range.copied().or_else(|| parse.range()) else {
        return Err(GvoxError::new(
            ErrorType::InvalidParameter,
            format!(
                "no range was given and parse adapter '{}' does not provide one",
                parse_ctx.name
            ),
        ));
    };
    log::debug!(
        "blit {} -> {}: {:?}, {} channel(s)",
        parse_ctx.name,
        serialize_ctx.name,
        range,
        channel_flags.channel_n()
    );

    let serialize = serialize_ctx.handler.as_mut();
    serialize.blit_begin(blit_ctx, &range, channel_flags)?;
    serialize.serialize_region(
        blit_ctx,
        output_ctx.handler.as_mut(),
        &*parse,
        &range,
        channel_flags,
    )?;
    serialize.blit_end(blit_ctx)?;
    parse.blit_end(blit_ctx)
}
