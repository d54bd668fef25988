//! The `gvox_octree` stream: one preorder octree per channel over the
//! smallest power-of-two cube holding the range.
//!
//! ```text
//! 0   u32    magic "gvo\0"
//! 4   24     range
//! 28  u32    channel_flags
//! 32  u32    channel_n
//! 36  u32    depth, log2 of the cube edge
//! per channel, ascending:
//!     u32        node byte count
//!     nodes, preorder: 0u8 + u32 value for a leaf, 1u8 + eight children for a branch
//! ```
//!
//! Children are ordered by octant, bit 0 for +x, bit 1 for +y, bit 2 for +z.
//! Cells outside the range take whatever value lets their parent collapse.

use rayon::ThreadPool;

use super::{
    build_thread_pool, check_channel_count, check_requested_channels, magic_u32, parse_prelude,
    read_at, sample_dense, voxel_count, GvoxOctree, GvoxOctreeSerializeConfig,
};
use crate::bits::ceil_log2;
use crate::*;

const FORMAT: &str = "gvox_octree";
pub const MAGIC: [u8; 4] = *b"gvo\0";
pub const HEADER_SIZE: usize = 4 + RegionRange::ENCODED_SIZE + 12;

const LEAF_TAG: u8 = 0;
const BRANCH_TAG: u8 = 1;

/// Depth of the tree whose root cube covers `extent`.
pub fn octree_depth(extent: &Extent3D) -> u32 {
    ceil_log2(extent.x.max(extent.y).max(extent.z).max(1))
}

fn octant(rel: [u64; 3], half: u64) -> usize {
    (0..3).fold(0, |child, axis| child | (usize::from(rel[axis] & half != 0) << axis))
}

fn child_origin(origin: [u64; 3], child: usize, half: u64) -> [u64; 3] {
    std::array::from_fn(|axis| origin[axis] + if child >> axis & 1 != 0 { half } else { 0 })
}

fn invalid(message: String) -> GvoxError {
    GvoxError::new(ErrorType::ParseAdapterInvalidInput, message)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OctreeNode {
    Leaf(u32),
    /// Index of the first of eight consecutive children.
    Branch(usize),
}

#[derive(Debug)]
struct Octree {
    nodes: Vec<OctreeNode>,
    depth: u32,
}

struct NodeReader<'a> {
    bytes: &'a [u8],
    position: usize,
    nodes: Vec<OctreeNode>,
}

impl<'a> NodeReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], GvoxError> {
        let bytes = self
            .bytes
            .get(self.position..self.position + len)
            .ok_or_else(|| invalid(format!("{FORMAT}: node data ends at byte {}", self.position)))?;
        self.position += len;
        Ok(bytes)
    }

    fn node(&mut self, slot: usize, levels: u32) -> Result<(), GvoxError> {
        let node = match self.take(1)?[0] {
            LEAF_TAG => {
                let bytes = self.take(4)?;
                OctreeNode::Leaf(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            BRANCH_TAG if levels > 0 => {
                let first = self.nodes.len();
                self.nodes.resize(first + 8, OctreeNode::Leaf(0));
                for child in 0..8 {
                    self.node(first + child, levels - 1)?;
                }
                OctreeNode::Branch(first)
            }
            BRANCH_TAG => return Err(invalid(format!("{FORMAT}: branch below voxel level"))),
            tag => return Err(invalid(format!("{FORMAT}: unknown node tag {tag}"))),
        };
        self.nodes[slot] = node;
        Ok(())
    }
}

impl Octree {
    fn parse(bytes: &[u8], depth: u32) -> Result<Self, GvoxError> {
        let mut reader = NodeReader {
            bytes,
            position: 0,
            nodes: vec![OctreeNode::Leaf(0)],
        };
        reader.node(0, depth)?;
        if reader.position != bytes.len() {
            return Err(invalid(format!(
                "{FORMAT}: {} trailing node bytes",
                bytes.len() - reader.position
            )));
        }
        Ok(Self {
            nodes: reader.nodes,
            depth,
        })
    }

    /// Value at `rel`, relative to the root cube's corner.
    fn get(&self, rel: [u64; 3]) -> Option<u32> {
        let mut half = (1u64 << self.depth) >> 1;
        let mut node = *self.nodes.first()?;
        loop {
            match node {
                OctreeNode::Leaf(value) => return Some(value),
                OctreeNode::Branch(first) => {
                    node = *self.nodes.get(first + octant(rel, half))?;
                    half >>= 1;
                }
            }
        }
    }

    /// The single value of every leaf touching `[lo, hi)`, if there is one.
    fn uniform_value(&self, lo: [u64; 3], hi: [u64; 3]) -> Option<u32> {
        let mut value = None;
        let uniform = self.visit(0, [0; 3], 1u64 << self.depth, lo, hi, &mut value);
        value.filter(|_| uniform)
    }

    fn visit(
        &self,
        index: usize,
        origin: [u64; 3],
        size: u64,
        lo: [u64; 3],
        hi: [u64; 3],
        value: &mut Option<u32>,
    ) -> bool {
        if (0..3).any(|axis| origin[axis] >= hi[axis] || origin[axis] + size <= lo[axis]) {
            return true;
        }
        match self.nodes.get(index) {
            None => false,
            Some(OctreeNode::Leaf(v)) => *value.get_or_insert(*v) == *v,
            Some(OctreeNode::Branch(first)) => {
                let half = size / 2;
                (0..8).all(|child| {
                    self.visit(first + child, child_origin(origin, child, half), half, lo, hi, value)
                })
            }
        }
    }
}

struct OctreeStream {
    range: RegionRange,
    channel_flags: ChannelFlags,
    channels: Vec<Octree>,
}

impl OctreeStream {
    fn relative(&self, p: &Offset3D) -> Option<[u64; 3]> {
        if !self.range.contains(p) {
            return None;
        }
        let axis = |p: i32, o: i32| (i64::from(p) - i64::from(o)) as u64;
        Some([
            axis(p.x, self.range.offset.x),
            axis(p.y, self.range.offset.y),
            axis(p.z, self.range.offset.z),
        ])
    }
}

/// Parses a `gvox_octree` stream and answers samples by descending the tree.
#[derive(Default)]
pub struct GvoxOctreeParser {
    stream: Option<OctreeStream>,
}

impl BaseAdapterHandler<Parse, GvoxOctree> for GvoxOctreeParser {
    fn create(_config: &()) -> Result<Self, GvoxError> {
        Ok(Self::default())
    }
}

impl GvoxOctreeParser {
    fn stream(&self) -> Result<&OctreeStream, GvoxError> {
        self.stream.as_ref().ok_or_else(|| {
            GvoxError::new(
                ErrorType::InvalidParameter,
                format!("{FORMAT}: no stream has been parsed yet"),
            )
        })
    }

    /// Nodes in a channel's tree, leaves and branches alike.
    pub fn node_count(&self, channel_id: ChannelId) -> Option<usize> {
        let stream = self.stream.as_ref()?;
        let channel_index = stream.channel_flags.index_of(channel_id)?;
        Some(stream.channels[channel_index].nodes.len())
    }
}

impl ParseAdapterHandler for GvoxOctreeParser {
    fn blit_begin(
        &mut self,
        blit_ctx: &BlitContext,
        input: &mut dyn InputAdapterHandler,
        _range: Option<&RegionRange>,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        let head = read_at(blit_ctx, input, 0, HEADER_SIZE, "gvox_octree header")?;
        let range = parse_prelude(&head, MAGIC, FORMAT)?;
        let field = |offset: usize| bits::read_u32(&head, offset).unwrap_or(0);
        let stored_flags = ChannelFlags::from_bits_truncate(field(28));
        check_channel_count(stored_flags, field(32), FORMAT)?;
        check_requested_channels(stored_flags, channel_flags, FORMAT)?;

        let depth = field(36);
        if depth != octree_depth(&range.extent) {
            return Err(invalid(format!(
                "{FORMAT}: depth {depth} does not fit {:?}",
                range.extent
            )));
        }

        let mut position = HEADER_SIZE;
        let mut channels = Vec::with_capacity(stored_flags.channel_n());
        for channel_id in stored_flags.ids() {
            let len = read_at(blit_ctx, input, position, 4, "gvox_octree node count")?;
            let len = bits::read_u32(&len, 0).unwrap_or(0) as usize;
            position += 4;
            let nodes = read_at(blit_ctx, input, position, len, "gvox_octree nodes")?;
            position += len;

            let tree = Octree::parse(&nodes, depth)?;
            log::trace!(
                "{FORMAT}: channel {} has {} node(s)",
                channel_id.index(),
                tree.nodes.len()
            );
            channels.push(tree);
        }

        self.stream = Some(OctreeStream {
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
        if range.is_empty() || !stream.range.contains_range(range) {
            return Ok(0);
        }
        let channel_index = stream.channel_flags.index_of(channel_id).unwrap_or(0);
        let Some(lo) = stream.relative(&range.offset) else {
            return Ok(0);
        };
        let extent = [range.extent.x, range.extent.y, range.extent.z];
        let hi = std::array::from_fn(|axis| lo[axis] + u64::from(extent[axis]));
        let uniform = stream.channels[channel_index].uniform_value(lo, hi).is_some();
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
        let (Some(rel), Some(channel_index)) =
            (stream.relative(offset), stream.channel_flags.index_of(channel_id))
        else {
            return Sample::ABSENT;
        };
        stream.channels[channel_index]
            .get(rel)
            .map_or(Sample::ABSENT, Sample::present)
    }
}

/// A serialize-time tree node. `Leaf(None)` covers only cells outside the
/// range.
enum Cell {
    Leaf(Option<u32>),
    Branch(Box<[Cell; 8]>),
}

/// One channel of the range, densely sampled.
struct DenseChannel<'a> {
    values: &'a [u32],
    extent: [u64; 3],
}

impl DenseChannel<'_> {
    fn build(&self, origin: [u64; 3], size: u64) -> Cell {
        if (0..3).any(|axis| origin[axis] >= self.extent[axis]) {
            return Cell::Leaf(None);
        }
        if size == 1 {
            let [ex, ey, _] = self.extent;
            let index = origin[0] + ex * (origin[1] + ey * origin[2]);
            return Cell::Leaf(self.values.get(index as usize).copied());
        }
        let half = size / 2;
        let children: [Cell; 8] = std::array::from_fn(|child| self.build(child_origin(origin, child, half), half));
        match collapsed(&children) {
            Some(value) => Cell::Leaf(value),
            None => Cell::Branch(Box::new(children)),
        }
    }
}

/// The leaf value eight siblings merge into, or `None` if they differ.
fn collapsed(children: &[Cell; 8]) -> Option<Option<u32>> {
    let mut value = None;
    for child in children {
        match child {
            Cell::Branch(_) => return None,
            Cell::Leaf(Some(v)) if value.is_some_and(|u| u != *v) => return None,
            Cell::Leaf(Some(v)) => value = Some(*v),
            Cell::Leaf(None) => {}
        }
    }
    Some(value)
}

fn write_cell(cell: &Cell, out: &mut Vec<u8>) {
    match cell {
        Cell::Leaf(value) => {
            out.push(LEAF_TAG);
            out.extend_from_slice(&value.unwrap_or(0).to_le_bytes());
        }
        Cell::Branch(children) => {
            out.push(BRANCH_TAG);
            for child in children.iter() {
                write_cell(child, out);
            }
        }
    }
}

pub struct GvoxOctreeSerializer {
    pool: Option<ThreadPool>,
}

impl BaseAdapterHandler<Serialize, GvoxOctree> for GvoxOctreeSerializer {
    fn create(config: &GvoxOctreeSerializeConfig) -> Result<Self, GvoxError> {
        Ok(Self {
            pool: build_thread_pool(config.parallel, config.thread_count)?,
        })
    }
}

impl SerializeAdapterHandler for GvoxOctreeSerializer {
    fn serialize_region(
        &mut self,
        blit_ctx: &BlitContext,
        output: &mut dyn OutputAdapterHandler,
        parse: &dyn ParseAdapterHandler,
        range: &RegionRange,
        channel_flags: ChannelFlags,
    ) -> Result<(), GvoxError> {
        voxel_count(range, ErrorType::SerializeAdapterUnrepresentableData, FORMAT)?;
        let depth = octree_depth(&range.extent);

        let mut head = Vec::with_capacity(HEADER_SIZE);
        head.extend_from_slice(&magic_u32(MAGIC).to_le_bytes());
        head.extend_from_slice(&range.to_bytes());
        head.extend_from_slice(&channel_flags.bits().to_le_bytes());
        head.extend_from_slice(&(channel_flags.channel_n() as u32).to_le_bytes());
        head.extend_from_slice(&depth.to_le_bytes());
        output.write(blit_ctx, 0, &head)?;

        let mut position = HEADER_SIZE;
        for channel_id in channel_flags.ids() {
            let values = sample_dense(self.pool.as_ref(), blit_ctx, parse, range, channel_id)?;
            let dense = DenseChannel {
                values: &values,
                extent: [range.extent.x, range.extent.y, range.extent.z].map(u64::from),
            };
            let root = dense.build([0; 3], 1u64 << depth);

            let mut nodes = Vec::new();
            write_cell(&root, &mut nodes);
            let len = u32::try_from(nodes.len()).map_err(|_| {
                GvoxError::new(
                    ErrorType::SerializeAdapterUnrepresentableData,
                    format!("{FORMAT}: channel {} needs {} node bytes", channel_id.index(), nodes.len()),
                )
            })?;

            output.write(blit_ctx, position, &len.to_le_bytes())?;
            output.write(blit_ctx, position + 4, &nodes)?;
            position += 4 + nodes.len();

            log::debug!("{FORMAT}: channel {} takes {len} node bytes", channel_id.index());
        }
        Ok(())
    }
}
