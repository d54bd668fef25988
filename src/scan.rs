//! Parallel population and encoding of palette regions.
//!
//! The scan splits the source range into slabs along its longest axis and
//! samples each slab on the thread pool. Slabs do not line up with regions,
//! so each region's accumulators sit behind their own lock.

use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::blob::BlobAllocator;
use crate::header::ChannelHeaderTable;
use crate::palette::{EncodedRegion, PaletteRegion};
use crate::region::{LocalPos, RegionCoord, RegionGrid};
use crate::{
    BlitContext, ChannelFlags, GvoxError, ParseAdapterHandler, RegionRange, Sample,
    REGION_FLAG_UNIFORM,
};

pub const DEFAULT_SLAB_COUNT: u32 = 32;

/// Order in which encoded blobs are appended to the blob area.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlobOrder {
    /// Region-index order; output bytes do not depend on scheduling.
    #[default]
    Ordered,
    /// Completion order, straight from the workers.
    Concurrent,
}

/// Splits `range` along its longest axis into `slab_count` equal slabs plus
/// one slab holding the `extent % slab_count` tail.
pub fn split_slabs(range: &RegionRange, slab_count: u32) -> Vec<RegionRange> {
    let slab_count = slab_count.max(1);
    let e = range.extent;
    let axis = if e.x >= e.y && e.x >= e.z {
        0
    } else if e.y >= e.z {
        1
    } else {
        2
    };
    let axis_extent = [e.x, e.y, e.z][axis];
    let slab_size = axis_extent / slab_count;
    let remainder = axis_extent % slab_count;

    let slab = |begin: u32, size: u32| {
        let mut offset = range.offset;
        let mut extent = range.extent;
        match axis {
            0 => (offset.x, extent.x) = (offset.x + begin as i32, size),
            1 => (offset.y, extent.y) = (offset.y + begin as i32, size),
            _ => (offset.z, extent.z) = (offset.z + begin as i32, size),
        }
        RegionRange::new(offset, extent)
    };

    let mut slabs = Vec::with_capacity(slab_count as usize + 1);
    if slab_size > 0 {
        slabs.extend((0..slab_count).map(|i| slab(i * slab_size, slab_size)));
    }
    if remainder > 0 {
        slabs.push(slab(slab_size * slab_count, remainder));
    }
    slabs
}

/// Runs `f` over `items` on `pool`, or inline without one. Results keep the
/// order of `items`.
pub fn par_map<T, R, F>(pool: Option<&ThreadPool>, items: Vec<T>, f: F) -> Result<Vec<R>, GvoxError>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R, GvoxError> + Sync + Send,
{
    match pool {
        Some(pool) => pool.install(|| items.into_par_iter().map(f).collect()),
        None => items.into_iter().map(f).collect(),
    }
}

/// Palette regions of every (region, channel), locked per region.
#[derive(Debug)]
pub struct RegionAccumulators {
    grid: RegionGrid,
    channel_flags: ChannelFlags,
    regions: Vec<Mutex<Vec<Option<PaletteRegion>>>>,
}

impl RegionAccumulators {
    pub fn new(grid: RegionGrid, channel_flags: ChannelFlags) -> Self {
        let channel_n = channel_flags.channel_n();
        let regions = (0..grid.region_n())
            .map(|_| Mutex::new(vec![None; channel_n]))
            .collect();
        Self {
            grid,
            channel_flags,
            regions,
        }
    }

    pub fn grid(&self) -> &RegionGrid {
        &self.grid
    }

    pub fn channel_n(&self) -> usize {
        self.channel_flags.channel_n()
    }

    /// Records samples of one region. Palette regions are created on the
    /// first present sample.
    pub fn record(&self, region_index: usize, samples: &[(usize, LocalPos, Sample)]) {
        let Some(slot) = self.regions.get(region_index) else {
            return;
        };
        let mut channels = slot.lock();
        for &(channel_index, local, sample) in samples {
            if !sample.is_present {
                continue;
            }
            if let Some(channel) = channels.get_mut(channel_index) {
                channel
                    .get_or_insert_with(PaletteRegion::new)
                    .record(local, sample.data, true);
            }
        }
    }

    /// Samples every voxel of `slab` from `parse` and records it.
    pub fn scan_slab(
        &self,
        blit_ctx: &BlitContext,
        parse: &dyn ParseAdapterHandler,
        slab: &RegionRange,
    ) -> Result<(), GvoxError> {
        let Some([rx, ry, rz]) = self.grid.regions_overlapping(slab) else {
            return Ok(());
        };
        log::trace!("scanning slab {slab:?}");

        let mut staged = Vec::new();
        for z in rz {
            for y in ry.clone() {
                for x in rx.clone() {
                    let coord = RegionCoord::new(x, y, z);
                    let Some(sub) = self
                        .grid
                        .clipped_region_range(coord)
                        .and_then(|r| r.intersection(slab))
                    else {
                        continue;
                    };
                    staged.clear();
                    self.sample_range(blit_ctx, parse, &sub, &mut staged)?;
                    self.record(self.grid.region_index(coord), &staged);
                }
            }
        }
        Ok(())
    }

    fn sample_range(
        &self,
        blit_ctx: &BlitContext,
        parse: &dyn ParseAdapterHandler,
        sub: &RegionRange,
        staged: &mut Vec<(usize, LocalPos, Sample)>,
    ) -> Result<(), GvoxError> {
        let region = parse.load_region_range(blit_ctx, sub, self.channel_flags)?;
        for (channel_index, channel_id) in self.channel_flags.ids().enumerate() {
            let uniform = parse.query_region_flags(blit_ctx, sub, channel_id)? & REGION_FLAG_UNIFORM != 0;
            let uniform_sample =
                uniform.then(|| parse.sample_region(blit_ctx, &region, &sub.offset, channel_id));
            sub.for_each_position(|p| {
                let Some((_, local)) = self.grid.locate(&p) else {
                    return;
                };
                let sample = match uniform_sample {
                    Some(sample) => sample,
                    None => parse.sample_region(blit_ctx, &region, &p, channel_id),
                };
                staged.push((channel_index, local, sample));
            });
        }
        parse.unload_region_range(blit_ctx, region, sub);
        Ok(())
    }

    fn into_regions(self) -> Vec<Vec<Option<PaletteRegion>>> {
        self.regions.into_iter().map(Mutex::into_inner).collect()
    }

    /// Finalizes and encodes every (region, channel), appending payloads to
    /// `blobs` and returning the filled header table.
    pub fn encode(
        self,
        pool: Option<&ThreadPool>,
        blob_order: BlobOrder,
        blobs: &BlobAllocator,
    ) -> Result<ChannelHeaderTable, GvoxError> {
        let region_n = self.grid.region_n();
        let channel_n = self.channel_n();
        let regions = self.into_regions();

        let encode_region = |channels: Vec<Option<PaletteRegion>>| {
            channels
                .into_iter()
                .map(|channel| channel.map_or(Ok(EncodedRegion::Uniform(0)), PaletteRegion::encode))
                .collect::<Result<Vec<_>, GvoxError>>()
        };

        let headers = match blob_order {
            BlobOrder::Ordered => {
                let encoded = par_map(pool, regions, encode_region)?;
                encoded
                    .iter()
                    .map(|channels| {
                        channels
                            .iter()
                            .map(|e| e.commit(blobs))
                            .collect::<Result<Vec<_>, GvoxError>>()
                    })
                    .collect::<Result<Vec<Vec<_>>, GvoxError>>()?
            }
            BlobOrder::Concurrent => par_map(pool, regions, |channels| {
                encode_region(channels)?
                    .iter()
                    .map(|e| e.commit(blobs))
                    .collect::<Result<Vec<_>, GvoxError>>()
            })?,
        };

        let mut table = ChannelHeaderTable::new(region_n, channel_n);
        for (region_index, channels) in headers.into_iter().enumerate() {
            for (channel_index, header) in channels.into_iter().enumerate() {
                table.set(region_index, channel_index, header)?;
            }
        }
        Ok(table)
    }
}

/// Samples all of `grid`'s range from `parse`, slab by slab. Blocks until
/// every slab is done; the first error stops the scan.
pub fn scan(
    blit_ctx: &BlitContext,
    parse: &dyn ParseAdapterHandler,
    grid: RegionGrid,
    channel_flags: ChannelFlags,
    pool: Option<&ThreadPool>,
    slab_count: u32,
) -> Result<RegionAccumulators, GvoxError> {
    let accumulators = RegionAccumulators::new(grid, channel_flags);
    let slabs = split_slabs(grid.range(), slab_count);
    par_map(pool, slabs, |slab| accumulators.scan_slab(blit_ctx, parse, &slab))?;
    Ok(accumulators)
}
