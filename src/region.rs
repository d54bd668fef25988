//! Tiling of a voxel range into fixed-size cubic regions.

use crate::bits::{REGION_SIZE, REGION_VOXEL_N};
use crate::{Extent3D, Offset3D, RegionRange};

/// Position of a region in the region grid.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RegionCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl RegionCoord {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

/// Position of a voxel inside its region, each axis in `0..REGION_SIZE`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LocalPos {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl LocalPos {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn is_valid(self) -> bool {
        self.x < REGION_SIZE && self.y < REGION_SIZE && self.z < REGION_SIZE
    }

    /// Row-major index `x + y*S + z*S*S`. Only below `REGION_VOXEL_N` when
    /// [`Self::is_valid`].
    pub const fn index(self) -> usize {
        let s = REGION_SIZE as usize;
        (self.x as usize)
            .wrapping_add((self.y as usize).wrapping_mul(s))
            .wrapping_add((self.z as usize).wrapping_mul(s * s))
    }

    pub const fn from_index(index: usize) -> Self {
        let i = index as u32;
        Self {
            x: i % REGION_SIZE,
            y: (i / REGION_SIZE) % REGION_SIZE,
            z: i / (REGION_SIZE * REGION_SIZE),
        }
    }
}

/// The region grid covering a range. The last region on each axis may stick
/// out of the range; voxels out there are absent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionGrid {
    range: RegionRange,
    region_nx: u32,
    region_ny: u32,
    region_nz: u32,
}

impl RegionGrid {
    /// `None` when the region count of `range` does not fit in a `usize`.
    pub fn new(range: RegionRange) -> Option<Self> {
        let grid = Self {
            range,
            region_nx: range.extent.x.div_ceil(REGION_SIZE),
            region_ny: range.extent.y.div_ceil(REGION_SIZE),
            region_nz: range.extent.z.div_ceil(REGION_SIZE),
        };
        grid.checked_region_n().map(|_| grid)
    }

    fn checked_region_n(&self) -> Option<usize> {
        (self.region_nx as usize)
            .checked_mul(self.region_ny as usize)?
            .checked_mul(self.region_nz as usize)
    }

    pub fn range(&self) -> &RegionRange {
        &self.range
    }

    pub fn region_nx(&self) -> u32 {
        self.region_nx
    }

    pub fn region_ny(&self) -> u32 {
        self.region_ny
    }

    pub fn region_nz(&self) -> u32 {
        self.region_nz
    }

    pub fn region_n(&self) -> usize {
        self.checked_region_n().unwrap_or(usize::MAX)
    }

    pub fn contains_coord(&self, coord: RegionCoord) -> bool {
        coord.x < self.region_nx && coord.y < self.region_ny && coord.z < self.region_nz
    }

    pub fn region_index(&self, coord: RegionCoord) -> usize {
        let nx = self.region_nx as usize;
        let ny = self.region_ny as usize;
        coord.x as usize + coord.y as usize * nx + coord.z as usize * nx * ny
    }

    pub fn region_coord(&self, region_index: usize) -> RegionCoord {
        let nx = self.region_nx as usize;
        let ny = self.region_ny as usize;
        RegionCoord::new(
            (region_index % nx) as u32,
            ((region_index / nx) % ny) as u32,
            (region_index / (nx * ny)) as u32,
        )
    }

    /// Region and local position holding `p`, or `None` outside the range.
    pub fn locate(&self, p: &Offset3D) -> Option<(RegionCoord, LocalPos)> {
        if !self.range.contains(p) {
            return None;
        }
        let rel_x = (p.x - self.range.offset.x) as u32;
        let rel_y = (p.y - self.range.offset.y) as u32;
        let rel_z = (p.z - self.range.offset.z) as u32;
        Some((
            RegionCoord::new(rel_x / REGION_SIZE, rel_y / REGION_SIZE, rel_z / REGION_SIZE),
            LocalPos::new(rel_x % REGION_SIZE, rel_y % REGION_SIZE, rel_z % REGION_SIZE),
        ))
    }

    /// Voxel position of `local` in region `coord`. Wraps around for
    /// coordinates outside the grid, so check [`Self::contains_coord`] first.
    pub fn position_of(&self, coord: RegionCoord, local: LocalPos) -> Offset3D {
        let axis = |o: i32, c: u32, l: u32| {
            (i64::from(o) + i64::from(c) * i64::from(REGION_SIZE) + i64::from(l)) as i32
        };
        Offset3D::new(
            axis(self.range.offset.x, coord.x, local.x),
            axis(self.range.offset.y, coord.y, local.y),
            axis(self.range.offset.z, coord.z, local.z),
        )
    }

    /// The full `REGION_SIZE³` box of a region, ignoring the range bounds.
    pub fn region_bounds(&self, coord: RegionCoord) -> RegionRange {
        RegionRange::new(
            self.position_of(coord, LocalPos::default()),
            Extent3D::new(REGION_SIZE, REGION_SIZE, REGION_SIZE),
        )
    }

    /// The part of a region that lies inside the range.
    pub fn clipped_region_range(&self, coord: RegionCoord) -> Option<RegionRange> {
        self.region_bounds(coord).intersection(&self.range)
    }

    /// Region coordinates overlapped by `range`, clamped to the grid.
    pub fn regions_overlapping(&self, range: &RegionRange) -> Option<[std::ops::Range<u32>; 3]> {
        let clipped = range.intersection(&self.range)?;
        let axis = |o: i32, e: u32, base: i32| {
            let begin = (o - base) as u32;
            begin / REGION_SIZE..(begin + e - 1) / REGION_SIZE + 1
        };
        Some([
            axis(clipped.offset.x, clipped.extent.x, self.range.offset.x),
            axis(clipped.offset.y, clipped.extent.y, self.range.offset.y),
            axis(clipped.offset.z, clipped.extent.z, self.range.offset.z),
        ])
    }

    pub fn for_each_region(&self, mut f: impl FnMut(usize, RegionCoord)) {
        for z in 0..self.region_nz {
            for y in 0..self.region_ny {
                for x in 0..self.region_nx {
                    let coord = RegionCoord::new(x, y, z);
                    f(self.region_index(coord), coord);
                }
            }
        }
    }
}

/// Iterates every local position of a region in row-major order.
pub fn local_positions() -> impl Iterator<Item = LocalPos> {
    (0..REGION_VOXEL_N).map(LocalPos::from_index)
}
