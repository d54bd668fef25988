//! Palette region codec: collects one region's voxels for one channel and
//! turns them into a [`ChannelHeader`] plus an optional blob payload.
//!
//! A region with `variant_n` distinct values is stored as
//!
//! - nothing, when `variant_n <= 1` (the header carries the value),
//! - a sorted `u32` palette followed by `ceil_log2(variant_n)`-bit indices,
//!   when `variant_n <= MAX_REGION_COMPRESSED_VARIANT_N`,
//! - `REGION_SIZE³` raw `u32` values otherwise.

use fxhash::FxHashSet;

use crate::bits::{
    self, calc_block_size, ceil_log2, MAX_REGION_ALLOCATION_SIZE, MAX_REGION_COMPRESSED_VARIANT_N,
    REGION_VOXEL_N,
};
use crate::blob::BlobAllocator;
use crate::header::{ChannelHeader, RegionEncoding};
use crate::region::LocalPos;
use crate::{ErrorType, GvoxError};

/// Serialize-time contents of one (region, channel) pair.
#[derive(Clone, Debug)]
pub struct PaletteRegion {
    palette: FxHashSet<u32>,
    data: Box<[(u32, bool)]>,
    accounted_for: usize,
}

impl Default for PaletteRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl PaletteRegion {
    pub fn new() -> Self {
        Self {
            palette: FxHashSet::default(),
            data: vec![(0, false); REGION_VOXEL_N].into_boxed_slice(),
            accounted_for: 0,
        }
    }

    /// Stores a sample. The first write to a slot wins; absent samples and
    /// repeated writes are ignored. Returns whether the slot was written.
    pub fn record(&mut self, local: LocalPos, value: u32, is_present: bool) -> bool {
        if !local.is_valid() {
            return false;
        }
        let Some(slot) = self.data.get_mut(local.index()) else {
            return false;
        };
        if !is_present || slot.1 {
            return false;
        }
        *slot = (value, true);
        self.palette.insert(value);
        self.accounted_for += 1;
        true
    }

    /// Number of slots actually written.
    pub fn accounted_for(&self) -> usize {
        self.accounted_for
    }

    pub fn variant_n(&self) -> usize {
        self.palette.len()
    }

    #[cfg(test)]
    pub fn value_at(&self, local: LocalPos) -> u32 {
        self.data[local.index()].0
    }

    #[cfg(test)]
    pub fn is_written(&self, local: LocalPos) -> bool {
        self.data[local.index()].1
    }

    /// Closes the palette over unwritten slots, which read as `0`.
    ///
    /// Returns `false` when nothing was written at all; such a region is
    /// stored as the uniform-zero default and need not be encoded.
    pub fn finalize(&mut self) -> bool {
        if self.accounted_for == 0 {
            return false;
        }
        if self.accounted_for < REGION_VOXEL_N {
            self.palette.insert(0);
            for slot in self.data.iter_mut().filter(|slot| !slot.1) {
                slot.0 = 0;
            }
        }
        true
    }

    /// Finalizes and encodes the region into a staging buffer.
    pub fn encode(mut self) -> Result<EncodedRegion, GvoxError> {
        if !self.finalize() {
            return Ok(EncodedRegion::Uniform(0));
        }

        let variant_n = self.palette.len();
        if variant_n == 1 {
            let value = self.palette.iter().copied().next().unwrap_or(0);
            return Ok(EncodedRegion::Uniform(value));
        }
        let variant_n = variant_n as u32;

        if variant_n > MAX_REGION_COMPRESSED_VARIANT_N {
            let mut blob = vec![0u8; MAX_REGION_ALLOCATION_SIZE];
            for (i, (value, _)) in self.data.iter().enumerate() {
                bits::write_u32(&mut blob, i * 4, *value)?;
            }
            return Ok(EncodedRegion::Blob { variant_n, blob });
        }

        let mut palette: Vec<u32> = self.palette.into_iter().collect();
        palette.sort_unstable();

        let bits_per_variant = ceil_log2(variant_n);
        let mut blob = vec![0u8; calc_block_size(variant_n)];
        let (palette_bytes, packed) = blob.split_at_mut(palette.len() * 4);
        for (i, value) in palette.iter().enumerate() {
            bits::write_u32(palette_bytes, i * 4, *value)?;
        }
        for (i, (value, _)) in self.data.iter().enumerate() {
            let index = palette.binary_search(value).map_err(|_| {
                GvoxError::new(
                    ErrorType::Unknown,
                    format!("voxel value {value:#010x} is missing from its region palette"),
                )
            })?;
            bits::write_packed(packed, i * bits_per_variant as usize, bits_per_variant, index as u32)?;
        }
        Ok(EncodedRegion::Blob { variant_n, blob })
    }
}

/// An encoded region whose blob, if any, has not been placed yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodedRegion {
    Uniform(u32),
    Blob { variant_n: u32, blob: Vec<u8> },
}

impl EncodedRegion {
    pub fn blob_len(&self) -> usize {
        match self {
            Self::Uniform(_) => 0,
            Self::Blob { blob, .. } => blob.len(),
        }
    }

    /// Appends the blob (if any) and returns the header pointing at it.
    pub fn commit(&self, blobs: &BlobAllocator) -> Result<ChannelHeader, GvoxError> {
        match self {
            Self::Uniform(value) => Ok(ChannelHeader::uniform(*value)),
            Self::Blob { variant_n, blob } => Ok(ChannelHeader {
                variant_n: *variant_n,
                blob_offset: blobs.append(blob)?,
            }),
        }
    }
}

/// Checks that the payload a header points at lies inside a blob area of
/// `blob_size` bytes.
pub fn validate_header(header: &ChannelHeader, blob_size: usize) -> Result<(), GvoxError> {
    let len = header.blob_len();
    if len == 0 {
        return Ok(());
    }
    let begin = header.blob_offset as usize;
    match begin.checked_add(len) {
        Some(end) if end <= blob_size => Ok(()),
        _ => Err(GvoxError::new(
            ErrorType::ParseAdapterInvalidInput,
            format!(
                "region payload [{begin}, +{len}) lies outside the {blob_size} byte blob area"
            ),
        )),
    }
}

/// Decodes one voxel straight from the packed representation.
///
/// `blob` is the whole blob area. Returns `None` if the payload is out of
/// bounds or holds an index past the palette.
pub fn decode_voxel(header: &ChannelHeader, blob: &[u8], local: LocalPos) -> Option<u32> {
    if !local.is_valid() {
        return None;
    }
    let base = header.blob_offset as usize;
    let local_index = local.index();
    match header.encoding() {
        RegionEncoding::Uniform => Some(header.blob_offset),
        RegionEncoding::Dense => bits::read_u32(blob, base + local_index * 4),
        RegionEncoding::Compressed { bits_per_variant } => {
            let variant_n = header.variant_n as usize;
            let packed = blob.get(base + variant_n * 4..)?;
            let index = bits::read_packed(packed, local_index * bits_per_variant as usize, bits_per_variant)?
                as usize;
            if index >= variant_n {
                return None;
            }
            bits::read_u32(blob, base + index * 4)
        }
    }
}
