//! Per-(region, channel) headers locating each region's payload.

use crate::bits::{self, calc_block_size, MAX_REGION_ALLOCATION_SIZE, MAX_REGION_COMPRESSED_VARIANT_N};
use crate::{ErrorType, GvoxError};

/// How a region's payload is stored, derived from its variant count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionEncoding {
    /// `blob_offset` is the voxel value itself.
    Uniform,
    /// Sorted palette followed by packed indices.
    Compressed { bits_per_variant: u32 },
    /// One raw `u32` per voxel.
    Dense,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelHeader {
    pub variant_n: u32,
    pub blob_offset: u32,
}

impl ChannelHeader {
    pub const ENCODED_SIZE: usize = 8;

    pub const fn uniform(value: u32) -> Self {
        Self {
            variant_n: 1,
            blob_offset: value,
        }
    }

    pub fn encoding(&self) -> RegionEncoding {
        if self.variant_n <= 1 {
            RegionEncoding::Uniform
        } else if self.variant_n <= MAX_REGION_COMPRESSED_VARIANT_N {
            RegionEncoding::Compressed {
                bits_per_variant: bits::ceil_log2(self.variant_n),
            }
        } else {
            RegionEncoding::Dense
        }
    }

    /// Bytes this header owns in the blob area.
    pub fn blob_len(&self) -> usize {
        match self.encoding() {
            RegionEncoding::Uniform => 0,
            RegionEncoding::Compressed { .. } => calc_block_size(self.variant_n),
            RegionEncoding::Dense => MAX_REGION_ALLOCATION_SIZE,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[..4].copy_from_slice(&self.variant_n.to_le_bytes());
        out[4..].copy_from_slice(&self.blob_offset.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            variant_n: bits::read_u32(bytes, 0)?,
            blob_offset: bits::read_u32(bytes, 4)?,
        })
    }
}

/// Fixed-size header table, region-major: entry `region_index * channel_n + channel_index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelHeaderTable {
    region_n: usize,
    channel_n: usize,
    headers: Vec<ChannelHeader>,
}

impl ChannelHeaderTable {
    /// A table with every entry set to the uniform-zero default.
    pub fn new(region_n: usize, channel_n: usize) -> Self {
        Self {
            region_n,
            channel_n,
            headers: vec![ChannelHeader::uniform(0); region_n * channel_n],
        }
    }

    pub fn region_n(&self) -> usize {
        self.region_n
    }

    pub fn channel_n(&self) -> usize {
        self.channel_n
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.headers.len() * ChannelHeader::ENCODED_SIZE
    }

    fn slot(&self, region_index: usize, channel_index: usize) -> Result<usize, GvoxError> {
        if region_index < self.region_n && channel_index < self.channel_n {
            Ok(region_index * self.channel_n + channel_index)
        } else {
            Err(GvoxError::new(
                ErrorType::BoundsViolation,
                format!(
                    "header ({region_index}, {channel_index}) is outside a {}x{} table",
                    self.region_n, self.channel_n
                ),
            ))
        }
    }

    pub fn get(&self, region_index: usize, channel_index: usize) -> Option<&ChannelHeader> {
        self.headers.get(self.slot(region_index, channel_index).ok()?)
    }

    pub fn set(
        &mut self,
        region_index: usize,
        channel_index: usize,
        header: ChannelHeader,
    ) -> Result<(), GvoxError> {
        let slot = self.slot(region_index, channel_index)?;
        self.headers[slot] = header;
        Ok(())
    }

    /// Headers of one region, one per channel.
    #[cfg(test)]
    pub fn region_headers(&self, region_index: usize) -> &[ChannelHeader] {
        let begin = (region_index * self.channel_n).min(self.headers.len());
        let end = (begin + self.channel_n).min(self.headers.len());
        &self.headers[begin..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelHeader> {
        self.headers.iter()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for header in &self.headers {
            out.extend_from_slice(&header.to_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], region_n: usize, channel_n: usize) -> Result<Self, GvoxError> {
        let n = region_n * channel_n;
        if bytes.len() < n * ChannelHeader::ENCODED_SIZE {
            return Err(GvoxError::new(
                ErrorType::ParseAdapterInvalidInput,
                format!(
                    "channel header table truncated: {} of {} bytes",
                    bytes.len(),
                    n * ChannelHeader::ENCODED_SIZE
                ),
            ));
        }
        let headers = bytes
            .chunks_exact(ChannelHeader::ENCODED_SIZE)
            .take(n)
            .filter_map(ChannelHeader::from_bytes)
            .collect();
        Ok(Self {
            region_n,
            channel_n,
            headers,
        })
    }
}
