//! Append-only storage for variable-length region payloads.
//!
//! Offsets are relative to the start of the blob area, so they stay valid
//! when the backing buffer is reallocated.

use parking_lot::Mutex;

use crate::{ErrorType, GvoxError};

/// Fraction of the raw volume size reserved up front, in percent.
const RESERVE_PERCENT: u64 = 2;

#[derive(Debug, Default)]
pub struct BlobAllocator {
    buffer: Mutex<Vec<u8>>,
}

impl BlobAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves roughly 2% of a raw `voxel_n * channel_n * 4` byte volume.
    pub fn with_estimate(voxel_n: u64, channel_n: usize) -> Self {
        let raw = voxel_n.saturating_mul(channel_n as u64).saturating_mul(4);
        let estimate = usize::try_from(raw / 100 * RESERVE_PERCENT).unwrap_or(0);
        let mut buffer = Vec::new();
        if let Err(e) = buffer.try_reserve(estimate) {
            log::debug!("blob area starts unreserved, {estimate} bytes unavailable: {e}");
        }
        Self {
            buffer: Mutex::new(buffer),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    fn grow(buffer: &mut Vec<u8>, size: usize) -> Result<u32, GvoxError> {
        let offset = buffer.len();
        let end = offset.checked_add(size).filter(|end| u32::try_from(*end).is_ok());
        if end.is_none() {
            return Err(GvoxError::new(
                ErrorType::Unknown,
                format!("blob area cannot grow past 4 GiB ({offset} + {size} bytes)"),
            ));
        }
        buffer.try_reserve(size).map_err(|e| {
            GvoxError::new(
                ErrorType::Unknown,
                format!("failed to grow blob area by {size} bytes: {e}"),
            )
        })?;
        buffer.resize(offset + size, 0);
        Ok(offset as u32)
    }

    /// Grows the area by `size` zeroed bytes and returns their offset.
    #[cfg(test)]
    pub fn allocate(&self, size: usize) -> Result<u32, GvoxError> {
        Self::grow(&mut self.buffer.lock(), size)
    }

    /// Copies `data` into a previously allocated slice.
    #[cfg(test)]
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<(), GvoxError> {
        let mut buffer = self.buffer.lock();
        let begin = offset as usize;
        let len = buffer.len();
        let Some(slice) = buffer.get_mut(begin..begin + data.len()) else {
            return Err(GvoxError::new(
                ErrorType::BoundsViolation,
                format!(
                    "blob write of {} bytes at {begin} overruns the {len} byte blob area",
                    data.len()
                ),
            ));
        };
        slice.copy_from_slice(data);
        Ok(())
    }

    /// Allocates a slice for a finished staging buffer and copies it in,
    /// under a single short lock.
    pub fn append(&self, data: &[u8]) -> Result<u32, GvoxError> {
        let mut buffer = self.buffer.lock();
        let offset = Self::grow(&mut buffer, data.len())?;
        let begin = offset as usize;
        buffer[begin..begin + data.len()].copy_from_slice(data);
        Ok(offset)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.into_inner()
    }
}
