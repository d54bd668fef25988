//! Bit-width arithmetic shared by the palette codecs.

use crate::{ErrorType, GvoxError};

/// Edge length of a palette region, in voxels.
pub const REGION_SIZE: u32 = 8;
/// Number of voxels in one region.
pub const REGION_VOXEL_N: usize = (REGION_SIZE * REGION_SIZE * REGION_SIZE) as usize;
/// Size in bytes of a region stored densely, one `u32` per voxel.
pub const MAX_REGION_ALLOCATION_SIZE: usize = REGION_VOXEL_N * 4;
/// Largest variant count that is still stored as palette + packed indices.
pub const MAX_REGION_COMPRESSED_VARIANT_N: u32 = max_compressed_variant_n();

const _: () = assert!(calc_block_size(MAX_REGION_COMPRESSED_VARIANT_N) <= MAX_REGION_ALLOCATION_SIZE);
const _: () = assert!(calc_block_size(MAX_REGION_COMPRESSED_VARIANT_N + 1) > MAX_REGION_ALLOCATION_SIZE);

/// Number of bits needed to tell `x` distinct values apart, i.e. `⌈log2(x)⌉`.
///
/// `x` must be at least 1; `ceil_log2(1) == 0`.
pub const fn ceil_log2(x: u32) -> u32 {
    const T: [u32; 5] = [0xFFFF_0000, 0x0000_FF00, 0x0000_00F0, 0x0000_000C, 0x0000_0002];

    let mut x = x;
    let mut y = if x & x.wrapping_sub(1) == 0 { 0 } else { 1 };
    let mut j = 16;
    let mut i = 0;
    while i < T.len() {
        let k = if x & T[i] == 0 { 0 } else { j };
        y += k;
        x >>= k;
        j >>= 1;
        i += 1;
    }
    y
}

/// Right-aligned mask with `bits` ones.
pub const fn get_mask(bits: u32) -> u32 {
    if bits >= u32::BITS {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Bytes taken by `voxel_n` packed indices of `bits_per_variant` bits each.
///
/// Rounded up to whole 32-bit words, plus one trailing word so a decoder can
/// always read a full window past the last index.
pub const fn calc_packed_size(bits_per_variant: u32, voxel_n: usize) -> usize {
    let words = (bits_per_variant as usize * voxel_n + 31) / 32;
    (words + 1) * 4
}

/// [`calc_packed_size`] for untrusted counts; `None` on overflow.
pub fn checked_packed_size(bits_per_variant: u32, voxel_n: usize) -> Option<usize> {
    let words = (bits_per_variant as usize).checked_mul(voxel_n)?.checked_add(31)? / 32;
    words.checked_add(1)?.checked_mul(4)
}

/// Bytes taken by the packed index array of one region.
pub const fn calc_palette_region_size(bits_per_variant: u32) -> usize {
    calc_packed_size(bits_per_variant, REGION_VOXEL_N)
}

/// Total blob bytes of a compressed region: sorted palette followed by the
/// packed index array.
pub const fn calc_block_size(variant_n: u32) -> usize {
    variant_n as usize * 4 + calc_palette_region_size(ceil_log2(variant_n))
}

const fn max_compressed_variant_n() -> u32 {
    let mut n = 1;
    while calc_block_size(n + 1) <= MAX_REGION_ALLOCATION_SIZE {
        n += 1;
    }
    n
}

fn window_len(bit_index: usize, bits: u32) -> usize {
    (bit_index % 8 + bits as usize + 7) / 8
}

/// Writes `value` as a `bits`-wide field at `bit_index` (LSB-first).
///
/// Only the bytes covered by the field are touched. Fails instead of writing
/// past the end of `buf`.
pub fn write_packed(buf: &mut [u8], bit_index: usize, bits: u32, value: u32) -> Result<(), GvoxError> {
    if bits == 0 {
        return Ok(());
    }
    let byte = bit_index / 8;
    let len = window_len(bit_index, bits);
    let Some(window) = buf.get_mut(byte..byte + len) else {
        return Err(GvoxError::new(
            ErrorType::BoundsViolation,
            format!(
                "packed write of {bits} bits at bit {bit_index} overruns a {} byte slice",
                buf.len()
            ),
        ));
    };

    let mut raw = [0u8; 8];
    raw[..len].copy_from_slice(window);
    let shift = bit_index % 8;
    let mask = u64::from(get_mask(bits)) << shift;
    let word = (u64::from_le_bytes(raw) & !mask) | ((u64::from(value) << shift) & mask);
    window.copy_from_slice(&word.to_le_bytes()[..len]);
    Ok(())
}

/// Reads a `bits`-wide field at `bit_index`. Returns `None` past the end of `buf`.
pub fn read_packed(buf: &[u8], bit_index: usize, bits: u32) -> Option<u32> {
    if bits == 0 {
        return Some(0);
    }
    let byte = bit_index / 8;
    let len = window_len(bit_index, bits);
    let window = buf.get(byte..byte + len)?;

    let mut raw = [0u8; 8];
    raw[..len].copy_from_slice(window);
    Some((u64::from_le_bytes(raw) >> (bit_index % 8)) as u32 & get_mask(bits))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), GvoxError> {
    let len = buf.len();
    let Some(bytes) = buf.get_mut(offset..offset + 4) else {
        return Err(GvoxError::new(
            ErrorType::BoundsViolation,
            format!("u32 write at byte {offset} overruns a {len} byte slice"),
        ));
    };
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}
