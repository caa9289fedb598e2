//! Sector (de)compression (SPEC_FULL.md §4.2 "compression mask byte", §6 `Codec`).

mod bzip2_codec;
mod lzma_codec;
mod pkware;
mod sparse;
mod zlib;

use crate::error::{CodecError, Result};

/// Compression method mask bits, in the cascading order they appear in the mask byte.
/// A compressed sector is prefixed with this byte; bits are applied MSB-first on
/// compress and peeled off in the same order on decompress (SPEC_FULL.md §4.2).
pub mod mask {
    pub const HUFFMAN: u8 = 0x01;
    pub const ZLIB: u8 = 0x02;
    pub const PKWARE: u8 = 0x08;
    pub const BZIP2: u8 = 0x10;
    pub const SPARSE: u8 = 0x20;
    pub const ADPCM_MONO: u8 = 0x40;
    pub const ADPCM_STEREO: u8 = 0x80;
    /// LZMA replaces the whole mask byte; it is never combined with other bits.
    pub const LZMA: u8 = 0x12;
}

/// A compression/encoding backend. Each method is attempted independently; the
/// sector pipeline is responsible for the mask-byte dispatch, not this trait.
pub trait Codec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

/// Compress a sector, trying every enabled method and combining them under a single
/// mask byte, mirroring StormLib's default "try zlib, then bzip2, then sparse" dance.
/// Returns `(mask_byte, payload)`; the caller decides whether the result is smaller
/// than storing the sector raw.
pub fn compress_sector(data: &[u8], requested_mask: u8) -> Result<(u8, Vec<u8>)> {
    if requested_mask == mask::LZMA {
        let payload = lzma_codec::Lzma.compress(data)?;
        return Ok((mask::LZMA, payload));
    }

    let mut payload = data.to_vec();
    let mut applied = 0u8;

    // Bits are applied high-to-low; decompression below reverses them low-to-high,
    // so that the final mask byte's bit order reflects application order.
    if requested_mask & mask::SPARSE != 0 {
        payload = sparse::Sparse.compress(&payload)?;
        applied |= mask::SPARSE;
    }
    if requested_mask & mask::BZIP2 != 0 {
        payload = bzip2_codec::Bzip2.compress(&payload)?;
        applied |= mask::BZIP2;
    }
    if requested_mask & mask::PKWARE != 0 {
        payload = pkware::Pkware.compress(&payload)?;
        applied |= mask::PKWARE;
    }
    if requested_mask & mask::ZLIB != 0 {
        payload = zlib::Zlib.compress(&payload)?;
        applied |= mask::ZLIB;
    }
    if requested_mask & (mask::HUFFMAN | mask::ADPCM_MONO | mask::ADPCM_STEREO) != 0 {
        return Err(CodecError::Unsupported(requested_mask).into());
    }

    Ok((applied, payload))
}

/// Decompress a sector whose leading byte was `mask_byte`, peeling off each method
/// in the reverse order `compress_sector` applied them (SPEC_FULL.md §4.2).
pub fn decompress_sector(mask_byte: u8, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if mask_byte == mask::LZMA {
        return lzma_codec::Lzma.decompress(data, expected_size);
    }

    let mut payload = data.to_vec();

    if mask_byte & mask::ZLIB != 0 {
        payload = zlib::Zlib.decompress(&payload, expected_size)?;
    }
    if mask_byte & mask::PKWARE != 0 {
        payload = pkware::Pkware.decompress(&payload, expected_size)?;
    }
    if mask_byte & mask::BZIP2 != 0 {
        payload = bzip2_codec::Bzip2.decompress(&payload, expected_size)?;
    }
    if mask_byte & mask::SPARSE != 0 {
        payload = sparse::Sparse.decompress(&payload, expected_size)?;
    }
    if mask_byte & (mask::HUFFMAN | mask::ADPCM_MONO | mask::ADPCM_STEREO) != 0 {
        return Err(CodecError::Unsupported(mask_byte).into());
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_only_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let (applied, payload) = compress_sector(&data, mask::ZLIB).unwrap();
        assert_eq!(applied, mask::ZLIB);

        let restored = decompress_sector(applied, &payload, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn sparse_then_zlib_round_trips() {
        let mut data = vec![0u8; 200];
        data.extend_from_slice(b"non-zero tail");
        let (applied, payload) = compress_sector(&data, mask::SPARSE | mask::ZLIB).unwrap();

        let restored = decompress_sector(applied, &payload, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn huffman_is_reported_unsupported() {
        let err = compress_sector(b"abc", mask::HUFFMAN).unwrap_err();
        assert!(matches!(err, crate::error::Error::Unsupported(_)));
    }
}
