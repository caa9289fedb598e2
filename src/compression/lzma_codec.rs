//! LZMA sector compression. Unlike the other methods, LZMA occupies the entire
//! mask byte (0x12) rather than combining with other bits (SPEC_FULL.md §4.2).

use super::Codec;
use crate::error::{CodecError, Result};

pub struct Lzma;

impl Codec for Lzma {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut &data[..], &mut out)
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_size);
        lzma_rs::lzma_decompress(&mut &data[..], &mut out)
            .map_err(|e| CodecError::DecompressFailed(e.to_string()))?;

        if out.len() != expected_size {
            return Err(CodecError::SizeMismatch {
                expected: expected_size,
                actual: out.len(),
            }
            .into());
        }
        Ok(out)
    }
}
