//! BZip2 sector compression.

use std::io::{Read, Write};

use bzip2::write::BzEncoder;
use bzip2::read::BzDecoder;
use bzip2::Compression;

use super::Codec;
use crate::error::{CodecError, Result};

pub struct Bzip2;

impl Codec for Bzip2 {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder
            .write_all(data)
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::CompressFailed(e.to_string()).into())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut decoder = BzDecoder::new(data);
        let mut out = Vec::with_capacity(expected_size);
        decoder
            .read_to_end(&mut out)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let data = b"bzip2 test payload bzip2 test payload bzip2".to_vec();
        let compressed = Bzip2.compress(&data).unwrap();
        let restored = Bzip2.decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }
}
