//! zlib sector compression.

use std::io::{Read, Write};

use flate2::write::ZlibEncoder;
use flate2::read::ZlibDecoder;
use flate2::Compression;

use super::Codec;
use crate::error::{CodecError, Result};

pub struct Zlib;

impl Codec for Zlib {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder
            .write_all(data)
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::CompressFailed(e.to_string()).into())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
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
        let data = b"repeat repeat repeat repeat repeat".to_vec();
        let compressed = Zlib.compress(&data).unwrap();
        let restored = Zlib.decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }
}
