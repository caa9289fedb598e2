//! Sparse/RLE compression: zero runs encoded as a length byte, literal runs
//! prefixed with their length, `0xFF` as the terminator.

use super::Codec;
use crate::error::{CodecError, Result};

pub struct Sparse;

impl Codec for Sparse {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let zero_start = pos;
            while pos < data.len() && data[pos] == 0 {
                pos += 1;
            }

            let mut zero_count = pos - zero_start;
            while zero_count > 0 {
                let chunk = zero_count.min(0x7F);
                output.push(0x80 | (chunk as u8));
                zero_count -= chunk;
            }

            let data_start = pos;
            while pos < data.len() && data[pos] != 0 && (pos - data_start) < 0x7F {
                pos += 1;
            }

            let data_count = pos - data_start;
            if data_count > 0 {
                output.push(data_count as u8);
                output.extend_from_slice(&data[data_start..pos]);
            }
        }

        output.push(0xFF);
        Ok(output)
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(expected_size);
        let mut pos = 0;

        while pos < data.len() && output.len() < expected_size {
            let control = data[pos];
            pos += 1;

            if control == 0xFF {
                break;
            }

            if control & 0x80 != 0 {
                let count = (control & 0x7F) as usize;
                output.resize(output.len() + count, 0);
            } else {
                let count = control as usize;
                if pos + count > data.len() {
                    return Err(CodecError::DecompressFailed(
                        "sparse stream ended mid-run".into(),
                    )
                    .into());
                }
                output.extend_from_slice(&data[pos..pos + count]);
                pos += count;
            }
        }

        if output.len() < expected_size {
            output.resize(expected_size, 0);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_runs() {
        let original = b"Hello\0\0\0\0\0World\0\0\0!!!".to_vec();
        let compressed = Sparse.compress(&original).unwrap();
        let restored = Sparse.decompress(&compressed, original.len()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn all_zeros_compress_well() {
        let original = vec![0u8; 500];
        let compressed = Sparse.compress(&original).unwrap();
        assert!(compressed.len() < original.len());

        let restored = Sparse.decompress(&compressed, original.len()).unwrap();
        assert_eq!(restored, original);
    }
}
