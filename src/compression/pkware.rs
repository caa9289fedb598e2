//! PKWARE Data Compression Library (DCL) "implode"/"explode", via the `implode` crate.

use super::Codec;
use crate::error::{CodecError, Result};

pub struct Pkware;

impl Codec for Pkware {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        implode::implode(data).map_err(|e| CodecError::CompressFailed(e.to_string()).into())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let out =
            implode::explode(data).map_err(|e| CodecError::DecompressFailed(e.to_string()))?;

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
        let data = b"pkware implode payload pkware implode payload".to_vec();
        let compressed = Pkware.compress(&data).unwrap();
        let restored = Pkware.decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }
}
