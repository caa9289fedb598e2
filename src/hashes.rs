//! Auxiliary digests used for sector CRCs and whole-file verification (SPEC_FULL.md §6).

use md5::{Digest, Md5};

/// CRC-32 (IEEE 802.3), as used for per-sector checksums when `SECTOR_CRC` is set.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Adler-32, as used by some archive tools for the `(attributes)` per-sector table.
pub fn adler32(data: &[u8]) -> u32 {
    adler32::adler32(data).expect("adler32 over an in-memory slice cannot fail")
}

/// Whole-file MD5, as stored in `(attributes)` and used for key recovery sanity checks.
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn adler32_matches_known_vector() {
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn md5_matches_known_vector() {
        let digest = md5(b"");
        assert_eq!(
            digest,
            [
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8,
                0x42, 0x7e
            ]
        );
    }
}
