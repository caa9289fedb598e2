//! # mpq-engine
//!
//! The core engine of an MPQ archive library: table cryptography, the
//! open-addressed hash table and block table, the v1/v2 header layout, the
//! per-file sector pipeline, and the two-phase write protocol.
//!
//! ## Example
//!
//! ```no_run
//! use mpq_engine::{ArchiveSession, CreateOptions, StorageMode};
//! use mpq_engine::stream::FileStream;
//!
//! # fn main() -> mpq_engine::Result<()> {
//! let file = std::fs::File::create("example.mpq")?;
//! let mut session = ArchiveSession::create(FileStream::new(file), CreateOptions::default())?;
//!
//! let mode = StorageMode {
//!     compressed: true,
//!     imploded: false,
//!     encrypted: false,
//!     fix_key: false,
//!     single_unit: false,
//!     sector_crc: false,
//! };
//! session.add_file("readme.txt", b"hello archive", mode, mpq_engine::compression::mask::ZLIB, false)?;
//! session.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod compression;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod hashes;
pub mod header;
pub mod pipeline;
pub mod special_files;
pub mod stream;
pub mod tables;
pub mod writer;

pub use archive::{ArchiveSession, CreateOptions, FileHandle, OpenOptions};
pub use error::{Error, Result};
pub use header::FormatVersion;
pub use tables::{BlockEntry, BlockFlags, HashEntry, LookupPolicy, StorageMode};

/// The default and only sector size this implementation observes in practice:
/// `512 << 3` bytes (SPEC_FULL.md §3).
pub const DEFAULT_SECTOR_SIZE_LOG2: u16 = 3;

/// `true` iff `n` is a power of two in `[16, 262_144]`, the legal hash-table
/// capacity range (SPEC_FULL.md §3 invariant 1).
pub fn is_valid_hash_capacity(n: u32) -> bool {
    n.is_power_of_two() && (16..=262_144).contains(&n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_capacity_bounds() {
        assert!(is_valid_hash_capacity(16));
        assert!(is_valid_hash_capacity(262_144));
        assert!(!is_valid_hash_capacity(15));
        assert!(!is_valid_hash_capacity(300_000));
        assert!(!is_valid_hash_capacity(17));
    }
}
