//! Unified error type for the archive engine.

use std::path::PathBuf;

/// Errors a codec implementation can report.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("compression method 0x{0:02x} is not implemented")]
    Unsupported(u8),
    #[error("compression failed: {0}")]
    CompressFailed(String),
    #[error("decompression failed: {0}")]
    DecompressFailed(String),
    #[error("decompressed size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Errors raised while decoding the header or the hash/block tables.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("hash table size {0} is not a power of two in [16, 262144]")]
    InvalidCapacity(u32),
    #[error("block index {0} out of bounds")]
    BlockIndexOutOfBounds(u32),
    #[error("block table is full (block_table_max reached)")]
    BlockTableFull,
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not an MPQ archive")]
    NotAnArchive,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("archive is corrupt: {0}")]
    Corrupt(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("encryption key for {0} could not be recovered")]
    UnknownKey(String),

    #[error("sector checksum mismatch at sector {sector} of {file}")]
    ChecksumMismatch { file: String, sector: u32 },

    #[error("no space left in the archive")]
    NoSpace,

    #[error("archive was opened read-only")]
    ReadOnly,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported compression method: {0}")]
    Unsupported(#[from] CodecError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("could not open archive at {path}: {source}")]
    ArchiveOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
