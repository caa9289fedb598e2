//! Locating, parsing, and laying out the MPQ header (SPEC_FULL.md §4.5).

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

pub const MPQ_HEADER_SIGNATURE: u32 = 0x1A51_504D; // "MPQ\x1A"
pub const MPQ_USERDATA_SIGNATURE: u32 = 0x1B51_504D; // "MPQ\x1B"
const RIFF_SIGNATURE: u32 = 0x4646_4952; // "RIFF"

const HEADER_ALIGNMENT: u64 = 0x200;
const V1_HEADER_SIZE: u32 = 0x20;
const V2_HEADER_SIZE: u32 = 0x2C;

/// Archive format version. Only v1/v2 are modeled (SPEC_FULL.md §1: no HET/BET).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V1,
    V2,
}

impl FormatVersion {
    pub fn header_size(self) -> u32 {
        match self {
            FormatVersion::V1 => V1_HEADER_SIZE,
            FormatVersion::V2 => V2_HEADER_SIZE,
        }
    }

    fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(FormatVersion::V1),
            1 => Ok(FormatVersion::V2),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }
}

/// The optional `MPQ\x1B` redirection header some archives (e.g. SC2 maps) are wrapped in.
#[derive(Debug, Clone)]
pub struct UserDataHeader {
    pub user_data_size: u32,
    pub header_offset: u32,
    pub user_data_header_size: u32,
}

/// The MPQ header itself, v1 fields always present, v2 fields `Option`.
#[derive(Debug, Clone)]
pub struct MpqHeader {
    pub header_size: u32,
    pub archive_size: u32,
    pub format_version: FormatVersion,
    pub sector_size_log2: u16,
    pub hash_table_pos_lo: u32,
    pub block_table_pos_lo: u32,
    pub hash_table_entries: u32,
    pub block_table_entries: u32,
    pub ext_block_table_pos: u64,
    pub hash_table_pos_hi: u16,
    pub block_table_pos_hi: u16,
    /// Set when `header_size` didn't match the canonical size for `format_version` and
    /// had to be silently corrected (SPEC_FULL.md §4.5 "Protector tolerance").
    pub protected: bool,
}

impl MpqHeader {
    pub fn sector_size(&self) -> u32 {
        512u32 << self.sector_size_log2
    }

    pub fn hash_table_offset(&self) -> u64 {
        ((self.hash_table_pos_hi as u64) << 32) | self.hash_table_pos_lo as u64
    }

    pub fn block_table_offset(&self) -> u64 {
        ((self.block_table_pos_hi as u64) << 32) | self.block_table_pos_lo as u64
    }

    /// Read a header already positioned at its signature. `force_v1` discards any
    /// v2 fields even if `format_version` claims otherwise.
    pub fn read<R: Read + Seek>(reader: &mut R, force_v1: bool) -> Result<Self> {
        let signature = reader.read_u32::<LE>()?;
        if signature != MPQ_HEADER_SIGNATURE {
            return Err(Error::NotAnArchive);
        }

        let mut header_size = reader.read_u32::<LE>()?;
        let archive_size = reader.read_u32::<LE>()?;
        let format_version_raw = reader.read_u16::<LE>()?;
        let sector_size_log2 = reader.read_u16::<LE>()?;
        let hash_table_pos_lo = reader.read_u32::<LE>()?;
        let block_table_pos_lo = reader.read_u32::<LE>()?;
        let hash_table_entries = reader.read_u32::<LE>()?;
        let block_table_entries = reader.read_u32::<LE>()?;

        let format_version = if force_v1 {
            FormatVersion::V1
        } else {
            FormatVersion::from_raw(format_version_raw)?
        };

        let canonical_size = format_version.header_size();
        let mut protected = false;
        if header_size != canonical_size {
            log::warn!(
                "header_size 0x{:x} does not match canonical size 0x{:x}; treating archive as protected",
                header_size,
                canonical_size
            );
            header_size = canonical_size;
            protected = true;
        }

        let (ext_block_table_pos, hash_table_pos_hi, block_table_pos_hi) =
            if format_version == FormatVersion::V2 && !force_v1 {
                let ext = reader.read_u64::<LE>()?;
                let hash_hi = reader.read_u16::<LE>()?;
                let block_hi = reader.read_u16::<LE>()?;
                (ext, hash_hi, block_hi)
            } else {
                (0, 0, 0)
            };

        Ok(MpqHeader {
            header_size,
            archive_size,
            format_version,
            sector_size_log2,
            hash_table_pos_lo,
            block_table_pos_lo,
            hash_table_entries,
            block_table_entries,
            ext_block_table_pos,
            hash_table_pos_hi,
            block_table_pos_hi,
            protected,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(MPQ_HEADER_SIGNATURE)?;
        writer.write_u32::<LE>(self.header_size)?;
        writer.write_u32::<LE>(self.archive_size)?;
        writer.write_u16::<LE>(match self.format_version {
            FormatVersion::V1 => 0,
            FormatVersion::V2 => 1,
        })?;
        writer.write_u16::<LE>(self.sector_size_log2)?;
        writer.write_u32::<LE>(self.hash_table_pos_lo)?;
        writer.write_u32::<LE>(self.block_table_pos_lo)?;
        writer.write_u32::<LE>(self.hash_table_entries)?;
        writer.write_u32::<LE>(self.block_table_entries)?;

        if self.format_version == FormatVersion::V2 {
            writer.write_u64::<LE>(self.ext_block_table_pos)?;
            writer.write_u16::<LE>(self.hash_table_pos_hi)?;
            writer.write_u16::<LE>(self.block_table_pos_hi)?;
        }

        Ok(())
    }
}

/// Search `reader` for an MPQ header at 512-byte-aligned offsets, following a
/// `MPQ\x1B` user-data redirection header if one is found first (SPEC_FULL.md §4.5).
///
/// Returns the absolute offset of the MPQ header (`mpq_pos`), the user-data header if
/// one preceded it, and the parsed header.
pub fn find_header<R: Read + Seek>(
    reader: &mut R,
    force_v1: bool,
) -> Result<(u64, Option<UserDataHeader>, MpqHeader)> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    let mut offset = 0u64;
    let mut user_data = None;

    loop {
        if offset >= file_size {
            return Err(Error::NotAnArchive);
        }

        reader.seek(SeekFrom::Start(offset))?;
        let signature = match reader.read_u32::<LE>() {
            Ok(sig) => sig,
            Err(_) => {
                offset += HEADER_ALIGNMENT;
                continue;
            }
        };

        match signature {
            RIFF_SIGNATURE => return Err(Error::NotAnArchive),
            MPQ_HEADER_SIGNATURE => {
                reader.seek(SeekFrom::Start(offset))?;
                let header = MpqHeader::read(reader, force_v1)?;
                return Ok((offset, user_data, header));
            }
            MPQ_USERDATA_SIGNATURE => {
                let user_data_size = reader.read_u32::<LE>()?;
                let header_offset = reader.read_u32::<LE>()?;
                let user_data_header_size = reader.read_u32::<LE>()?;
                user_data = Some(UserDataHeader {
                    user_data_size,
                    header_offset,
                    user_data_header_size,
                });
                offset += header_offset as u64;
                continue;
            }
            _ => {}
        }

        offset += HEADER_ALIGNMENT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header(version: FormatVersion) -> MpqHeader {
        MpqHeader {
            header_size: version.header_size(),
            archive_size: 0x1000,
            format_version: version,
            sector_size_log2: 3,
            hash_table_pos_lo: 0x200,
            block_table_pos_lo: 0x400,
            hash_table_entries: 16,
            block_table_entries: 4,
            ext_block_table_pos: if version == FormatVersion::V2 { 0x9000_0000 } else { 0 },
            hash_table_pos_hi: 0,
            block_table_pos_hi: 0,
            protected: false,
        }
    }

    #[test]
    fn v1_round_trips() {
        let header = sample_header(FormatVersion::V1);
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        buf.set_position(0);

        let read = MpqHeader::read(&mut buf, false).unwrap();
        assert_eq!(read.hash_table_pos_lo, header.hash_table_pos_lo);
        assert_eq!(read.block_table_entries, header.block_table_entries);
        assert!(!read.protected);
    }

    #[test]
    fn v2_round_trips_with_extended_fields() {
        let header = sample_header(FormatVersion::V2);
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        buf.set_position(0);

        let read = MpqHeader::read(&mut buf, false).unwrap();
        assert_eq!(read.ext_block_table_pos, header.ext_block_table_pos);
    }

    #[test]
    fn protector_header_size_is_silently_corrected() {
        let mut header = sample_header(FormatVersion::V1);
        header.header_size = 0x0000_FFFF;

        let mut buf = Cursor::new(Vec::new());
        buf.write_u32::<LE>(MPQ_HEADER_SIGNATURE).unwrap();
        buf.write_u32::<LE>(header.header_size).unwrap();
        buf.write_u32::<LE>(header.archive_size).unwrap();
        buf.write_u16::<LE>(0).unwrap();
        buf.write_u16::<LE>(header.sector_size_log2).unwrap();
        buf.write_u32::<LE>(header.hash_table_pos_lo).unwrap();
        buf.write_u32::<LE>(header.block_table_pos_lo).unwrap();
        buf.write_u32::<LE>(header.hash_table_entries).unwrap();
        buf.write_u32::<LE>(header.block_table_entries).unwrap();
        buf.set_position(0);

        let read = MpqHeader::read(&mut buf, false).unwrap();
        assert!(read.protected);
        assert_eq!(read.header_size, V1_HEADER_SIZE);
    }

    #[test]
    fn finds_header_after_user_data_redirect() {
        let mut data = vec![0u8; 0x400];
        data[0..4].copy_from_slice(&MPQ_USERDATA_SIGNATURE.to_le_bytes());
        data[4..8].copy_from_slice(&0x200u32.to_le_bytes()); // user_data_size
        data[8..12].copy_from_slice(&0x200u32.to_le_bytes()); // header_offset
        data[12..16].copy_from_slice(&0x20u32.to_le_bytes()); // user_data_header_size

        let header = sample_header(FormatVersion::V1);
        let mut cursor = Cursor::new(&mut data[0x200..]);
        header.write(&mut cursor).unwrap();

        let mut reader = Cursor::new(data);
        let (pos, user_data, parsed) = find_header(&mut reader, false).unwrap();
        assert_eq!(pos, 0x200);
        assert!(user_data.is_some());
        assert_eq!(parsed.hash_table_pos_lo, header.hash_table_pos_lo);
    }

    #[test]
    fn rejects_riff_disguised_as_mpq() {
        let mut data = vec![0u8; 512];
        data[0..4].copy_from_slice(&RIFF_SIGNATURE.to_le_bytes());
        let mut reader = Cursor::new(data);
        assert!(matches!(find_header(&mut reader, false), Err(Error::NotAnArchive)));
    }
}
