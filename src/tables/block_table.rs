//! The block table and its high-offset extension (SPEC_FULL.md §4.4).

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Write};

use crate::crypto::{decrypt_block, encrypt_block};
use crate::error::{Result, TableError};
use crate::hash::{hash_string, HashDomain};

bitflags::bitflags! {
    /// On-disk block flags. Kept as raw bits at this boundary; [`StorageMode`]
    /// interprets them for callers away from the wire format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        const IMPLODE        = 0x0000_0100;
        const COMPRESS        = 0x0000_0200;
        const ENCRYPTED       = 0x0001_0000;
        const FIX_KEY         = 0x0002_0000;
        const PATCH_FILE      = 0x0010_0000;
        const SINGLE_UNIT     = 0x0100_0000;
        const DELETE_MARKER   = 0x0200_0000;
        const SECTOR_CRC      = 0x0400_0000;
        const EXISTS          = 0x8000_0000;
    }
}

/// A convenience view over [`BlockFlags`] for code that only cares about storage
/// shape, not the raw bit pattern (SPEC_FULL.md §9 design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageMode {
    pub compressed: bool,
    pub imploded: bool,
    pub encrypted: bool,
    pub fix_key: bool,
    pub single_unit: bool,
    pub sector_crc: bool,
}

impl From<BlockFlags> for StorageMode {
    fn from(flags: BlockFlags) -> Self {
        StorageMode {
            compressed: flags.contains(BlockFlags::COMPRESS),
            imploded: flags.contains(BlockFlags::IMPLODE),
            encrypted: flags.contains(BlockFlags::ENCRYPTED),
            fix_key: flags.contains(BlockFlags::FIX_KEY),
            single_unit: flags.contains(BlockFlags::SINGLE_UNIT),
            sector_crc: flags.contains(BlockFlags::SECTOR_CRC),
        }
    }
}

impl From<StorageMode> for BlockFlags {
    fn from(mode: StorageMode) -> Self {
        let mut flags = BlockFlags::EXISTS;
        flags.set(BlockFlags::COMPRESS, mode.compressed);
        flags.set(BlockFlags::IMPLODE, mode.imploded);
        flags.set(BlockFlags::ENCRYPTED, mode.encrypted);
        flags.set(BlockFlags::FIX_KEY, mode.fix_key);
        flags.set(BlockFlags::SINGLE_UNIT, mode.single_unit);
        flags.set(BlockFlags::SECTOR_CRC, mode.sector_crc);
        flags
    }
}

/// One 16-byte slot of the block table (low 32 bits of the file offset; the high
/// 16 bits, when present, live in the parallel extended table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub offset_lo: u32,
    pub compressed_size: u32,
    pub full_size: u32,
    pub flags: BlockFlags,
}

impl BlockEntry {
    pub const EMPTY: BlockEntry = BlockEntry {
        offset_lo: 0,
        compressed_size: 0,
        full_size: 0,
        flags: BlockFlags::empty(),
    };

    pub fn exists(&self) -> bool {
        self.flags.contains(BlockFlags::EXISTS)
    }
}

#[derive(Debug, Clone)]
pub struct BlockTable {
    entries: Vec<BlockEntry>,
    /// High 16 bits of `offset_lo`, one per entry, present only for v2 archives
    /// with files beyond the 4 GiB boundary. Empty when unused.
    ext: Vec<u16>,
    max_entries: u32,
}

impl BlockTable {
    /// Create an empty table that may grow up to `max_entries` (SPEC_FULL.md §4.4).
    pub fn new(initial_entries: u32, max_entries: u32) -> Self {
        BlockTable {
            entries: vec![BlockEntry::EMPTY; initial_entries as usize],
            ext: Vec::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    pub fn get(&self, index: u32) -> Option<&BlockEntry> {
        self.entries.get(index as usize)
    }

    /// Full 64-bit file offset for `index`, combining the low word with the
    /// extended high word if the table carries one.
    pub fn offset(&self, index: u32) -> u64 {
        let lo = self.entries[index as usize].offset_lo as u64;
        let hi = self.ext.get(index as usize).copied().unwrap_or(0) as u64;
        (hi << 32) | lo
    }

    /// Reuse the first slot whose `EXISTS` bit is clear, else append a new slot if
    /// `max_entries` allows it (SPEC_FULL.md §4.4 "Growth").
    pub fn allocate(&mut self) -> Result<u32> {
        if let Some(index) = self
            .entries
            .iter()
            .position(|entry| !entry.exists())
        {
            return Ok(index as u32);
        }

        if self.len() >= self.max_entries {
            return Err(TableError::BlockTableFull.into());
        }

        self.entries.push(BlockEntry::EMPTY);
        if !self.ext.is_empty() {
            self.ext.push(0);
        }
        Ok(self.len() - 1)
    }

    pub fn set(&mut self, index: u32, entry: BlockEntry, offset: u64) {
        self.entries[index as usize] = BlockEntry {
            offset_lo: offset as u32,
            ..entry
        };
        let hi = (offset >> 32) as u16;
        if hi != 0 {
            if self.ext.len() <= index as usize {
                self.ext.resize(self.entries.len(), 0);
            }
            self.ext[index as usize] = hi;
        } else if let Some(slot) = self.ext.get_mut(index as usize) {
            *slot = 0;
        }
    }

    /// Clear the `EXISTS` bit and zero the sizes, turning the slot back into free
    /// space for [`allocate`] (SPEC_FULL.md §4.7 "Remove").
    pub fn remove(&mut self, index: u32) {
        let entry = &mut self.entries[index as usize];
        entry.flags = BlockFlags::empty();
        entry.compressed_size = 0;
        entry.full_size = 0;
    }

    pub fn read_from<R: Read>(reader: &mut R, count: u32) -> Result<Self> {
        let mut raw = vec![0u32; count as usize * 4];
        for slot in raw.iter_mut() {
            *slot = reader.read_u32::<LE>()?;
        }
        let key = hash_string("(block table)", HashDomain::FileKey);
        decrypt_block(&mut raw, key);

        let mut entries = Vec::with_capacity(count as usize);
        for chunk in raw.chunks_exact(4) {
            entries.push(BlockEntry {
                offset_lo: chunk[0],
                compressed_size: chunk[1],
                full_size: chunk[2],
                flags: BlockFlags::from_bits_truncate(chunk[3]),
            });
        }
        Ok(BlockTable {
            entries,
            ext: Vec::new(),
            max_entries: count,
        })
    }

    pub fn read_ext_from<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        let mut ext = Vec::with_capacity(self.entries.len());
        for _ in 0..self.entries.len() {
            ext.push(reader.read_u16::<LE>()?);
        }
        self.ext = ext;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut raw = Vec::with_capacity(self.entries.len() * 4);
        for entry in &self.entries {
            raw.push(entry.offset_lo);
            raw.push(entry.compressed_size);
            raw.push(entry.full_size);
            raw.push(entry.flags.bits());
        }

        let key = hash_string("(block table)", HashDomain::FileKey);
        encrypt_block(&mut raw, key);

        for word in raw {
            writer.write_u32::<LE>(word)?;
        }
        Ok(())
    }

    pub fn write_ext_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for &hi in &self.ext {
            writer.write_u16::<LE>(hi)?;
        }
        Ok(())
    }

    /// Whether any entry needs the extended (high-offset) table at all.
    pub fn needs_ext(&self) -> bool {
        self.ext.iter().any(|&hi| hi != 0)
    }
}
