//! The free-space allocator, remove, and flush logic (SPEC_FULL.md §4.7 ArchiveWriter).

use std::io::{Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::header::{FormatVersion, MpqHeader};
use crate::stream::Stream;
use crate::tables::hash_table::LookupPolicy;
use crate::tables::{BlockTable, HashTable};

/// Internal names a caller cannot remove through the public path (SPEC_FULL.md §4.7).
pub const INTERNAL_NAMES: [&str; 3] = ["(listfile)", "(attributes)", "(signature)"];

/// Next free raw offset for a new file: the high-water mark of every existing
/// block's extent, or `header_size` if the archive is empty (SPEC_FULL.md §4.7).
pub fn next_free_offset(block_table: &BlockTable, header_size: u32) -> u64 {
    let mut max_end = header_size as u64;
    for (index, entry) in block_table.entries().iter().enumerate() {
        if entry.exists() {
            let end = block_table.offset(index as u32) + entry.compressed_size as u64;
            max_end = max_end.max(end);
        }
    }
    max_end
}

/// Remove `name` (SPEC_FULL.md §4.7 "Remove"). Rejects the three reserved internal
/// names. Clears the block's flags/sizes and tombstones the hash entry.
pub fn remove(hash_table: &mut HashTable, block_table: &mut BlockTable, name: &str) -> Result<()> {
    if INTERNAL_NAMES.contains(&name) {
        return Err(Error::AccessDenied(name.to_string()));
    }

    let (hash_index, entry) = hash_table
        .find(name, LookupPolicy::Any, block_table.len())
        .ok_or_else(|| Error::NotFound(name.to_string()))?;

    block_table.remove(entry.block_index);
    hash_table.delete_at(hash_index);
    Ok(())
}

/// Recompute table positions and write header + hash table + block table + ext
/// table to `stream`, in the crash-detectable order of SPEC_FULL.md §4.7 "Flush".
pub fn flush<S: Stream + ?Sized>(
    stream: &mut S,
    mpq_pos: u64,
    header: &mut MpqHeader,
    hash_table: &HashTable,
    block_table: &BlockTable,
) -> Result<()> {
    let hash_table_bytes = hash_table.capacity() as u64 * 16;
    let block_table_bytes = block_table.len() as u64 * 16;

    let hash_table_offset = next_free_offset(block_table, header.header_size);
    let block_table_offset = hash_table_offset + hash_table_bytes;
    let ext_table_offset = block_table_offset + block_table_bytes;

    header.hash_table_pos_lo = hash_table_offset as u32;
    header.hash_table_pos_hi = (hash_table_offset >> 32) as u16;
    header.block_table_pos_lo = block_table_offset as u32;
    header.block_table_pos_hi = (block_table_offset >> 32) as u16;
    header.hash_table_entries = hash_table.capacity();
    header.block_table_entries = block_table.len();

    let needs_ext = block_table.needs_ext() && header.format_version == FormatVersion::V2;
    let total_size = if needs_ext {
        ext_table_offset + block_table.len() as u64 * 2
    } else {
        ext_table_offset
    };
    header.archive_size = total_size.min(u32::MAX as u64) as u32;
    if needs_ext {
        header.ext_block_table_pos = ext_table_offset;
    }

    // header written first (at its known position) so a torn flush is detectable:
    // a reader that finds a header whose declared table positions don't match what
    // follows knows the write was interrupted after this point.
    stream.seek(SeekFrom::Start(mpq_pos))?;
    header.write(stream)?;

    stream.seek(SeekFrom::Start(mpq_pos + hash_table_offset))?;
    hash_table.write_to(stream)?;

    stream.seek(SeekFrom::Start(mpq_pos + block_table_offset))?;
    block_table.write_to(stream)?;

    if needs_ext {
        stream.seek(SeekFrom::Start(mpq_pos + ext_table_offset))?;
        block_table.write_ext_to(stream)?;
    }

    stream.set_len(mpq_pos + total_size)?;
    stream.flush()?;
    Ok(())
}

/// Clear a block's `EXISTS` bit and zero its sizes, as a write-abort rollback
/// (SPEC_FULL.md §5 "Cancellation").
pub fn rollback_block(block_table: &mut BlockTable, index: u32) {
    block_table.remove(index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FormatVersion;
    use crate::stream::MemoryStream;
    use crate::tables::block_table::{BlockEntry, BlockFlags};

    fn fresh_header() -> MpqHeader {
        MpqHeader {
            header_size: FormatVersion::V1.header_size(),
            archive_size: 0,
            format_version: FormatVersion::V1,
            sector_size_log2: 3,
            hash_table_pos_lo: 0,
            block_table_pos_lo: 0,
            hash_table_entries: 16,
            block_table_entries: 1,
            ext_block_table_pos: 0,
            hash_table_pos_hi: 0,
            block_table_pos_hi: 0,
            protected: false,
        }
    }

    #[test]
    fn flush_then_reopen_preserves_tables() {
        let mut hash_table = HashTable::new(16).unwrap();
        let mut block_table = BlockTable::new(1, 16);

        let offset = fresh_header().header_size as u64;
        block_table.set(
            0,
            BlockEntry {
                offset_lo: 0,
                compressed_size: 100,
                full_size: 100,
                flags: BlockFlags::EXISTS,
            },
            offset,
        );
        let slot = hash_table.find_insert_slot("units.dat");
        hash_table.insert_at(slot, "units.dat", 0, 0);

        let mut header = fresh_header();
        let mut stream = MemoryStream::new();
        flush(&mut stream, 0, &mut header, &hash_table, &block_table).unwrap();

        use std::io::{Seek, SeekFrom};
        stream.seek(SeekFrom::Start(header.hash_table_offset())).unwrap();
        let read_hash = HashTable::read_from(&mut stream, 16).unwrap();
        assert_eq!(read_hash.entries(), hash_table.entries());

        stream.seek(SeekFrom::Start(header.block_table_offset())).unwrap();
        let read_block = BlockTable::read_from(&mut stream, 1).unwrap();
        assert_eq!(read_block.entries()[0], block_table.entries()[0]);
    }

    #[test]
    fn remove_rejects_internal_names() {
        let mut hash_table = HashTable::new(16).unwrap();
        let mut block_table = BlockTable::new(0, 16);
        assert!(matches!(
            remove(&mut hash_table, &mut block_table, "(listfile)"),
            Err(Error::AccessDenied(_))
        ));
    }

    #[test]
    fn next_free_offset_accounts_for_existing_blocks() {
        let mut block_table = BlockTable::new(1, 4);
        block_table.set(
            0,
            BlockEntry {
                offset_lo: 0,
                compressed_size: 50,
                full_size: 50,
                flags: BlockFlags::EXISTS,
            },
            1000,
        );
        assert_eq!(next_free_offset(&block_table, 32), 1050);
    }
}
