//! The top-level archive handle (SPEC_FULL.md §4.8 ArchiveSession).
//!
//! Open files are not handed a back-reference into the session (avoiding an
//! `Arc<Mutex<Box<dyn Read+Seek+Send+Sync>>>` shared-reader pattern); instead the session owns an
//! arena of handle records and callers hold opaque `FileHandle { index, generation }`
//! tokens resolved back through the session on every call (SPEC_FULL.md §9).

use crate::error::{Error, Result};
use crate::hash::{hash_string, HashDomain};
use crate::header::{find_header, FormatVersion, MpqHeader, UserDataHeader};
use crate::pipeline::{file_key, FinishedWrite, ReadHandle, WriteHandle};
use crate::special_files::{build_listfile, parse_listfile};
use crate::stream::Stream;
use crate::tables::block_table::{BlockEntry, BlockFlags, StorageMode};
use crate::tables::hash_table::LookupPolicy;
use crate::tables::{BlockTable, HashTable};
use crate::writer;

/// An opaque token for an open read or write handle. Never dereferenced directly;
/// always resolved through the owning [`ArchiveSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Arena { slots: Vec::new() }
    }

    fn insert(&mut self, value: T) -> FileHandle {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                slot.value = Some(value);
                return FileHandle {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        FileHandle {
            index: self.slots.len() as u32 - 1,
            generation: 0,
        }
    }

    fn get(&self, handle: FileHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    fn get_mut(&mut self, handle: FileHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    fn remove(&mut self, handle: FileHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.value.take()
    }

    /// Handles for every slot still occupied.
    fn active_handles(&self) -> Vec<FileHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| FileHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

/// Options governing [`ArchiveSession::create`] (SPEC_FULL.md §6 "Session options").
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub format_version: FormatVersion,
    pub hash_capacity: u32,
    pub sector_size_log2: u16,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            format_version: FormatVersion::V1,
            hash_capacity: 16,
            sector_size_log2: 3,
        }
    }
}

/// Options governing [`ArchiveSession::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read_only: bool,
    pub force_v1: bool,
    pub check_sector_crc: bool,
}

/// A write in progress: which hash/block slots it reserved, so Finish/abort can
/// populate or roll them back (SPEC_FULL.md §4.6 "state machine").
struct PendingWrite {
    hash_index: u32,
    block_index: u32,
    inner: WriteHandle,
}

pub struct ArchiveSession<S: Stream> {
    stream: S,
    mpq_pos: u64,
    user_data: Option<UserDataHeader>,
    header: MpqHeader,
    hash_table: HashTable,
    block_table: BlockTable,
    locale: u16,
    read_only: bool,
    check_sector_crc: bool,
    changed: bool,
    reads: Arena<(String, ReadHandle)>,
    writes: Arena<PendingWrite>,
}

impl<S: Stream> ArchiveSession<S> {
    /// Create a brand-new, empty archive backed by `stream` (SPEC_FULL.md §4.8).
    pub fn create(stream: S, options: CreateOptions) -> Result<Self> {
        let hash_table = HashTable::new(options.hash_capacity)?;
        let block_table = BlockTable::new(0, options.hash_capacity.max(16));

        let header = MpqHeader {
            header_size: options.format_version.header_size(),
            archive_size: 0,
            format_version: options.format_version,
            sector_size_log2: options.sector_size_log2,
            hash_table_pos_lo: 0,
            block_table_pos_lo: 0,
            hash_table_entries: options.hash_capacity,
            block_table_entries: 0,
            ext_block_table_pos: 0,
            hash_table_pos_hi: 0,
            block_table_pos_hi: 0,
            protected: false,
        };

        Ok(ArchiveSession {
            stream,
            mpq_pos: 0,
            user_data: None,
            header,
            hash_table,
            block_table,
            locale: 0,
            read_only: false,
            check_sector_crc: false,
            changed: true,
            reads: Arena::new(),
            writes: Arena::new(),
        })
    }

    /// Open an existing archive, locating the header, then loading and decoding
    /// the hash and block tables (SPEC_FULL.md §4.5, §4.8).
    pub fn open(mut stream: S, options: OpenOptions) -> Result<Self> {
        let (mpq_pos, user_data, header) = find_header(&mut stream, options.force_v1)?;

        use std::io::{Seek, SeekFrom};
        stream.seek(SeekFrom::Start(mpq_pos + header.hash_table_offset()))?;
        let hash_table = HashTable::read_from(&mut stream, header.hash_table_entries)?;

        stream.seek(SeekFrom::Start(mpq_pos + header.block_table_offset()))?;
        let mut block_table =
            BlockTable::read_from(&mut stream, header.block_table_entries)?;

        if header.format_version == FormatVersion::V2 && header.ext_block_table_pos != 0 {
            stream.seek(SeekFrom::Start(mpq_pos + header.ext_block_table_pos))?;
            block_table.read_ext_from(&mut stream)?;
        }

        Ok(ArchiveSession {
            stream,
            mpq_pos,
            user_data,
            header,
            hash_table,
            block_table,
            locale: 0,
            read_only: options.read_only,
            check_sector_crc: options.check_sector_crc,
            changed: false,
            reads: Arena::new(),
            writes: Arena::new(),
        })
    }

    pub fn locale(&self) -> u16 {
        self.locale
    }

    pub fn set_locale(&mut self, locale: u16) {
        self.locale = locale;
    }

    pub fn is_protected(&self) -> bool {
        self.header.protected
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn has_pending_changes(&self) -> bool {
        self.changed
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only || self.header.protected {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Resolve `name` under the session's current locale policy and open it for
    /// reading (SPEC_FULL.md §4.6 "Opening a file for read").
    pub fn open_file(&mut self, name: &str) -> Result<FileHandle> {
        let (_, entry) = self
            .hash_table
            .find(name, LookupPolicy::Preferred(self.locale), self.block_table.len())
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let block = *self
            .block_table
            .get(entry.block_index)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        if !block.exists() {
            return Err(Error::NotFound(name.to_string()));
        }

        let raw_offset = self.mpq_pos + self.block_table.offset(entry.block_index);
        let mode: StorageMode = block.flags.into();

        let read = ReadHandle::open(
            &mut self.stream,
            self.mpq_pos,
            raw_offset,
            block.full_size,
            block.compressed_size,
            mode,
            self.header.sector_size(),
            Some(name),
            self.check_sector_crc,
        )?;

        Ok(self.reads.insert((name.to_string(), read)))
    }

    pub fn read_file(&mut self, handle: FileHandle) -> Result<Vec<u8>> {
        let (name, read) = self
            .reads
            .get(handle)
            .ok_or_else(|| Error::InvalidArgument("stale file handle".into()))?;
        let name = name.clone();

        if self.check_sector_crc {
            for i in 0..read.sector_count() {
                let (_, read) = self.reads.get(handle).expect("checked above");
                read.verify_sector(&mut self.stream, i, &name)?;
            }
        }

        let (_, read) = self.reads.get(handle).expect("checked above");
        read.read_all(&mut self.stream)
    }

    pub fn close_file(&mut self, handle: FileHandle) {
        self.reads.remove(handle);
    }

    /// Begin streaming a new file into the archive (SPEC_FULL.md §4.6 "Init").
    #[allow(clippy::too_many_arguments)]
    pub fn create_file(
        &mut self,
        name: &str,
        full_size: u32,
        mode: StorageMode,
        requested_mask: u8,
        replace_existing: bool,
    ) -> Result<FileHandle> {
        self.check_writable()?;

        let existing = self
            .hash_table
            .find(name, LookupPolicy::Exact(self.locale), self.block_table.len());
        if existing.is_some() && !replace_existing {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let hash_index = match existing {
            Some((index, _)) => index,
            None => self.hash_table.find_insert_slot(name),
        };

        let block_index = self.block_table.allocate()?;
        let raw_offset = writer::next_free_offset(&self.block_table, self.header.header_size);

        self.block_table.set(
            block_index,
            BlockEntry {
                offset_lo: 0,
                compressed_size: 0,
                full_size,
                flags: mode.into(),
            },
            raw_offset,
        );
        self.hash_table
            .insert_at(hash_index, name, self.locale, block_index);

        let key = file_key(name, mode.fix_key, raw_offset as u32, full_size);
        let write = WriteHandle::new(
            self.mpq_pos + raw_offset,
            full_size,
            self.header.sector_size(),
            mode,
            key,
            requested_mask,
        );

        self.changed = true;
        Ok(self.writes.insert(PendingWrite {
            hash_index,
            block_index,
            inner: write,
        }))
    }

    pub fn write_file(&mut self, handle: FileHandle, data: &[u8]) -> Result<()> {
        let pending = self
            .writes
            .get_mut(handle)
            .ok_or_else(|| Error::InvalidArgument("stale write handle".into()))?;
        let result = pending.inner.write(&mut self.stream, data);
        if result.is_err() {
            self.abort_write(handle);
        }
        result
    }

    /// Complete a streaming write (SPEC_FULL.md §4.6 "Finish").
    pub fn finish_file(&mut self, handle: FileHandle) -> Result<()> {
        let pending = self
            .writes
            .remove(handle)
            .ok_or_else(|| Error::InvalidArgument("stale write handle".into()))?;

        let block_index = pending.block_index;
        let hash_index = pending.hash_index;

        match pending.inner.finish(&mut self.stream) {
            Ok(FinishedWrite {
                compressed_size,
                full_size,
                mode,
                ..
            }) => {
                let raw_offset = self.block_table.offset(block_index);
                self.block_table.set(
                    block_index,
                    BlockEntry {
                        offset_lo: 0,
                        compressed_size,
                        full_size,
                        flags: mode.into(),
                    },
                    raw_offset,
                );
                self.changed = true;
                Ok(())
            }
            Err(e) => {
                self.block_table.remove(block_index);
                self.hash_table.delete_at(hash_index);
                self.changed = true;
                Err(e)
            }
        }
    }

    /// Abort an in-progress write, rolling back the hash/block slots it reserved
    /// (SPEC_FULL.md §5 "Cancellation").
    pub fn abort_write(&mut self, handle: FileHandle) {
        if let Some(pending) = self.writes.remove(handle) {
            self.block_table.remove(pending.block_index);
            self.hash_table.delete_at(pending.hash_index);
            self.changed = true;
        }
    }

    /// Add a whole in-memory buffer in one call: a convenience wrapper over the
    /// three-phase protocol for callers who already have the full payload.
    pub fn add_file(
        &mut self,
        name: &str,
        data: &[u8],
        mode: StorageMode,
        requested_mask: u8,
        replace_existing: bool,
    ) -> Result<()> {
        let handle = self.create_file(name, data.len() as u32, mode, requested_mask, replace_existing)?;
        if let Err(e) = self.write_file(handle, data) {
            return Err(e);
        }
        self.finish_file(handle)
    }

    /// Rename a file, re-encrypting its contents under the new key if necessary
    /// (SPEC_FULL.md §4.6 "Rename with recrypt").
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_writable()?;

        let (old_index, entry) = self
            .hash_table
            .find(old_name, LookupPolicy::Exact(self.locale), self.block_table.len())
            .ok_or_else(|| Error::NotFound(old_name.to_string()))?;

        if self
            .hash_table
            .find(new_name, LookupPolicy::Exact(self.locale), self.block_table.len())
            .is_some()
        {
            return Err(Error::AlreadyExists(new_name.to_string()));
        }

        let block = *self.block_table.get(entry.block_index).unwrap();
        let mode: StorageMode = block.flags.into();

        if mode.encrypted {
            let raw_offset = self.mpq_pos + self.block_table.offset(entry.block_index);
            let old_key = file_key(old_name, mode.fix_key, raw_offset as u32, block.full_size);
            let new_key = file_key(new_name, mode.fix_key, raw_offset as u32, block.full_size);

            if old_key != new_key && !mode.single_unit {
                use std::io::{Read, Seek, SeekFrom};
                let data_sectors = block.full_size.div_ceil(self.header.sector_size());
                let mut count = data_sectors + 1;
                if mode.sector_crc {
                    count += 1;
                }
                self.stream.seek(SeekFrom::Start(raw_offset))?;
                let mut raw = vec![0u8; count as usize * 4];
                self.stream.read_exact(&mut raw)?;
                let mut table: Vec<u32> = raw
                    .chunks_exact(4)
                    .map(byteorder::LE::read_u32)
                    .collect();

                crate::pipeline::recrypt_for_rename(
                    &mut self.stream,
                    raw_offset,
                    mode,
                    old_key,
                    new_key,
                    &mut table,
                )?;
            }
        }

        self.hash_table.delete_at(old_index);
        let new_slot = self.hash_table.find_insert_slot(new_name);
        self.hash_table
            .insert_at(new_slot, new_name, self.locale, entry.block_index);
        self.changed = true;
        Ok(())
    }

    /// Remove a file (SPEC_FULL.md §4.7 "Remove").
    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        writer::remove(&mut self.hash_table, &mut self.block_table, name)?;
        self.changed = true;
        Ok(())
    }

    /// Read and parse the `(listfile)`, if present.
    pub fn list_files(&mut self) -> Result<Vec<String>> {
        let handle = self.open_file("(listfile)")?;
        let data = self.read_file(handle)?;
        self.close_file(handle);
        Ok(parse_listfile(&data))
    }

    /// (Re)write the `(listfile)` from the given names.
    pub fn write_listfile<'a>(&mut self, names: impl Iterator<Item = &'a str>) -> Result<()> {
        let blob = build_listfile(names);
        let mode = StorageMode {
            compressed: true,
            imploded: false,
            encrypted: false,
            fix_key: false,
            single_unit: false,
            sector_crc: false,
        };
        self.add_file("(listfile)", &blob, mode, crate::compression::mask::ZLIB, true)
    }

    /// Roll back any write handle still in the `Writing` state, i.e. whose
    /// `FileHandle` the caller dropped without calling `finish_file` or
    /// `abort_write`. Its hash/block entries were already reserved and must be
    /// cleared before the tables are committed (SPEC_FULL.md §4.6 "state machine").
    fn reap_abandoned_writes(&mut self) {
        for handle in self.writes.active_handles() {
            self.abort_write(handle);
        }
    }

    /// Flush pending table changes to the underlying stream (SPEC_FULL.md §4.7 "Flush").
    pub fn flush(&mut self) -> Result<()> {
        self.reap_abandoned_writes();

        if !self.changed {
            return Ok(());
        }
        writer::flush(
            &mut self.stream,
            self.mpq_pos,
            &mut self.header,
            &self.hash_table,
            &self.block_table,
        )?;
        self.changed = false;
        Ok(())
    }

    /// Flush and release the underlying stream.
    pub fn close(mut self) -> Result<S> {
        self.flush()?;
        Ok(self.stream)
    }
}

/// The key used to encrypt/decrypt the two metadata tables, derived once so callers
/// don't need to remember the literal strings (SPEC_FULL.md §4.4).
pub fn table_key(table_name: &str) -> u32 {
    hash_string(table_name, HashDomain::FileKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn plain_mode() -> StorageMode {
        StorageMode {
            compressed: true,
            imploded: false,
            encrypted: true,
            fix_key: true,
            single_unit: false,
            sector_crc: false,
        }
    }

    #[test]
    fn create_add_read_cycle() {
        let mut session =
            ArchiveSession::create(MemoryStream::new(), CreateOptions::default()).unwrap();

        let data: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        session
            .add_file("units.dat", &data, plain_mode(), crate::compression::mask::ZLIB, false)
            .unwrap();
        session.flush().unwrap();

        let handle = session.open_file("units.dat").unwrap();
        let restored = session.read_file(handle).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn close_then_reopen_round_trips() {
        let mut session =
            ArchiveSession::create(MemoryStream::new(), CreateOptions::default()).unwrap();

        let data = b"hello archive".repeat(10);
        session
            .add_file("greeting.txt", &data, plain_mode(), crate::compression::mask::ZLIB, false)
            .unwrap();
        let stream = session.close().unwrap();

        let mut reopened = ArchiveSession::open(stream, OpenOptions::default()).unwrap();
        let handle = reopened.open_file("greeting.txt").unwrap();
        let restored = reopened.read_file(handle).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn remove_then_lookup_fails() {
        let mut session =
            ArchiveSession::create(MemoryStream::new(), CreateOptions::default()).unwrap();
        session
            .add_file("a.txt", b"contents", plain_mode(), crate::compression::mask::ZLIB, false)
            .unwrap();

        session.remove_file("a.txt").unwrap();
        assert!(matches!(session.open_file("a.txt"), Err(Error::NotFound(_))));
    }

    #[test]
    fn rename_preserves_content() {
        let mut session =
            ArchiveSession::create(MemoryStream::new(), CreateOptions::default()).unwrap();
        let data = b"renamed content".repeat(5);
        session
            .add_file("old.txt", &data, plain_mode(), crate::compression::mask::ZLIB, false)
            .unwrap();

        session.rename("old.txt", "new.txt").unwrap();
        assert!(matches!(session.open_file("old.txt"), Err(Error::NotFound(_))));

        let handle = session.open_file("new.txt").unwrap();
        let restored = session.read_file(handle).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn flush_rolls_back_a_write_handle_the_caller_never_finished() {
        let mut session =
            ArchiveSession::create(MemoryStream::new(), CreateOptions::default()).unwrap();

        let handle = session
            .create_file("ghost.txt", 5, plain_mode(), crate::compression::mask::ZLIB, false)
            .unwrap();
        session.write_file(handle, b"ghost").unwrap();
        // Caller abandons the handle here: no finish_file, no abort_write.
        drop(handle);

        session.flush().unwrap();

        assert!(matches!(session.open_file("ghost.txt"), Err(Error::NotFound(_))));
    }

    #[test]
    fn cannot_remove_internal_listfile() {
        let mut session =
            ArchiveSession::create(MemoryStream::new(), CreateOptions::default()).unwrap();
        session.write_listfile(["a.txt"].into_iter()).unwrap();
        assert!(matches!(
            session.remove_file("(listfile)"),
            Err(Error::AccessDenied(_))
        ));
    }
}
