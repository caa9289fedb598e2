//! The per-file sector pipeline: read path and the three-phase write protocol
//! (SPEC_FULL.md §4.6).

use byteorder::{ByteOrder, LE};
use md5::{Digest, Md5};

use crate::compression::{compress_sector, decompress_sector};
use crate::crypto::{decrypt_block, encrypt_block, recover_key_from_content, recover_key_from_sector_table};
use crate::error::{Error, Result};
use crate::hash::{hash_string, plain_name, HashDomain};
use crate::stream::Stream;
use crate::tables::block_table::StorageMode;

/// Derive a file's encryption key from its stored name, applying `FIX_KEY` if the
/// block's flags require it (SPEC_FULL.md §3 invariant 2).
pub fn file_key(stored_name: &str, fix_key: bool, raw_offset_lo: u32, full_size: u32) -> u32 {
    let base = hash_string(plain_name(stored_name), HashDomain::FileKey);
    if fix_key {
        base.wrapping_add(raw_offset_lo) ^ full_size
    } else {
        base
    }
}

/// Read the leading `known.len()` words of the (still-encrypted) sector data and try
/// to recover the key from them (SPEC_FULL.md §4.2 "KeyRecoveryFromContent"). `None`
/// known words means this fallback isn't available for this file.
fn recover_key_from_content_fallback<S: Stream + ?Sized>(
    stream: &mut S,
    raw_offset: u64,
    known_plaintext: Option<&[u32]>,
) -> Result<Option<u32>> {
    use std::io::{Read, Seek, SeekFrom};

    let Some(known) = known_plaintext else {
        return Ok(None);
    };

    stream.seek(SeekFrom::Start(raw_offset))?;
    let mut raw = vec![0u8; known.len() * 4];
    stream.read_exact(&mut raw)?;
    let encrypted: Vec<u32> = raw.chunks_exact(4).map(LE::read_u32).collect();

    Ok(recover_key_from_content(&encrypted, known))
}

fn sector_count(full_size: u32, sector_size: u32) -> u32 {
    if full_size == 0 {
        0
    } else {
        full_size.div_ceil(sector_size)
    }
}

/// A file opened for reading: everything needed to pull any sector on demand.
pub struct ReadHandle {
    pub raw_offset: u64,
    /// The archive's base position in its container stream, needed to reinterpret
    /// a sector-offset table entry whose top bit is set (SPEC_FULL.md §4.6
    /// "Negative sector offsets").
    pub mpq_pos: u64,
    pub full_size: u32,
    pub sector_size: u32,
    pub mode: StorageMode,
    pub file_key: u32,
    /// Absent for single-unit files.
    pub sector_offsets: Option<Vec<u32>>,
    pub check_sector_crc: bool,
    /// Number of actual data sectors, independent of whether the sector-offset
    /// table carries a trailing entry for the sector-CRC trailer.
    data_sector_count: u32,
}

impl ReadHandle {
    /// Open a file for read (SPEC_FULL.md §4.6 "Opening a file for read").
    ///
    /// `raw_offset` is already the absolute stream offset (`mpq_pos + raw`).
    /// `known_key` lets a caller who already resolved the plain name skip recovery;
    /// pass `None` to force key recovery when the file is encrypted.
    #[allow(clippy::too_many_arguments)]
    pub fn open<S: Stream + ?Sized>(
        stream: &mut S,
        mpq_pos: u64,
        raw_offset: u64,
        full_size: u32,
        compressed_size: u32,
        mode: StorageMode,
        archive_sector_size: u32,
        stored_name: Option<&str>,
        check_sector_crc: bool,
    ) -> Result<Self> {
        Self::open_with_known_plaintext(
            stream,
            mpq_pos,
            raw_offset,
            full_size,
            compressed_size,
            mode,
            archive_sector_size,
            stored_name,
            check_sector_crc,
            None,
        )
    }

    /// Like [`open`](Self::open), but when the file's plain name is unknown and the
    /// sector-offset table doesn't yield a key, fall back to known-plaintext recovery
    /// against `known_plaintext` (e.g. a `.wav` RIFF header's first N u32s;
    /// SPEC_FULL.md §4.2 "KeyRecoveryFromContent").
    #[allow(clippy::too_many_arguments)]
    pub fn open_with_known_plaintext<S: Stream + ?Sized>(
        stream: &mut S,
        mpq_pos: u64,
        raw_offset: u64,
        full_size: u32,
        compressed_size: u32,
        mode: StorageMode,
        archive_sector_size: u32,
        stored_name: Option<&str>,
        check_sector_crc: bool,
        known_plaintext: Option<&[u32]>,
    ) -> Result<Self> {
        let sector_size = if mode.single_unit {
            full_size.max(1)
        } else {
            archive_sector_size
        };

        let mut file_key = stored_name
            .map(|name| file_key(name, mode.fix_key, raw_offset as u32, full_size))
            .unwrap_or(0);

        let sector_offsets = if mode.single_unit {
            None
        } else if mode.compressed || mode.imploded {
            let data_sectors = sector_count(full_size, archive_sector_size);
            let mut count = data_sectors + 1;
            if mode.sector_crc {
                count += 1;
            }

            use std::io::{Read, Seek, SeekFrom};
            stream.seek(SeekFrom::Start(raw_offset))?;
            let mut raw = vec![0u8; count as usize * 4];
            stream.read_exact(&mut raw)?;

            let mut table: Vec<u32> = raw.chunks_exact(4).map(LE::read_u32).collect();

            if mode.encrypted {
                if stored_name.is_none() || file_key == 0 {
                    file_key = match recover_key_from_sector_table(table[0], table[1], count * 4) {
                        Some(recovered) => recovered,
                        None => recover_key_from_content_fallback(
                            stream,
                            raw_offset,
                            known_plaintext,
                        )?
                        .ok_or_else(|| Error::UnknownKey("<unresolved>".to_string()))?,
                    };
                }
                decrypt_block(&mut table, file_key.wrapping_sub(1));
            }

            if table.len() >= 2 && table[1].wrapping_sub(table[0]) > archive_sector_size {
                return Err(Error::Corrupt(
                    "sector-offset table's first delta exceeds the archive sector size"
                        .to_string(),
                ));
            }

            Some(table)
        } else {
            None
        };

        if mode.single_unit && mode.encrypted && (stored_name.is_none() || file_key == 0) {
            file_key = recover_key_from_content_fallback(stream, raw_offset, known_plaintext)?
                .ok_or_else(|| Error::UnknownKey("<unresolved>".to_string()))?;
        }

        let _ = compressed_size;

        let data_sector_count = if mode.single_unit {
            1
        } else {
            sector_count(full_size, archive_sector_size)
        };

        Ok(ReadHandle {
            raw_offset,
            mpq_pos,
            full_size,
            sector_size,
            mode,
            file_key,
            sector_offsets,
            check_sector_crc,
            data_sector_count,
        })
    }

    pub fn sector_count(&self) -> u32 {
        self.data_sector_count
    }

    /// Resolve a sector-offset table entry to an absolute stream position.
    ///
    /// Some protectors place the sector-offset table after the file data and encode
    /// offsets as 32-bit two's-complement negatives to defeat naive unpackers. When
    /// the top bit of `table_value` is set, the effective position is computed as
    /// `mpq_pos + (table_value + offset_lo)`, wrapping in 32 bits, instead of the
    /// normal `raw_offset + table_value` (SPEC_FULL.md §4.6 "Negative sector offsets").
    fn sector_raw_position(&self, table_value: u32) -> u64 {
        if table_value & 0x8000_0000 != 0 {
            let offset_lo = self.raw_offset.wrapping_sub(self.mpq_pos) as u32;
            let wrapped = table_value.wrapping_add(offset_lo);
            self.mpq_pos.wrapping_add(wrapped as u64)
        } else {
            self.raw_offset + table_value as u64
        }
    }

    /// Decode the sector-CRC trailer, if this file has one, as encoded by the
    /// writer (zlib-compressed little-endian Adler-32 words; SPEC_FULL.md §3).
    fn decode_sector_crcs<S: Stream + ?Sized>(&self, stream: &mut S) -> Result<Option<Vec<u32>>> {
        if !self.mode.sector_crc {
            return Ok(None);
        }
        let Some(table) = &self.sector_offsets else {
            return Ok(None);
        };
        let n = table.len();
        if n < 2 {
            return Ok(None);
        }

        use std::io::{Read, Seek, SeekFrom};
        let start = table[n - 2];
        let end = table[n - 1];
        if end <= start {
            return Ok(None);
        }

        stream.seek(SeekFrom::Start(self.sector_raw_position(start)))?;
        let mut framed = vec![0u8; (end - start) as usize];
        stream.read_exact(&mut framed)?;

        if framed.is_empty() {
            return Ok(None);
        }
        let mask = framed[0];
        let expected_len = self.data_sector_count as usize * 4;
        let raw = decompress_sector(mask, &framed[1..], expected_len)?;
        Ok(Some(raw.chunks_exact(4).map(LE::read_u32).collect()))
    }

    /// Verify sector `index` against the decoded sector-CRC trailer, if present.
    pub fn verify_sector<S: Stream + ?Sized>(
        &self,
        stream: &mut S,
        index: u32,
        file_name: &str,
    ) -> Result<()> {
        if !self.check_sector_crc || !self.mode.sector_crc {
            return Ok(());
        }
        let Some(crcs) = self.decode_sector_crcs(stream)? else {
            return Ok(());
        };
        let Some(&expected) = crcs.get(index as usize) else {
            return Ok(());
        };

        let (offset, stored) = match &self.sector_offsets {
            Some(table) => (
                self.sector_raw_position(table[index as usize]),
                table[index as usize + 1].wrapping_sub(table[index as usize]),
            ),
            None => return Ok(()),
        };

        use std::io::{Read, Seek, SeekFrom};
        stream.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; stored as usize];
        stream.read_exact(&mut buf)?;

        if self.mode.encrypted {
            let mut words: Vec<u32> = buf.chunks_exact(4).map(LE::read_u32).collect();
            decrypt_block(&mut words, self.file_key.wrapping_add(index));
            for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
                LE::write_u32(chunk, word);
            }
        }

        if crate::hashes::adler32(&buf) != expected {
            return Err(Error::ChecksumMismatch {
                file: file_name.to_string(),
                sector: index,
            });
        }
        Ok(())
    }

    /// Read and fully decode sector `index`.
    pub fn read_sector<S: Stream + ?Sized>(&self, stream: &mut S, index: u32) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};

        let uncompressed_len = if index + 1 == self.sector_count() {
            self.full_size - index * self.sector_size
        } else {
            self.sector_size
        }
        .min(self.full_size.max(1));

        let (offset, stored) = match &self.sector_offsets {
            Some(table) => (
                self.sector_raw_position(table[index as usize]),
                table[index as usize + 1].wrapping_sub(table[index as usize]),
            ),
            None => (self.raw_offset, self.full_size),
        };

        stream.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; stored as usize];
        stream.read_exact(&mut buf)?;

        if self.mode.encrypted {
            let mut words: Vec<u32> = buf.chunks_exact(4).map(LE::read_u32).collect();
            decrypt_block(&mut words, self.file_key.wrapping_add(index));
            for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
                LE::write_u32(chunk, word);
            }
        }

        let plain = if (stored as u32) < uncompressed_len && !buf.is_empty() {
            let mask = buf[0];
            decompress_sector(mask, &buf[1..], uncompressed_len as usize)?
        } else {
            buf
        };

        Ok(plain)
    }

    /// Read the whole file, sector by sector.
    pub fn read_all<S: Stream + ?Sized>(&self, stream: &mut S) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.full_size as usize);
        for i in 0..self.sector_count() {
            out.extend(self.read_sector(stream, i)?);
        }
        out.truncate(self.full_size as usize);
        Ok(out)
    }
}

/// The state a write handle can be in (SPEC_FULL.md §4.6 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Writing,
    Completed,
    Errored,
}

/// A file being streamed into the archive under the three-phase write protocol.
pub struct WriteHandle {
    pub raw_offset: u64,
    pub declared_size: u32,
    pub sector_size: u32,
    pub mode: StorageMode,
    pub file_key: u32,
    pub requested_mask: u8,
    state: WriteState,
    bytes_written: u32,
    pending: Vec<u8>,
    compressed_cursor: u64,
    sector_offsets: Vec<u32>,
    sector_crcs: Vec<u32>,
    md5: Md5,
    crc32: crc32fast::Hasher,
}

impl WriteHandle {
    /// Begin a write. `declared_size` is the file's full, uncompressed length, known
    /// up front. Flags below 4/32 bytes are dropped per SPEC_FULL.md §4.6 "Init".
    pub fn new(raw_offset: u64, declared_size: u32, sector_size: u32, mut mode: StorageMode, file_key: u32, requested_mask: u8) -> Self {
        if declared_size < 4 {
            mode.encrypted = false;
            mode.fix_key = false;
        }
        if declared_size < 32 {
            mode.compressed = false;
            mode.sector_crc = false;
        }

        let sector_size = if mode.single_unit {
            declared_size.max(1)
        } else {
            sector_size
        };

        let header_len = if mode.single_unit {
            0
        } else {
            let mut n = sector_count(declared_size, sector_size) + 1;
            if mode.sector_crc {
                n += 1;
            }
            n * 4
        };

        WriteHandle {
            raw_offset,
            declared_size,
            sector_size,
            mode,
            file_key,
            requested_mask,
            state: WriteState::Writing,
            bytes_written: 0,
            pending: Vec::new(),
            compressed_cursor: header_len as u64,
            sector_offsets: vec![0; (header_len / 4) as usize],
            sector_crcs: Vec::new(),
            md5: Md5::new(),
            crc32: crc32fast::Hasher::new(),
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    /// Feed raw bytes. May flush zero or more full sectors.
    pub fn write<S: Stream + ?Sized>(&mut self, stream: &mut S, mut data: &[u8]) -> Result<()> {
        if self.state != WriteState::Writing {
            return Err(Error::InvalidArgument("write handle is not writable".into()));
        }

        let result = (|| -> Result<()> {
            while !data.is_empty() {
                let sector_index = (self.bytes_written / self.sector_size.max(1)) as usize;
                let room = self.sector_size as usize - self.pending.len();
                let take = room.min(data.len());
                self.pending.extend_from_slice(&data[..take]);
                data = &data[take..];
                self.bytes_written += take as u32;

                let is_last_full = self.bytes_written == self.declared_size;
                if self.pending.len() == self.sector_size as usize || (is_last_full && !self.pending.is_empty()) {
                    self.flush_sector(stream, sector_index)?;
                }
            }
            Ok(())
        })();

        if result.is_err() {
            self.state = WriteState::Errored;
        }
        result
    }

    fn flush_sector<S: Stream + ?Sized>(&mut self, stream: &mut S, index: usize) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        self.md5.update(&self.pending);
        self.crc32.update(&self.pending);

        let raw_len = self.pending.len();
        let mut payload = if self.mode.compressed || self.mode.imploded {
            let (applied_mask, compressed) = compress_sector(&self.pending, self.requested_mask)?;
            if compressed.len() + 1 < raw_len {
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(applied_mask);
                out.extend(compressed);
                out
            } else {
                std::mem::take(&mut self.pending)
            }
        } else {
            std::mem::take(&mut self.pending)
        };

        if self.mode.sector_crc {
            self.sector_crcs.push(crate::hashes::adler32(&payload));
        }

        if self.mode.encrypted {
            let mut words: Vec<u32> = payload
                .chunks_exact(4)
                .map(LE::read_u32)
                .collect();
            let remainder = payload.len() % 4;
            encrypt_block(&mut words, self.file_key.wrapping_add(index as u32));
            for (chunk, word) in payload.chunks_exact_mut(4).zip(words) {
                LE::write_u32(chunk, word);
            }
            debug_assert_eq!(remainder, payload.len() % 4);
        }

        stream.seek(SeekFrom::Start(self.raw_offset + self.compressed_cursor))?;
        stream.write_all(&payload)?;

        if !self.mode.single_unit {
            self.sector_offsets[index] = self.compressed_cursor as u32;
        }
        self.compressed_cursor += payload.len() as u64;
        if !self.mode.single_unit {
            self.sector_offsets[index + 1] = self.compressed_cursor as u32;
        }

        self.pending.clear();
        Ok(())
    }

    /// Finish the write: verify the declared length, write the sector-CRC trailer and
    /// the now-populated sector-offset table (SPEC_FULL.md §4.6 "Finish").
    pub fn finish<S: Stream + ?Sized>(mut self, stream: &mut S) -> Result<FinishedWrite> {
        use std::io::{Seek, SeekFrom, Write};

        if self.bytes_written != self.declared_size {
            self.state = WriteState::Errored;
            return Err(Error::InvalidArgument(format!(
                "stream length {} does not match declared size {}",
                self.bytes_written, self.declared_size
            )));
        }

        if self.mode.sector_crc && !self.mode.single_unit && !self.sector_crcs.is_empty() {
            let mut raw = Vec::with_capacity(self.sector_crcs.len() * 4);
            for crc in &self.sector_crcs {
                let mut buf = [0u8; 4];
                LE::write_u32(&mut buf, *crc);
                raw.extend_from_slice(&buf);
            }
            let (_, compressed) = compress_sector(&raw, crate::compression::mask::ZLIB)?;
            let trailer_offset = self.compressed_cursor;
            stream.seek(SeekFrom::Start(self.raw_offset + trailer_offset))?;
            let mut framed = Vec::with_capacity(compressed.len() + 1);
            framed.push(crate::compression::mask::ZLIB);
            framed.extend(compressed);
            stream.write_all(&framed)?;

            let n = self.sector_offsets.len();
            self.sector_offsets[n - 1] = trailer_offset as u32 + framed.len() as u32;
            self.compressed_cursor = self.sector_offsets[n - 1] as u64;
        }

        if !self.mode.single_unit {
            let mut raw = Vec::with_capacity(self.sector_offsets.len() * 4);
            for off in &self.sector_offsets {
                let mut buf = [0u8; 4];
                LE::write_u32(&mut buf, *off);
                raw.extend_from_slice(&buf);
            }
            if self.mode.encrypted {
                let mut words: Vec<u32> = raw.chunks_exact(4).map(LE::read_u32).collect();
                encrypt_block(&mut words, self.file_key.wrapping_sub(1));
                for (chunk, word) in raw.chunks_exact_mut(4).zip(words) {
                    LE::write_u32(chunk, word);
                }
            }
            stream.seek(SeekFrom::Start(self.raw_offset))?;
            stream.write_all(&raw)?;
        }

        self.state = WriteState::Completed;

        let md5: [u8; 16] = self.md5.finalize().into();
        Ok(FinishedWrite {
            compressed_size: self.compressed_cursor as u32,
            full_size: self.declared_size,
            mode: self.mode,
            md5,
            crc32: self.crc32.finalize(),
        })
    }
}

/// What a completed write contributes back to the block table entry.
pub struct FinishedWrite {
    pub compressed_size: u32,
    pub full_size: u32,
    pub mode: StorageMode,
    pub md5: [u8; 16],
    pub crc32: u32,
}

/// Recompute the effective key after a rename and re-encrypt every sector in place,
/// without recompressing (SPEC_FULL.md §4.6 "Rename with recrypt").
pub fn recrypt_for_rename<S: Stream + ?Sized>(
    stream: &mut S,
    raw_offset: u64,
    mode: StorageMode,
    old_key: u32,
    new_key: u32,
    sector_offsets: &mut [u32],
) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom, Write};

    if !mode.encrypted || old_key == new_key {
        return Ok(());
    }

    if !mode.single_unit {
        let mut words: Vec<u32> = sector_offsets.to_vec();
        decrypt_block(&mut words, old_key.wrapping_sub(1));
        let plain = words.clone();
        encrypt_block(&mut words, new_key.wrapping_sub(1));
        sector_offsets.copy_from_slice(&words);

        stream.seek(SeekFrom::Start(raw_offset))?;
        let mut raw = vec![0u8; sector_offsets.len() * 4];
        for (chunk, word) in raw.chunks_exact_mut(4).zip(&words) {
            LE::write_u32(chunk, *word);
        }
        stream.seek(SeekFrom::Start(raw_offset))?;
        stream.write_all(&raw)?;

        for i in 0..plain.len() - 1 {
            let start = plain[i] as u64;
            let len = (plain[i + 1] - plain[i]) as usize;
            stream.seek(SeekFrom::Start(raw_offset + start))?;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf)?;

            let mut sector_words: Vec<u32> = buf.chunks_exact(4).map(LE::read_u32).collect();
            decrypt_block(&mut sector_words, old_key.wrapping_add(i as u32));
            encrypt_block(&mut sector_words, new_key.wrapping_add(i as u32));
            for (chunk, word) in buf.chunks_exact_mut(4).zip(sector_words) {
                LE::write_u32(chunk, word);
            }

            stream.seek(SeekFrom::Start(raw_offset + start))?;
            stream.write_all(&buf)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use crate::tables::block_table::StorageMode;

    fn plain_mode() -> StorageMode {
        StorageMode {
            compressed: false,
            imploded: false,
            encrypted: false,
            fix_key: false,
            single_unit: false,
            sector_crc: false,
        }
    }

    #[test]
    fn write_then_read_round_trips_uncompressed() {
        let mut stream = MemoryStream::new();
        stream.set_len(4096).unwrap();

        let data: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        let mut handle = WriteHandle::new(0, data.len() as u32, 512, plain_mode(), 0, 0);
        handle.write(&mut stream, &data).unwrap();
        let finished = handle.finish(&mut stream).unwrap();

        let read = ReadHandle::open(
            &mut stream,
            0,
            0,
            finished.full_size,
            finished.compressed_size,
            finished.mode,
            512,
            None,
            false,
        )
        .unwrap();
        let restored = read.read_all(&mut stream).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn write_then_read_round_trips_compressed_and_encrypted() {
        let mut stream = MemoryStream::new();
        stream.set_len(8192).unwrap();

        let data: Vec<u8> = b"the quick brown fox jumps over the lazy dog ".repeat(64);
        let mode = StorageMode {
            compressed: true,
            imploded: false,
            encrypted: true,
            fix_key: false,
            single_unit: false,
            sector_crc: true,
        };
        let key = file_key("units.dat", false, 0, 0);

        let mut handle = WriteHandle::new(0, data.len() as u32, 512, mode, key, crate::compression::mask::ZLIB);
        handle.write(&mut stream, &data).unwrap();
        let finished = handle.finish(&mut stream).unwrap();

        let read = ReadHandle::open(
            &mut stream,
            0,
            0,
            finished.full_size,
            finished.compressed_size,
            finished.mode,
            512,
            Some("units.dat"),
            true,
        )
        .unwrap();
        let restored = read.read_all(&mut stream).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn single_unit_round_trips() {
        let mut stream = MemoryStream::new();
        stream.set_len(1024).unwrap();

        let data = b"tiny file".to_vec();
        let mode = StorageMode {
            compressed: true,
            imploded: false,
            encrypted: false,
            fix_key: false,
            single_unit: true,
            sector_crc: false,
        };

        let mut handle = WriteHandle::new(0, data.len() as u32, 512, mode, 0, crate::compression::mask::ZLIB);
        handle.write(&mut stream, &data).unwrap();
        let finished = handle.finish(&mut stream).unwrap();

        let read = ReadHandle::open(
            &mut stream,
            0,
            0,
            finished.full_size,
            finished.compressed_size,
            finished.mode,
            512,
            None,
            false,
        )
        .unwrap();
        assert_eq!(read.sector_count(), 1);
        assert_eq!(read.read_all(&mut stream).unwrap(), data);
    }

    #[test]
    fn unknown_key_recovers_from_wav_content() {
        let mut stream = MemoryStream::new();
        stream.set_len(1024).unwrap();

        let mut data = Vec::new();
        data.extend_from_slice(&0x4646_4952u32.to_le_bytes()); // "RIFF"
        data.extend_from_slice(&36u32.to_le_bytes()); // size - 8
        data.extend_from_slice(&0x4556_4157u32.to_le_bytes()); // "WAVE"
        data.extend_from_slice(&[0u8; 32]);

        let mode = StorageMode {
            compressed: false,
            imploded: false,
            encrypted: true,
            fix_key: false,
            single_unit: true,
            sector_crc: false,
        };
        let key = file_key("sound.wav", false, 0, 0);

        let mut handle = WriteHandle::new(0, data.len() as u32, 512, mode, key, 0);
        handle.write(&mut stream, &data).unwrap();
        let finished = handle.finish(&mut stream).unwrap();

        let known = [0x4646_4952u32, 36, 0x4556_4157];
        let read = ReadHandle::open_with_known_plaintext(
            &mut stream,
            0,
            0,
            finished.full_size,
            finished.compressed_size,
            finished.mode,
            512,
            None,
            false,
            Some(&known),
        )
        .unwrap();
        assert_eq!(read.read_all(&mut stream).unwrap(), data);
    }

    #[test]
    fn negative_sector_offset_reinterpreted_with_top_bit_set() {
        // Sector-offset table lives at raw_offset, pointing at data placed before it
        // (as protectors that defeat naive unpackers do): table[0]'s top bit is set,
        // and the two's-complement value plus the archive's offset_lo lands back on
        // the real data position once wrapped into 32 bits.
        let mut stream = MemoryStream::new();
        stream.set_len(4096).unwrap();

        let mpq_pos = 0u64;
        let data_pos = 16u64;
        let payload = b"negative offset sector payload!".to_vec();

        use std::io::{Seek, SeekFrom, Write};
        stream.seek(SeekFrom::Start(data_pos)).unwrap();
        stream.write_all(&payload).unwrap();

        // Table placed after the data, at raw_offset.
        let raw_offset = 64u64;
        let offset_lo = (raw_offset - mpq_pos) as u32;

        // table[0] encodes `data_pos` as a negative offset relative to raw_offset:
        // data_pos == mpq_pos + (table0 + offset_lo) wrapped in 32 bits, so
        // table0 = (data_pos as u32).wrapping_sub(offset_lo), forced negative.
        let table0 = (data_pos as u32).wrapping_sub(offset_lo) | 0x8000_0000;
        let table1 = table0.wrapping_add(payload.len() as u32);

        let mut raw = vec![0u8; 8];
        LE::write_u32(&mut raw[0..4], table0);
        LE::write_u32(&mut raw[4..8], table1);
        stream.seek(SeekFrom::Start(raw_offset)).unwrap();
        stream.write_all(&raw).unwrap();

        let mode = StorageMode {
            compressed: true,
            imploded: false,
            encrypted: false,
            fix_key: false,
            single_unit: false,
            sector_crc: false,
        };

        let read = ReadHandle::open(
            &mut stream,
            mpq_pos,
            raw_offset,
            payload.len() as u32,
            payload.len() as u32,
            mode,
            512,
            None,
            false,
        )
        .unwrap();

        assert_eq!(
            read.sector_raw_position(table0),
            data_pos,
            "top-bit-set table entry must be reinterpreted relative to mpq_pos"
        );

        let sector = read.read_sector(&mut stream, 0).unwrap();
        assert_eq!(sector, payload);
    }
}
