//! The backing-storage abstraction an archive session reads and writes through
//! (SPEC_FULL.md §6 `Stream`).

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// A seekable byte store. `FileStream` backs real archives; `MemoryStream` is used
/// by tests and by callers building archives entirely in memory before a flush.
pub trait Stream: Read + Write + Seek + Send {
    fn len(&mut self) -> io::Result<u64> {
        let current = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(current))?;
        Ok(end)
    }

    fn set_len(&mut self, size: u64) -> io::Result<()>;
}

/// A stream backed by a real file on disk.
pub struct FileStream {
    file: File,
}

impl FileStream {
    pub fn new(file: File) -> Self {
        FileStream { file }
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Stream for FileStream {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }
}

/// An in-memory stream, used by tests and for archives assembled before being
/// persisted to disk in one shot.
pub struct MemoryStream {
    cursor: Cursor<Vec<u8>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        MemoryStream {
            cursor: Cursor::new(Vec::new()),
        }
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        MemoryStream {
            cursor: Cursor::new(data),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.cursor.flush()
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl Stream for MemoryStream {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.cursor.get_mut().resize(size as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_round_trips() {
        let mut stream = MemoryStream::new();
        stream.write_all(b"hello world").unwrap();
        stream.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn memory_stream_reports_len() {
        let mut stream = MemoryStream::new();
        stream.write_all(b"0123456789").unwrap();
        assert_eq!(stream.len().unwrap(), 10);
        // len() must not disturb the current position
        stream.seek(SeekFrom::Start(3)).unwrap();
        assert_eq!(stream.len().unwrap(), 10);
        assert_eq!(stream.stream_position().unwrap(), 3);
    }

    #[test]
    fn set_len_truncates_or_extends() {
        let mut stream = MemoryStream::new();
        stream.write_all(b"0123456789").unwrap();
        stream.set_len(4).unwrap();
        assert_eq!(stream.into_inner(), b"0123");
    }
}
