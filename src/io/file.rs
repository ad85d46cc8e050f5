use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{ByteSource, private, resolve_seek};

/// File-backed byte source.
///
/// Read-only sources refuse to seek past the end of the file. Writable
/// sources allow it and rely on the filesystem to zero-fill the gap.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    writable: bool,
}

impl FileSource {
    /// Open an existing file for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            writable: false,
        })
    }

    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    /// Wrap an already opened file. `writable` must reflect how it was opened.
    pub fn from_file(file: File, writable: bool) -> Self {
        Self { file, writable }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl private::Sealed for FileSource {}

impl ByteSource for FileSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let current = self.file.stream_position()?;
        let len = self.file.metadata()?.len();
        let target = resolve_seek(pos, current, len)?;
        if target > len && !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target} beyond end of read-only file ({len} bytes)"),
            ));
        }
        self.file.seek(SeekFrom::Start(target))
    }

    fn tell(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file source is read-only",
            ));
        }
        self.file.write_all(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn release(mut self) -> io::Result<()> {
        if self.writable {
            self.file.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}
