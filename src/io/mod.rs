mod file;
mod memory;

pub use file::FileSource;
pub use memory::MemorySource;

use std::io::{self, SeekFrom};

mod private {
    pub trait Sealed {}
}

/// Seekable, readable and optionally writable byte sequence.
///
/// The archive engine only ever touches storage through this trait. It is
/// sealed: the two implementations are [`FileSource`] and [`MemorySource`].
pub trait ByteSource: private::Sealed {
    /// Move the cursor, returning the new absolute position.
    ///
    /// Fails if the resulting position would be negative.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Current cursor position
    fn tell(&mut self) -> io::Result<u64>;

    /// Read up to `buf.len()` bytes, returning the number transferred (0 at end of data).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` at the cursor or fail without reporting a partial write.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Total length of the source in bytes
    fn size(&mut self) -> io::Result<u64>;

    /// Flush and release the underlying storage.
    fn release(self) -> io::Result<()>
    where
        Self: Sized;

    /// Read until `buf` is full or the source is exhausted.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Seek to `offset` and [`read_full`](ByteSource::read_full) into `buf`.
    fn read_full_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_full(buf)
    }
}

impl<T: ByteSource> ByteSource for &mut T {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        (**self).seek(pos)
    }

    fn tell(&mut self) -> io::Result<u64> {
        (**self).tell()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        (**self).size()
    }

    // Releasing a borrow leaves the owner responsible for the source.
    fn release(self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: ByteSource> private::Sealed for &mut T {}

/// Resolve a [`SeekFrom`] against the current position and length.
fn resolve_seek(pos: SeekFrom, current: u64, len: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => len.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek to a negative or overflowing position",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_seek_variants() {
        assert_eq!(resolve_seek(SeekFrom::Start(7), 3, 10).unwrap(), 7);
        assert_eq!(resolve_seek(SeekFrom::Current(-3), 3, 10).unwrap(), 0);
        assert_eq!(resolve_seek(SeekFrom::End(5), 3, 10).unwrap(), 15);
        assert_eq!(resolve_seek(SeekFrom::End(-10), 3, 10).unwrap(), 0);
    }

    #[test]
    fn resolve_seek_rejects_negative() {
        let err = resolve_seek(SeekFrom::Current(-4), 3, 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(resolve_seek(SeekFrom::End(-11), 0, 10).is_err());
    }
}
