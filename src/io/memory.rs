use std::io::{self, SeekFrom};

use super::{ByteSource, private, resolve_seek};

/// Growable in-memory byte source.
///
/// Seeking past the end zero-extends the buffer immediately, so the cursor
/// never points beyond [`size`](ByteSource::size).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes; the cursor starts at offset 0.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Grow the buffer with zeroes up to `len` bytes.
    fn extend_to(&mut self, len: usize) -> io::Result<()> {
        if len > self.data.len() {
            self.data
                .try_reserve(len - self.data.len())
                .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
            self.data.resize(len, 0);
        }
        Ok(())
    }
}

impl From<Vec<u8>> for MemorySource {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl private::Sealed for MemorySource {}

impl ByteSource for MemorySource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = resolve_seek(pos, self.pos as u64, self.data.len() as u64)?;
        let target = usize::try_from(target)
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "seek beyond address space"))?;
        self.extend_to(target)?;
        self.pos = target;
        Ok(target as u64)
    }

    fn tell(&mut self) -> io::Result<u64> {
        Ok(self.pos as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = &self.data[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let end = self
            .pos
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "write beyond address space"))?;
        self.extend_to(end)?;
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn release(self) -> io::Result<()> {
        Ok(())
    }
}
