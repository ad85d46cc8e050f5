use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

use super::index::{self, TreeIndex};
use super::structures::{ArchiveHeader, EntryDescriptor, truncated};
use crate::codec;
use crate::error::{Error, Result, alloc_zeroed};
use crate::io::{ByteSource, FileSource, MemorySource};

/// Position of an entry within one open archive.
///
/// Only meaningful for the archive it was obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u32);

impl EntryId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Metadata of one entry as yielded by [`Catalog::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo<'a> {
    pub id: EntryId,
    pub name: &'a [u8],
    pub size: u64,
    pub compressed_size: u64,
}

impl<'a> EntryInfo<'a> {
    /// Name with invalid UTF-8 replaced
    pub fn name_lossy(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.name)
    }
}

/// Tables of an open archive, fully validated and immutable after loading.
///
/// A catalog can be shared between threads; each [`Reader`] built on it
/// brings its own source.
#[derive(Debug, Clone)]
pub struct Catalog {
    header: ArchiveHeader,
    descriptors: Vec<EntryDescriptor>,
    names: Vec<u8>,
    index: Option<TreeIndex>,
    archive_size: u64,
}

impl Catalog {
    /// Read and validate header, descriptor table, name table and tree
    /// header from `source`.
    ///
    /// Every declared size is checked against the size of the source before
    /// anything is allocated for it.
    pub fn load<S: ByteSource>(source: &mut S) -> Result<Self> {
        let archive_size = source.size()?;

        let mut fixed = [0u8; ArchiveHeader::INDEXED_SIZE];
        let n = source.read_full_at(0, &mut fixed[..4])?;
        if n < 4 {
            return Err(truncated("header", 4, n as u64));
        }
        let signature = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
        let header_size = ArchiveHeader::size_for_signature(signature)?;
        let n = 4 + source.read_full(&mut fixed[4..header_size])?;
        if n < header_size {
            return Err(truncated("header", header_size as u64, n as u64));
        }
        let header = ArchiveHeader::from_bytes(&fixed[..header_size])?;

        let count = header.entry_count;
        let table_len = u64::from(count) * EntryDescriptor::SIZE as u64;
        let available = archive_size.saturating_sub(header.table_offset());
        if table_len > available {
            return Err(truncated("entry table", table_len, available));
        }
        let available = available - table_len;
        if header.name_table_size > available {
            return Err(truncated("name table", header.name_table_size, available));
        }

        let mut table = alloc_zeroed(table_len)?;
        let n = source.read_full_at(header.table_offset(), &mut table)?;
        if (n as u64) < table_len {
            return Err(truncated("entry table", table_len, n as u64));
        }

        let mut descriptors = Vec::new();
        descriptors
            .try_reserve_exact(count as usize)
            .map_err(|_| Error::Allocation { bytes: table_len })?;
        for (i, raw) in table.chunks_exact(EntryDescriptor::SIZE).enumerate() {
            let descriptor = EntryDescriptor::from_bytes(raw)?;
            descriptor.validate(i as u32, header.name_table_size, archive_size)?;
            descriptors.push(descriptor);
        }
        drop(table);

        let mut names = alloc_zeroed(header.name_table_size)?;
        let n = source.read_full_at(header.name_table_offset(), &mut names)?;
        if (n as u64) < header.name_table_size {
            return Err(truncated("name table", header.name_table_size, n as u64));
        }

        let index = header
            .index
            .map(|ih| TreeIndex::from_header(&ih, count, header.name_table_end(), archive_size))
            .transpose()?;

        debug!(
            entries = count,
            indexed = index.is_some(),
            archive_size,
            "loaded archive catalog"
        );

        Ok(Self {
            header,
            descriptors,
            names,
            index,
            archive_size,
        })
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    /// Size of the source the catalog was loaded from
    pub fn archive_size(&self) -> u64 {
        self.archive_size
    }

    pub fn descriptor(&self, id: EntryId) -> Result<&EntryDescriptor> {
        self.descriptors.get(id.0 as usize).ok_or_else(|| {
            Error::Usage(format!(
                "entry {id} out of range for archive with {} entries",
                self.descriptors.len()
            ))
        })
    }

    pub fn name(&self, id: EntryId) -> Result<&[u8]> {
        self.descriptor(id)?;
        Ok(self.name_at(id.0 as usize))
    }

    // Descriptor ranges were validated on load.
    fn name_at(&self, i: usize) -> &[u8] {
        let d = &self.descriptors[i];
        let start = d.name_offset as usize;
        &self.names[start..start + d.name_len as usize]
    }

    fn name_matches(&self, i: usize, name: &[u8]) -> bool {
        self.descriptors
            .get(i)
            .is_some_and(|d| d.name_len == name.len() as u64 && self.name_at(i) == name)
    }

    /// Resolve `name` without touching the tree, newest entry first.
    pub fn find_linear(&self, name: &[u8]) -> Option<EntryId> {
        (0..self.descriptors.len())
            .rev()
            .find(|&i| self.name_matches(i, name))
            .map(|i| EntryId(i as u32))
    }

    pub fn entries(&self) -> impl Iterator<Item = EntryInfo<'_>> + '_ {
        self.descriptors.iter().enumerate().map(|(i, d)| EntryInfo {
            id: EntryId(i as u32),
            name: self.name_at(i),
            size: d.uncompressed_len,
            compressed_size: d.compressed_len,
        })
    }
}

/// Random-access reader over an archive.
///
/// Opening loads and validates the tables once; each [`read`](Reader::read)
/// then costs a single seek and a single payload read.
#[derive(Debug)]
pub struct Reader<S: ByteSource> {
    source: S,
    catalog: Arc<Catalog>,
}

impl Reader<FileSource> {
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(FileSource::open(path.as_ref())?)
    }
}

impl Reader<MemorySource> {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::open(MemorySource::from_vec(bytes))
    }
}

impl<S: ByteSource> Reader<S> {
    /// Validate the archive in `source` and load its tables.
    pub fn open(mut source: S) -> Result<Self> {
        let catalog = Catalog::load(&mut source)?;
        Ok(Self {
            source,
            catalog: Arc::new(catalog),
        })
    }

    /// Another reader over a copy of the same archive bytes, sharing this
    /// reader's catalog instead of loading it again.
    pub fn with_source<T: ByteSource>(&self, source: T) -> Reader<T> {
        Reader {
            source,
            catalog: Arc::clone(&self.catalog),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// Resolve an entry by exact name. With duplicate names the entry added
    /// last wins.
    pub fn find(&mut self, name: impl AsRef<[u8]>) -> Result<EntryId> {
        let name = name.as_ref();
        let Self { source, catalog } = self;

        let found = match &catalog.index {
            Some(tree) => tree
                .find(source, index::name_key(name), |id| {
                    catalog.name_matches(id as usize, name)
                })?
                .map(EntryId),
            None => catalog.find_linear(name),
        };

        found.ok_or_else(|| Error::EntryNotFound(String::from_utf8_lossy(name).into_owned()))
    }

    pub fn entry_name(&self, id: EntryId) -> Result<&[u8]> {
        self.catalog.name(id)
    }

    /// Uncompressed size of an entry
    pub fn entry_size(&self, id: EntryId) -> Result<u64> {
        Ok(self.catalog.descriptor(id)?.uncompressed_len)
    }

    pub fn compressed_size(&self, id: EntryId) -> Result<u64> {
        Ok(self.catalog.descriptor(id)?.compressed_len)
    }

    pub fn entries(&self) -> impl Iterator<Item = EntryInfo<'_>> + '_ {
        self.catalog.entries()
    }

    /// Decompress an entry into `buf`, which must be exactly
    /// [`entry_size`](Reader::entry_size) bytes long.
    pub fn read(&mut self, id: EntryId, buf: &mut [u8]) -> Result<()> {
        let desc = *self.catalog.descriptor(id)?;
        if buf.len() as u64 != desc.uncompressed_len {
            return Err(Error::Usage(format!(
                "buffer of {} bytes for entry {id} of {} bytes",
                buf.len(),
                desc.uncompressed_len
            )));
        }

        let mut compressed = alloc_zeroed(desc.compressed_len)?;
        let n = self.source.read_full_at(desc.payload_offset, &mut compressed)?;
        if (n as u64) < desc.compressed_len {
            return Err(truncated("payload", desc.compressed_len, n as u64));
        }
        codec::decompress(&compressed, buf)?;

        trace!(
            %id,
            offset = desc.payload_offset,
            size = desc.uncompressed_len,
            "read entry"
        );
        Ok(())
    }

    pub fn read_to_vec(&mut self, id: EntryId) -> Result<Vec<u8>> {
        let mut buf = alloc_zeroed(self.entry_size(id)?)?;
        self.read(id, &mut buf)?;
        Ok(buf)
    }

    /// Names and uncompressed sizes of every entry, in storage order.
    pub fn list(&self) -> Vec<(String, u64)> {
        self.entries()
            .map(|e| (e.name_lossy().into_owned(), e.size))
            .collect()
    }

    /// Find and decompress an entry by name.
    pub fn extract(&mut self, name: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let id = self.find(name)?;
        self.read_to_vec(id)
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Release the underlying source.
    pub fn close(self) -> Result<()> {
        self.source.release()?;
        Ok(())
    }
}
