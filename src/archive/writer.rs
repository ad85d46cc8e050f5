use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use super::index::{self, DEFAULT_FAN_OUT, MAX_FAN_OUT, MIN_FAN_OUT, TreeShape};
use super::structures::{ArchiveHeader, EntryDescriptor, IndexHeader};
use crate::codec::{self, DEFAULT_LEVEL, MAX_LEVEL};
use crate::error::{Error, Result};
use crate::io::{ByteSource, FileSource, MemorySource};

/// Entry count at which archives get a search tree by default
pub const DEFAULT_INDEX_THRESHOLD: usize = 64;

/// Tunables for [`Writer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// zlib compression level, 0..=9
    pub level: u32,
    /// Emit a search tree once the archive holds at least this many entries;
    /// `None` never emits one
    pub index_threshold: Option<usize>,
    /// Separator slots per tree node
    pub fan_out: u16,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            index_threshold: Some(DEFAULT_INDEX_THRESHOLD),
            fan_out: DEFAULT_FAN_OUT,
        }
    }
}

impl WriterOptions {
    pub fn level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn index_threshold(mut self, threshold: Option<usize>) -> Self {
        self.index_threshold = threshold;
        self
    }

    pub fn fan_out(mut self, fan_out: u16) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.level > MAX_LEVEL {
            return Err(Error::Usage(format!(
                "compression level {} outside 0..={MAX_LEVEL}",
                self.level
            )));
        }
        if !(MIN_FAN_OUT..=MAX_FAN_OUT).contains(&self.fan_out) {
            return Err(Error::Usage(format!(
                "fan-out {} outside {MIN_FAN_OUT}..={MAX_FAN_OUT}",
                self.fan_out
            )));
        }
        Ok(())
    }

    fn wants_index(&self, entries: usize) -> bool {
        self.index_threshold.is_some_and(|t| entries >= t)
    }
}

/// Where a pending entry's bytes come from.
#[derive(Debug)]
enum EntryData {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl EntryData {
    fn load(self) -> std::io::Result<Vec<u8>> {
        match self {
            EntryData::Bytes(data) => Ok(data),
            EntryData::File(path) => std::fs::read(path),
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    name: Vec<u8>,
    data: EntryData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Written,
}

/// Outcome of a successful [`Writer::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    /// Entries stored in the archive
    pub entries: u32,
    /// Entries skipped because their file could not be read
    pub dropped: usize,
    /// Whether a search tree was emitted
    pub indexed: bool,
    /// Size of the destination after writing
    pub archive_size: u64,
}

/// Collects named blobs and serializes them into an archive.
///
/// Entries are held in memory (or as file paths) until [`write`](Writer::write),
/// which compresses each payload and lays out the archive in two passes:
/// payloads first, then header, descriptor table, name table and search tree
/// once every compressed size is known. A writer is single-use.
///
/// Adding a name twice keeps both entries; lookups return the one added last.
#[derive(Debug)]
pub struct Writer {
    options: WriterOptions,
    pending: Vec<PendingEntry>,
    state: WriterState,
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer {
    pub fn new() -> Self {
        Self::with_options(WriterOptions::default())
    }

    pub fn with_options(options: WriterOptions) -> Self {
        Self {
            options,
            pending: Vec::new(),
            state: WriterState::Open,
        }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue `data` under `name`.
    pub fn add(&mut self, name: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) -> Result<()> {
        self.push(name.into(), EntryData::Bytes(data.into()))
    }

    /// Queue the contents of the file at `path` under `name`.
    ///
    /// The file is only read during [`write`](Writer::write); if it cannot be
    /// read then, the entry is dropped and the rest of the archive is still
    /// written.
    pub fn add_file(&mut self, name: impl Into<Vec<u8>>, path: impl Into<PathBuf>) -> Result<()> {
        self.push(name.into(), EntryData::File(path.into()))
    }

    fn push(&mut self, name: Vec<u8>, data: EntryData) -> Result<()> {
        self.ensure_open()?;
        if self.pending.len() >= u32::MAX as usize {
            return Err(Error::Usage("archive entry limit reached".into()));
        }
        self.pending.push(PendingEntry { name, data });
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Written => Err(Error::Usage("archive has already been written".into())),
        }
    }

    /// Serialize every pending entry into `dest`, which must be seekable and
    /// writable. Consumes the pending entries whether or not it succeeds.
    pub fn write<S: ByteSource>(&mut self, dest: &mut S) -> Result<WriteSummary> {
        self.ensure_open()?;
        self.options.validate()?;
        self.state = WriterState::Written;
        let pending = std::mem::take(&mut self.pending);

        // Room for the metadata of every pending entry; dropped entries leave
        // an unused gap before the payload region.
        let names_len: u64 = pending.iter().map(|e| e.name.len() as u64).sum();
        let reserved = metadata_len(
            pending.len() as u64,
            names_len,
            self.options.wants_index(pending.len()),
            self.options.fan_out,
        );

        dest.seek(SeekFrom::Start(reserved))?;
        let mut cursor = reserved;
        let mut dropped = 0;
        let mut stored: Vec<(Vec<u8>, EntryDescriptor)> = Vec::with_capacity(pending.len());

        for PendingEntry { name, data } in pending {
            let data = match data.load() {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        name = %String::from_utf8_lossy(&name),
                        error = %e,
                        "dropping unreadable entry"
                    );
                    dropped += 1;
                    continue;
                }
            };

            let compressed = codec::compress(&data, self.options.level)?;
            dest.write(&compressed)?;
            trace!(
                name = %String::from_utf8_lossy(&name),
                offset = cursor,
                size = data.len(),
                compressed = compressed.len(),
                "stored entry"
            );

            let descriptor = EntryDescriptor {
                name_offset: 0,
                name_len: name.len() as u64,
                payload_offset: cursor,
                compressed_len: compressed.len() as u64,
                uncompressed_len: data.len() as u64,
            };
            cursor += descriptor.compressed_len;
            stored.push((name, descriptor));
        }

        let mut name_table = Vec::with_capacity(names_len as usize);
        for (name, descriptor) in &mut stored {
            descriptor.name_offset = name_table.len() as u64;
            name_table.extend_from_slice(name);
        }

        let indexed = self.options.wants_index(stored.len());
        let mut header = ArchiveHeader {
            entry_count: stored.len() as u32,
            name_table_size: name_table.len() as u64,
            index: None,
        };
        let tree = if indexed {
            header.index = Some(IndexHeader {
                root_offset: 0,
                fan_out: self.options.fan_out,
                depth: 0,
            });
            let keys = stored
                .iter()
                .enumerate()
                .map(|(id, (name, _))| (index::name_key(name), id as u32))
                .collect();
            let (tree, index_header) =
                index::build_tree(keys, self.options.fan_out, header.name_table_end())?;
            header.index = Some(index_header);
            tree
        } else {
            Vec::new()
        };

        let mut metadata = Vec::with_capacity(reserved as usize);
        header.write_to(&mut metadata)?;
        for (_, descriptor) in &stored {
            descriptor.write_to(&mut metadata)?;
        }
        metadata.extend_from_slice(&name_table);
        metadata.extend_from_slice(&tree);
        debug_assert!(metadata.len() as u64 <= reserved);

        dest.seek(SeekFrom::Start(0))?;
        dest.write(&metadata)?;

        let summary = WriteSummary {
            entries: header.entry_count,
            dropped,
            indexed,
            archive_size: dest.size()?,
        };
        debug!(
            entries = summary.entries,
            dropped = summary.dropped,
            indexed = summary.indexed,
            size = summary.archive_size,
            "archive written"
        );
        Ok(summary)
    }

    /// Write the archive to a new file at `path`, replacing any existing file.
    pub fn write_file(&mut self, path: &Path) -> Result<WriteSummary> {
        self.ensure_open()?;
        let mut file = FileSource::create(path)?;
        let summary = self.write(&mut file)?;
        file.release()?;
        Ok(summary)
    }

    /// Write the archive to a sink that cannot seek.
    ///
    /// The whole archive is assembled in memory first.
    pub fn write_to<W: Write>(&mut self, mut sink: W) -> Result<WriteSummary> {
        let mut buffer = MemorySource::new();
        let summary = self.write(&mut buffer)?;
        sink.write_all(buffer.as_slice())?;
        sink.flush()?;
        Ok(summary)
    }

    /// Write the archive into a new byte vector.
    pub fn finalize_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut buffer = MemorySource::new();
        self.write(&mut buffer)?;
        Ok(buffer.into_inner())
    }
}

/// Bytes needed before the payload region for `entries` entries.
fn metadata_len(entries: u64, names_len: u64, indexed: bool, fan_out: u16) -> u64 {
    let (header, tree) = if indexed {
        (
            ArchiveHeader::INDEXED_SIZE as u64,
            TreeShape::new(entries, fan_out).region_len(fan_out),
        )
    } else {
        (ArchiveHeader::PLAIN_SIZE as u64, 0)
    };
    header + entries * EntryDescriptor::SIZE as u64 + names_len + tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Reader;
    use crate::archive::structures::PLAIN_SIGNATURE;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn empty_archive_is_just_a_header() -> Result<()> {
        let bytes = Writer::new().finalize_to_vec()?;
        assert_eq!(bytes.len(), ArchiveHeader::PLAIN_SIZE);
        let header = ArchiveHeader::from_bytes(&bytes)?;
        assert_eq!(header.entry_count, 0);
        assert_eq!(header.name_table_size, 0);
        assert_eq!(header.signature(), PLAIN_SIGNATURE);
        Ok(())
    }

    #[test]
    fn payloads_follow_the_name_table() -> Result<()> {
        let mut writer = Writer::new();
        writer.add("one", "first payload")?;
        writer.add("two", vec![7u8; 300])?;
        let bytes = writer.finalize_to_vec()?;

        let header = ArchiveHeader::from_bytes(&bytes)?;
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.name_table_size, 6);

        let table = &bytes[16..16 + 2 * EntryDescriptor::SIZE];
        let first = EntryDescriptor::from_bytes(&table[..40])?;
        let second = EntryDescriptor::from_bytes(&table[40..])?;
        assert_eq!((first.name_offset, first.name_len), (0, 3));
        assert_eq!((second.name_offset, second.name_len), (3, 3));
        assert_eq!(first.payload_offset, header.name_table_end());
        assert_eq!(
            second.payload_offset,
            first.payload_offset + first.compressed_len
        );
        assert_eq!(second.uncompressed_len, 300);
        assert_eq!(
            bytes.len() as u64,
            second.payload_offset + second.compressed_len
        );

        let names_at = header.name_table_offset() as usize;
        assert_eq!(&bytes[names_at..names_at + 6], b"onetwo");
        Ok(())
    }

    #[test]
    fn write_is_single_use() -> Result<()> {
        let mut writer = Writer::new();
        writer.add("a", "x")?;
        writer.finalize_to_vec()?;

        assert!(matches!(writer.add("b", "y"), Err(Error::Usage(_))));
        assert!(matches!(writer.finalize_to_vec(), Err(Error::Usage(_))));
        Ok(())
    }

    #[test]
    fn write_file_after_write_leaves_existing_file_alone() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("keep.barc");
        std::fs::write(&path, b"precious")?;

        let mut writer = Writer::new();
        writer.finalize_to_vec()?;
        assert!(writer.write_file(&path).is_err());
        assert_eq!(std::fs::read(&path)?, b"precious");
        Ok(())
    }

    #[test]
    fn unreadable_files_are_dropped() -> Result<()> {
        let dir = tempdir()?;
        let present = dir.path().join("present.txt");
        std::fs::write(&present, b"still here")?;

        let mut writer = Writer::new();
        writer.add_file("gone.txt", dir.path().join("gone.txt"))?;
        writer.add_file("present.txt", &present)?;
        writer.add("inline", "inline bytes")?;

        let mut dest = MemorySource::new();
        let summary = writer.write(&mut dest)?;
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.dropped, 1);

        let mut reader = Reader::open(dest)?;
        assert_eq!(reader.len(), 2);
        assert!(reader.find("gone.txt").unwrap_err().is_not_found());
        assert_eq!(reader.extract("present.txt")?, b"still here");
        assert_eq!(reader.extract("inline")?, b"inline bytes");
        Ok(())
    }

    #[test]
    fn index_emitted_at_threshold() -> Result<()> {
        let options = WriterOptions::default().index_threshold(Some(3)).fan_out(2);

        let mut below = Writer::with_options(options);
        below.add("a", "1")?;
        below.add("b", "2")?;
        let summary = below.write(&mut MemorySource::new())?;
        assert!(!summary.indexed);

        let mut at = Writer::with_options(options);
        for name in ["a", "b", "c"] {
            at.add(name, name)?;
        }
        let mut dest = MemorySource::new();
        let summary = at.write(&mut dest)?;
        assert!(summary.indexed);

        let header = ArchiveHeader::from_bytes(dest.as_slice())?;
        let index = header.index.expect("indexed header");
        assert_eq!(index.fan_out, 2);
        assert_eq!(index.depth, 1);
        Ok(())
    }

    #[test]
    fn incompressible_entries_at_every_level() -> Result<()> {
        let mut x = 0x9e37_79b9_7f4a_7c15u64;
        let noise: Vec<u8> = (0..200_000)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();

        for level in 0..=MAX_LEVEL {
            let mut writer = Writer::with_options(WriterOptions::default().level(level));
            writer.add("noise.bin", noise.clone())?;
            writer.add("hello.txt", "hello")?;
            let mut reader = Reader::from_bytes(writer.finalize_to_vec()?)?;

            assert_eq!(reader.len(), 2, "level {level}");
            assert_eq!(reader.extract("noise.bin")?, noise, "level {level}");
            assert_eq!(reader.extract("hello.txt")?, b"hello", "level {level}");
        }
        Ok(())
    }

    #[test]
    fn invalid_options_are_rejected_at_write() {
        let mut writer = Writer::with_options(WriterOptions::default().fan_out(1));
        assert!(matches!(writer.finalize_to_vec(), Err(Error::Usage(_))));

        let mut writer = Writer::with_options(WriterOptions::default().level(12));
        assert!(matches!(writer.finalize_to_vec(), Err(Error::Usage(_))));
    }

    #[test]
    fn seekless_sink_gets_identical_bytes() -> Result<()> {
        let build = || -> Result<Writer> {
            let mut writer = Writer::new();
            writer.add("a.txt", "hello")?;
            writer.add("b/c.bin", vec![0u8; 10_000])?;
            Ok(writer)
        };

        let expected = build()?.finalize_to_vec()?;
        let mut sink = Vec::new();
        let summary = build()?.write_to(&mut sink)?;
        assert_eq!(summary.archive_size, expected.len() as u64);
        assert_eq!(sink, expected);
        Ok(())
    }
}
