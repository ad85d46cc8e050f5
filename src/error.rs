//! Error types for archive reading and writing.

use thiserror::Error;

/// Result type for archive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Archive error types
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying byte source could not be opened, read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The input is not a well-formed archive
    #[error("invalid archive: {0}")]
    InvalidFormat(#[from] FormatError),

    /// No entry carries the requested name
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// The compressor or decompressor rejected its input
    #[error("compression failed: {0}")]
    Compression(String),

    /// A table, name table or scratch buffer could not be allocated
    #[error("failed to allocate {bytes} bytes")]
    Allocation { bytes: u64 },

    /// An operation was called out of order or with bad arguments
    #[error("usage error: {0}")]
    Usage(String),
}

/// Reasons an archive is rejected while being opened or traversed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad signature {found:#010x}")]
    BadSignature { found: u32 },

    #[error("truncated {section}: expected {expected} bytes, got {actual}")]
    Truncated {
        section: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("entry {index}: name range {offset}+{len} exceeds name table of {table_size} bytes")]
    NameOutOfBounds {
        index: u32,
        offset: u64,
        len: u64,
        table_size: u64,
    },

    #[error("entry {index}: payload range {offset}+{len} exceeds archive size {archive_size}")]
    PayloadOutOfBounds {
        index: u32,
        offset: u64,
        len: u64,
        archive_size: u64,
    },

    #[error("entry {index}: {uncompressed} bytes cannot inflate from {compressed} compressed bytes")]
    ImplausibleSize {
        index: u32,
        compressed: u64,
        uncompressed: u64,
    },

    #[error("unsupported index fan-out {0}")]
    BadFanOut(u16),

    #[error("index depth {found} does not match {expected} for this entry count")]
    BadDepth { expected: u16, found: u16 },

    #[error("index node offset {offset} outside region {start}..{end}")]
    NodeOutOfBounds { offset: u64, start: u64, end: u64 },

    #[error("index leaf references entry {id}, archive has {count}")]
    BadEntryRef { id: u64, count: u32 },

    #[error("index walk visited more than {limit} nodes")]
    IndexCycle { limit: u64 },
}

impl Error {
    /// Returns `true` for errors caused by malformed archive bytes.
    pub fn is_invalid_format(&self) -> bool {
        matches!(self, Error::InvalidFormat(_))
    }

    /// Returns `true` when a lookup found no matching entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::EntryNotFound(_))
    }
}

/// Allocate a zero-filled buffer of `len` bytes, reporting failure instead of aborting.
pub(crate) fn alloc_zeroed(len: u64) -> Result<Vec<u8>> {
    let size = usize::try_from(len).map_err(|_| Error::Allocation { bytes: len })?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| Error::Allocation { bytes: len })?;
    buf.resize(size, 0);
    Ok(buf)
}
