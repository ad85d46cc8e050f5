//! # barc
//!
//! A compressed archive format with random access to individual entries.
//!
//! An archive stores named binary blobs, each compressed independently with
//! zlib, behind a small header and a table of fixed-size descriptors. Any
//! entry can be located and decompressed without touching the others. Large
//! archives also carry an on-disk search tree so a lookup reads a handful of
//! nodes instead of scanning every name.
//!
//! ## Features
//!
//! - Random access: one seek and one read per extracted entry
//! - Optional hashed search tree for archives with many entries
//! - Strict validation of untrusted input before anything is allocated
//! - File-backed and in-memory byte sources
//!
//! ## Example
//!
//! ```
//! use barc::{Reader, Writer};
//!
//! fn main() -> barc::Result<()> {
//!     let mut writer = Writer::new();
//!     writer.add("a.txt", "hello")?;
//!     writer.add("b/c.bin", vec![0u8; 10_000])?;
//!     let bytes = writer.finalize_to_vec()?;
//!
//!     let mut reader = Reader::from_bytes(bytes)?;
//!     let id = reader.find("b/c.bin")?;
//!     assert_eq!(reader.entry_size(id)?, 10_000);
//!     assert_eq!(reader.extract("a.txt")?, b"hello");
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod cli;
pub mod codec;
pub mod error;
pub mod io;

pub use archive::{
    Catalog, EntryId, EntryInfo, Reader, WriteSummary, Writer, WriterOptions,
};
pub use cli::Cli;
pub use error::{Error, FormatError, Result};
pub use io::{ByteSource, FileSource, MemorySource};
