//! Archive format, reading and writing.
//!
//! ## Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! offset 0         header            16 bytes ("BAv1") or 32 bytes ("BAi1")
//! header end       descriptor table  entry_count x 40 bytes
//! table end        name table        name_table_size bytes, names unterminated
//! names end        search tree       indexed archives only
//! (anywhere after) payloads          one zlib stream per entry
//! ```
//!
//! Descriptors hold absolute payload offsets, so payloads may sit after a gap.
//! The reader validates every declared size against the source before
//! allocating, and every descriptor range before trusting it.
//!
//! - [`structures`]: fixed-size records and their encoding
//! - [`index`]: name hashing and the on-disk search tree
//! - [`reader`]: opening and random access
//! - [`writer`]: two-pass serialization

pub mod index;
pub mod structures;

mod reader;
mod writer;

pub use reader::{Catalog, EntryId, EntryInfo, Reader};
pub use structures::{ArchiveHeader, EntryDescriptor, IndexHeader};
pub use writer::{DEFAULT_INDEX_THRESHOLD, WriteSummary, Writer, WriterOptions};
