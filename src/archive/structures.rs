use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

use crate::error::{FormatError, Result};

/// Signature of an archive resolved by linear scan (`"BAv1"`)
pub const PLAIN_SIGNATURE: u32 = u32::from_le_bytes(*b"BAv1");

/// Signature of an archive carrying an on-disk search tree (`"BAi1"`)
pub const INDEXED_SIGNATURE: u32 = u32::from_le_bytes(*b"BAi1");

/// Location and shape of the on-disk search tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    /// Absolute offset of the root node, 0 when the archive is empty
    pub root_offset: u64,
    /// Separator slots per node
    pub fan_out: u16,
    /// Internal levels above the leaves
    pub depth: u16,
}

/// Fixed record at offset 0 of every archive.
///
/// Plain archives use a 16-byte header; indexed ones append 16 bytes
/// describing the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub entry_count: u32,
    pub name_table_size: u64,
    pub index: Option<IndexHeader>,
}

impl ArchiveHeader {
    pub const PLAIN_SIZE: usize = 16;
    pub const INDEXED_SIZE: usize = 32;

    pub fn signature(&self) -> u32 {
        if self.index.is_some() {
            INDEXED_SIGNATURE
        } else {
            PLAIN_SIGNATURE
        }
    }

    /// Encoded size of this header
    pub fn size(&self) -> usize {
        if self.index.is_some() {
            Self::INDEXED_SIZE
        } else {
            Self::PLAIN_SIZE
        }
    }

    /// Header size implied by a signature, rejecting anything unknown.
    pub fn size_for_signature(signature: u32) -> Result<usize> {
        match signature {
            PLAIN_SIGNATURE => Ok(Self::PLAIN_SIZE),
            INDEXED_SIGNATURE => Ok(Self::INDEXED_SIZE),
            found => Err(FormatError::BadSignature { found }.into()),
        }
    }

    /// Parse a header. `data` must hold at least the size implied by its signature.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(truncated("header", 4, data.len() as u64));
        }
        let signature = LittleEndian::read_u32(&data[0..4]);
        let size = Self::size_for_signature(signature)?;
        if data.len() < size {
            return Err(truncated("header", size as u64, data.len() as u64));
        }

        let mut cursor = Cursor::new(&data[4..size]);
        let entry_count = cursor.read_u32::<LittleEndian>()?;
        let name_table_size = cursor.read_u64::<LittleEndian>()?;
        let index = if signature == INDEXED_SIGNATURE {
            let root_offset = cursor.read_u64::<LittleEndian>()?;
            let fan_out = cursor.read_u16::<LittleEndian>()?;
            let depth = cursor.read_u16::<LittleEndian>()?;
            let _reserved = cursor.read_u32::<LittleEndian>()?;
            Some(IndexHeader {
                root_offset,
                fan_out,
                depth,
            })
        } else {
            None
        };

        Ok(Self {
            entry_count,
            name_table_size,
            index,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.signature())?;
        w.write_u32::<LittleEndian>(self.entry_count)?;
        w.write_u64::<LittleEndian>(self.name_table_size)?;
        if let Some(index) = &self.index {
            w.write_u64::<LittleEndian>(index.root_offset)?;
            w.write_u16::<LittleEndian>(index.fan_out)?;
            w.write_u16::<LittleEndian>(index.depth)?;
            w.write_u32::<LittleEndian>(0)?;
        }
        Ok(())
    }

    /// Offset of the first descriptor
    pub fn table_offset(&self) -> u64 {
        self.size() as u64
    }

    /// Offset of the name table, directly after the descriptor table
    pub fn name_table_offset(&self) -> u64 {
        self.table_offset() + u64::from(self.entry_count) * EntryDescriptor::SIZE as u64
    }

    /// Offset just past the name table, where the index region (if any) begins
    pub fn name_table_end(&self) -> u64 {
        self.name_table_offset().saturating_add(self.name_table_size)
    }
}

/// Upper bound on DEFLATE's expansion ratio, used to reject corrupt sizes
/// before an output buffer is allocated.
pub const MAX_INFLATE_RATIO: u64 = 1032;

/// Per-entry metadata record, 40 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryDescriptor {
    pub name_offset: u64,
    pub name_len: u64,
    /// Absolute offset of the compressed payload
    pub payload_offset: u64,
    pub compressed_len: u64,
    pub uncompressed_len: u64,
}

impl EntryDescriptor {
    pub const SIZE: usize = 40;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(truncated(
                "entry descriptor",
                Self::SIZE as u64,
                data.len() as u64,
            ));
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            name_offset: cursor.read_u64::<LittleEndian>()?,
            name_len: cursor.read_u64::<LittleEndian>()?,
            payload_offset: cursor.read_u64::<LittleEndian>()?,
            compressed_len: cursor.read_u64::<LittleEndian>()?,
            uncompressed_len: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.name_offset)?;
        w.write_u64::<LittleEndian>(self.name_len)?;
        w.write_u64::<LittleEndian>(self.payload_offset)?;
        w.write_u64::<LittleEndian>(self.compressed_len)?;
        w.write_u64::<LittleEndian>(self.uncompressed_len)?;
        Ok(())
    }

    /// Check the name and payload ranges against the table and archive sizes,
    /// and the uncompressed size against what the payload could inflate to.
    pub fn validate(&self, index: u32, name_table_size: u64, archive_size: u64) -> Result<()> {
        let name_end = self.name_offset.checked_add(self.name_len);
        if name_end.is_none_or(|end| end > name_table_size) {
            return Err(FormatError::NameOutOfBounds {
                index,
                offset: self.name_offset,
                len: self.name_len,
                table_size: name_table_size,
            }
            .into());
        }

        let payload_end = self.payload_offset.checked_add(self.compressed_len);
        if payload_end.is_none_or(|end| end > archive_size) {
            return Err(FormatError::PayloadOutOfBounds {
                index,
                offset: self.payload_offset,
                len: self.compressed_len,
                archive_size,
            }
            .into());
        }

        let inflate_limit = self.compressed_len.saturating_mul(MAX_INFLATE_RATIO);
        if self.uncompressed_len > inflate_limit {
            return Err(FormatError::ImplausibleSize {
                index,
                compressed: self.compressed_len,
                uncompressed: self.uncompressed_len,
            }
            .into());
        }
        Ok(())
    }
}

pub(crate) fn truncated(section: &'static str, expected: u64, actual: u64) -> crate::Error {
    FormatError::Truncated {
        section,
        expected,
        actual,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use pretty_assertions::assert_eq;

    fn encode(header: &ArchiveHeader) -> Vec<u8> {
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn plain_header_layout() {
        let header = ArchiveHeader {
            entry_count: 3,
            name_table_size: 21,
            index: None,
        };
        let bytes = encode(&header);
        assert_eq!(bytes.len(), ArchiveHeader::PLAIN_SIZE);
        assert_eq!(&bytes[0..4], b"BAv1");
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &21u64.to_le_bytes());
        assert_eq!(ArchiveHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.name_table_offset(), 16 + 3 * 40);
        assert_eq!(header.name_table_end(), 16 + 3 * 40 + 21);
    }

    #[test]
    fn indexed_header_layout() {
        let header = ArchiveHeader {
            entry_count: 100,
            name_table_size: 900,
            index: Some(IndexHeader {
                root_offset: 12_345,
                fan_out: 16,
                depth: 2,
            }),
        };
        let bytes = encode(&header);
        assert_eq!(bytes.len(), ArchiveHeader::INDEXED_SIZE);
        assert_eq!(&bytes[0..4], b"BAi1");
        assert_eq!(ArchiveHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.table_offset(), 32);
    }

    #[test]
    fn signatures_differ_in_more_than_one_bit() {
        assert!((PLAIN_SIGNATURE ^ INDEXED_SIGNATURE).count_ones() > 1);
    }

    #[test]
    fn unknown_signature_rejected() {
        let mut bytes = encode(&ArchiveHeader {
            entry_count: 0,
            name_table_size: 0,
            index: None,
        });
        bytes[0] ^= 0x01;
        let err = ArchiveHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFormat(FormatError::BadSignature { .. })
        ));
    }

    #[test]
    fn short_indexed_header_rejected() {
        let bytes = encode(&ArchiveHeader {
            entry_count: 1,
            name_table_size: 1,
            index: Some(IndexHeader {
                root_offset: 80,
                fan_out: 4,
                depth: 0,
            }),
        });
        let err = ArchiveHeader::from_bytes(&bytes[..20]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFormat(FormatError::Truncated { section: "header", .. })
        ));
    }

    #[test]
    fn descriptor_round_trip_and_validation() {
        let desc = EntryDescriptor {
            name_offset: 5,
            name_len: 7,
            payload_offset: 200,
            compressed_len: 13,
            uncompressed_len: 40,
        };
        let mut bytes = Vec::new();
        desc.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), EntryDescriptor::SIZE);
        assert_eq!(EntryDescriptor::from_bytes(&bytes).unwrap(), desc);

        assert!(desc.validate(0, 12, 213).is_ok());
        assert!(matches!(
            desc.validate(0, 11, 213),
            Err(Error::InvalidFormat(FormatError::NameOutOfBounds { .. }))
        ));
        assert!(matches!(
            desc.validate(0, 12, 212),
            Err(Error::InvalidFormat(FormatError::PayloadOutOfBounds { .. }))
        ));
    }

    #[test]
    fn descriptor_with_impossible_ratio_rejected() {
        let desc = EntryDescriptor {
            payload_offset: 100,
            compressed_len: 10,
            uncompressed_len: 10 * MAX_INFLATE_RATIO + 1,
            ..Default::default()
        };
        assert!(matches!(
            desc.validate(3, 0, 1000),
            Err(Error::InvalidFormat(FormatError::ImplausibleSize { index: 3, .. }))
        ));
        let desc = EntryDescriptor {
            uncompressed_len: 10 * MAX_INFLATE_RATIO,
            ..desc
        };
        assert!(desc.validate(3, 0, 1000).is_ok());
    }

    #[test]
    fn descriptor_overflowing_ranges_rejected() {
        let desc = EntryDescriptor {
            name_offset: u64::MAX,
            name_len: 2,
            ..Default::default()
        };
        assert!(desc.validate(0, u64::MAX, u64::MAX).is_err());
    }
}
