//! Name-to-entry lookup.
//!
//! Small archives are resolved by a linear scan of the descriptor table.
//! Larger ones also carry an on-disk search tree keyed by a 64-bit hash of
//! the entry name:
//!
//! ```text
//! node    := slot[fan_out] trailing_ptr(u64)
//! slot    := child_ptr(u64) key(u64)          key 0 marks an unused slot
//! leaf    := slots hold (entry id, name key), trailing_ptr = next leaf or 0
//! inner   := slots hold (child offset, separator), trailing_ptr = last child
//! ```
//!
//! Leaves are written first, then each internal level, root last. A
//! separator is one more than the largest key stored under its child, so
//! descent takes the first slot whose separator is greater than the query.
//! Keys may collide; every candidate is confirmed against the name bytes.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::ops::Range;
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use super::structures::{IndexHeader, truncated};
use crate::error::{Error, FormatError, Result, alloc_zeroed};
use crate::io::ByteSource;

pub const MIN_FAN_OUT: u16 = 2;
pub const MAX_FAN_OUT: u16 = 1024;
pub const DEFAULT_FAN_OUT: u16 = 16;

const SLOT_SIZE: u64 = 16;

/// Hash key of an entry name: xxh3-64, halved so separators cannot overflow,
/// and never 0.
pub fn name_key(name: &[u8]) -> u64 {
    (xxh3_64(name) >> 1).max(1)
}

/// Encoded size of one tree node
pub fn node_size(fan_out: u16) -> u64 {
    u64::from(fan_out) * SLOT_SIZE + 8
}

/// Node count of every tree level for a given entry count, leaves first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeShape {
    levels: Vec<u64>,
}

impl TreeShape {
    pub fn new(entries: u64, fan_out: u16) -> Self {
        let mut levels = Vec::new();
        if entries > 0 {
            let mut nodes = entries.div_ceil(u64::from(fan_out));
            levels.push(nodes);
            while nodes > 1 {
                nodes = nodes.div_ceil(u64::from(fan_out) + 1);
                levels.push(nodes);
            }
        }
        Self { levels }
    }

    /// Internal levels above the leaves
    pub fn depth(&self) -> u16 {
        self.levels.len().saturating_sub(1) as u16
    }

    pub fn node_count(&self) -> u64 {
        self.levels.iter().sum()
    }

    /// Bytes occupied by the whole tree
    pub fn region_len(&self, fan_out: u16) -> u64 {
        self.node_count() * node_size(fan_out)
    }
}

/// Serialize the search tree for `keys` (`(name key, entry id)` pairs) as it
/// will sit at `region_start`.
///
/// Equal keys are ordered by descending id so the most recently added of
/// several same-named entries is met first.
pub fn build_tree(
    mut keys: Vec<(u64, u32)>,
    fan_out: u16,
    region_start: u64,
) -> Result<(Vec<u8>, IndexHeader)> {
    keys.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let shape = TreeShape::new(keys.len() as u64, fan_out);
    let node_len = node_size(fan_out);
    let region_len = shape.region_len(fan_out);
    let mut out = Vec::new();
    out.try_reserve_exact(region_len as usize)
        .map_err(|_| Error::Allocation { bytes: region_len })?;

    // (node offset, largest key below it)
    let mut level: Vec<(u64, u64)> = Vec::new();
    let leaves: Vec<&[(u64, u32)]> = keys.chunks(usize::from(fan_out)).collect();
    for (i, leaf) in leaves.iter().enumerate() {
        let offset = region_start + i as u64 * node_len;
        let next = if i + 1 < leaves.len() {
            offset + node_len
        } else {
            0
        };
        write_node(
            &mut out,
            fan_out,
            leaf.iter().map(|&(key, id)| (u64::from(id), key)),
            next,
        )?;
        if let Some(&(max_key, _)) = leaf.last() {
            level.push((offset, max_key));
        }
    }

    let mut next_offset = region_start + leaves.len() as u64 * node_len;
    while level.len() > 1 {
        let mut parents = Vec::with_capacity(level.len().div_ceil(usize::from(fan_out) + 1));
        for group in level.chunks(usize::from(fan_out) + 1) {
            if let Some((&(last_child, max_key), rest)) = group.split_last() {
                write_node(
                    &mut out,
                    fan_out,
                    rest.iter().map(|&(child, max)| (child, max + 1)),
                    last_child,
                )?;
                parents.push((next_offset, max_key));
                next_offset += node_len;
            }
        }
        level = parents;
    }

    let root_offset = level.first().map_or(0, |&(offset, _)| offset);
    trace!(
        nodes = shape.node_count(),
        depth = shape.depth(),
        root_offset,
        "built search tree"
    );
    Ok((
        out,
        IndexHeader {
            root_offset,
            fan_out,
            depth: shape.depth(),
        },
    ))
}

fn write_node(
    out: &mut Vec<u8>,
    fan_out: u16,
    slots: impl Iterator<Item = (u64, u64)>,
    trailing: u64,
) -> Result<()> {
    let mut used = 0;
    for (ptr, key) in slots {
        out.write_u64::<LittleEndian>(ptr)?;
        out.write_u64::<LittleEndian>(key)?;
        used += 1;
    }
    for _ in used..fan_out {
        out.write_u64::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(0)?;
    }
    out.write_u64::<LittleEndian>(trailing)?;
    Ok(())
}

/// Validated on-disk search tree of an open archive.
///
/// Every node offset is checked against the tree region before it is read,
/// and a walk visiting more nodes than the region holds is treated as a
/// cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeIndex {
    root: u64,
    fan_out: u16,
    depth: u16,
    region: Range<u64>,
    node_count: u64,
    entry_count: u32,
}

impl TreeIndex {
    pub fn from_header(
        header: &IndexHeader,
        entry_count: u32,
        region_start: u64,
        archive_size: u64,
    ) -> Result<Self> {
        if !(MIN_FAN_OUT..=MAX_FAN_OUT).contains(&header.fan_out) {
            return Err(FormatError::BadFanOut(header.fan_out).into());
        }

        let shape = TreeShape::new(u64::from(entry_count), header.fan_out);
        if header.depth != shape.depth() {
            return Err(FormatError::BadDepth {
                expected: shape.depth(),
                found: header.depth,
            }
            .into());
        }

        let region_len = shape.region_len(header.fan_out);
        let available = archive_size.saturating_sub(region_start);
        if region_len > available {
            return Err(truncated("index", region_len, available));
        }

        let index = Self {
            root: header.root_offset,
            fan_out: header.fan_out,
            depth: header.depth,
            region: region_start..region_start + region_len,
            node_count: shape.node_count(),
            entry_count,
        };
        if entry_count > 0 || index.root != 0 {
            index.check_node(index.root)?;
        }
        Ok(index)
    }

    pub fn region(&self) -> Range<u64> {
        self.region.clone()
    }

    fn check_node(&self, offset: u64) -> Result<()> {
        let aligned = offset
            .checked_sub(self.region.start)
            .is_some_and(|rel| rel % node_size(self.fan_out) == 0);
        if !aligned || !self.region.contains(&offset) {
            return Err(FormatError::NodeOutOfBounds {
                offset,
                start: self.region.start,
                end: self.region.end,
            }
            .into());
        }
        Ok(())
    }

    /// Walk the tree for `key`, returning the first entry id that `matches`
    /// accepts.
    pub fn find<S: ByteSource>(
        &self,
        source: &mut S,
        key: u64,
        mut matches: impl FnMut(u32) -> bool,
    ) -> Result<Option<u32>> {
        if self.node_count == 0 {
            return Ok(None);
        }

        let node_len = node_size(self.fan_out);
        let mut buf = alloc_zeroed(node_len)?;
        let mut offset = self.root;
        let mut level = self.depth;
        let mut visited = 0u64;

        loop {
            visited += 1;
            if visited > self.node_count {
                return Err(FormatError::IndexCycle {
                    limit: self.node_count,
                }
                .into());
            }
            self.check_node(offset)?;

            let n = source.read_full_at(offset, &mut buf)?;
            if n < buf.len() {
                return Err(truncated("index node", node_len, n as u64));
            }
            let (slot_bytes, trailing) = buf.split_at(buf.len() - 8);
            let trailing = LittleEndian::read_u64(trailing);
            let slots = slot_bytes.chunks_exact(SLOT_SIZE as usize).map(|slot| {
                (
                    LittleEndian::read_u64(&slot[..8]),
                    LittleEndian::read_u64(&slot[8..]),
                )
            });

            if level > 0 {
                let child = slots
                    .take_while(|&(_, separator)| separator != 0)
                    .find(|&(_, separator)| separator > key)
                    .map_or(trailing, |(child, _)| child);
                trace!(offset, level, child, "descend");
                offset = child;
                level -= 1;
                continue;
            }

            for (ptr, slot_key) in slots {
                if slot_key == 0 {
                    break;
                }
                if slot_key > key {
                    return Ok(None);
                }
                if slot_key == key {
                    let id = u32::try_from(ptr)
                        .ok()
                        .filter(|&id| id < self.entry_count)
                        .ok_or(FormatError::BadEntryRef {
                            id: ptr,
                            count: self.entry_count,
                        })?;
                    if matches(id) {
                        return Ok(Some(id));
                    }
                }
            }

            if trailing == 0 {
                return Ok(None);
            }
            trace!(offset, next = trailing, "follow leaf chain");
            offset = trailing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;
    use std::io::SeekFrom;

    const START: u64 = 64;

    /// Place a built tree at `START` inside a memory source.
    fn materialize(keys: Vec<(u64, u32)>, fan_out: u16) -> (MemorySource, TreeIndex) {
        let count = keys.len() as u32;
        let (bytes, header) = build_tree(keys, fan_out, START).unwrap();
        let mut src = MemorySource::new();
        src.seek(SeekFrom::Start(START)).unwrap();
        src.write(&bytes).unwrap();
        let size = src.size().unwrap();
        let index = TreeIndex::from_header(&header, count, START, size).unwrap();
        (src, index)
    }

    #[test]
    fn name_key_is_nonzero_and_below_top_bit() {
        for name in ["", "a", "a.txt", "b/c.bin", "some/longer/path/to/file.dat"] {
            let key = name_key(name.as_bytes());
            assert!(key > 0);
            assert!(key < 1 << 63);
        }
        assert_ne!(name_key(b"ab"), name_key(b"ba"));
        assert_eq!(name_key(b"a.txt"), xxh3_64(b"a.txt") >> 1);
    }

    #[test]
    fn shape_levels() {
        assert_eq!(TreeShape::new(0, 4).node_count(), 0);
        assert_eq!(TreeShape::new(4, 4).depth(), 0);

        // 100 keys / 4 per leaf = 25 leaves -> 5 -> 1
        let shape = TreeShape::new(100, 4);
        assert_eq!(shape.depth(), 2);
        assert_eq!(shape.node_count(), 31);
        assert_eq!(shape.region_len(4), 31 * 72);
    }

    #[test]
    fn build_emits_whole_region() {
        let keys: Vec<_> = (0..37u32).map(|i| (u64::from(i) * 3 + 1, i)).collect();
        let (bytes, header) = build_tree(keys, 3, START).unwrap();
        let shape = TreeShape::new(37, 3);
        assert_eq!(bytes.len() as u64, shape.region_len(3));
        assert_eq!(header.depth, shape.depth());
        // Root is the last node written.
        assert_eq!(header.root_offset, START + bytes.len() as u64 - node_size(3));
    }

    #[test]
    fn finds_every_key() {
        for fan_out in [2u16, 3, 16] {
            let keys: Vec<_> = (0..200u32).map(|i| (name_key(&i.to_le_bytes()), i)).collect();
            let (mut src, index) = materialize(keys.clone(), fan_out);
            for &(key, id) in &keys {
                let found = index.find(&mut src, key, |candidate| candidate == id).unwrap();
                assert_eq!(found, Some(id), "fan_out {fan_out}, id {id}");
            }
        }
    }

    #[test]
    fn missing_keys_are_not_found() {
        let keys: Vec<_> = (1..=50u32).map(|i| (u64::from(i) * 10, i - 1)).collect();
        let (mut src, index) = materialize(keys, 4);
        for key in [1, 5, 15, 255, 499, 501, 10_000] {
            assert_eq!(index.find(&mut src, key, |_| true).unwrap(), None);
        }
    }

    #[test]
    fn colliding_keys_spanning_leaves_are_all_visited() {
        // 9 entries share one key across three leaves of three.
        let mut keys: Vec<_> = (0..9u32).map(|i| (500, i)).collect();
        keys.extend((9..20u32).map(|i| (u64::from(i) * 100, i)));
        let (mut src, index) = materialize(keys, 3);

        for wanted in 0..9u32 {
            let mut seen = Vec::new();
            let found = index
                .find(&mut src, 500, |id| {
                    seen.push(id);
                    id == wanted
                })
                .unwrap();
            assert_eq!(found, Some(wanted));
            // Candidates arrive highest id first.
            assert_eq!(seen.first(), Some(&8));
        }
        assert_eq!(index.find(&mut src, 500, |_| false).unwrap(), None);
    }

    #[test]
    fn empty_tree() {
        let (bytes, header) = build_tree(Vec::new(), 8, START).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(header.root_offset, 0);
        let index = TreeIndex::from_header(&header, 0, START, START).unwrap();
        let mut src = MemorySource::new();
        assert_eq!(index.find(&mut src, 42, |_| true).unwrap(), None);
    }

    #[test]
    fn rejects_bad_headers() {
        let header = IndexHeader {
            root_offset: START,
            fan_out: 1,
            depth: 0,
        };
        assert!(matches!(
            TreeIndex::from_header(&header, 1, START, 1 << 20),
            Err(Error::InvalidFormat(FormatError::BadFanOut(1)))
        ));

        let header = IndexHeader {
            root_offset: START,
            fan_out: 4,
            depth: 3,
        };
        assert!(matches!(
            TreeIndex::from_header(&header, 4, START, 1 << 20),
            Err(Error::InvalidFormat(FormatError::BadDepth { .. }))
        ));

        let header = IndexHeader {
            root_offset: START + 1,
            fan_out: 4,
            depth: 0,
        };
        assert!(matches!(
            TreeIndex::from_header(&header, 4, START, 1 << 20),
            Err(Error::InvalidFormat(FormatError::NodeOutOfBounds { .. }))
        ));

        let header = IndexHeader {
            root_offset: START,
            fan_out: 4,
            depth: 0,
        };
        assert!(matches!(
            TreeIndex::from_header(&header, 4, START, START + 10),
            Err(Error::InvalidFormat(FormatError::Truncated { .. }))
        ));
    }

    #[test]
    fn leaf_chain_cycle_is_detected() {
        // Two leaves of two; the second leaf points back at the first.
        let keys: Vec<_> = (0..4u32).map(|i| (u64::from(i) + 1, i)).collect();
        let (mut src, index) = materialize(keys, 2);
        let second_leaf = START + node_size(2);
        src.seek(SeekFrom::Start(second_leaf + node_size(2) - 8)).unwrap();
        src.write(&START.to_le_bytes()).unwrap();

        let err = index.find(&mut src, 100, |_| false).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFormat(FormatError::IndexCycle { .. })
        ));
    }

    #[test]
    fn out_of_range_entry_reference_is_rejected() {
        let (mut src, index) = materialize(vec![(7, 0)], 4);
        // Overwrite the leaf's entry id with one past the entry count.
        src.seek(SeekFrom::Start(START)).unwrap();
        src.write(&5u64.to_le_bytes()).unwrap();
        let err = index.find(&mut src, 7, |_| true).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFormat(FormatError::BadEntryRef { id: 5, count: 1 })
        ));
    }
}
