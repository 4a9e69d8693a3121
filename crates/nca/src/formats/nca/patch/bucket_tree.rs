//! A compact on-disk sorted interval index.
//!
//! Both of `PatchInfo`'s trees (the indirect-storage relocation tree and the
//! AES-CTR-EX encryption tree) are sequences of `(virtual_offset, payload)`
//! pairs sorted by `virtual_offset`, each covering
//! `[virtual_offset, next_entry.virtual_offset)`; the last entry's range
//! runs to the tree's declared total virtual size. Lookup is by binary
//! search, O(log n) in the entry count.

use binrw::BinRead;
use snafu::{ResultExt, Snafu};

use crate::storage::{ReadableStorage, ReadableStorageExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, binrw::BinWrite)]
#[brw(little)]
pub struct BucketTreeEntry {
    pub virtual_offset: u64,
    pub payload: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, binrw::BinWrite)]
#[brw(little, magic = b"BKTR")]
pub struct BucketTreeHeader {
    pub version: u32,
    pub entry_count: u32,
    pub total_size: u64,
}

#[derive(BinRead)]
#[br(little)]
struct Entries {
    #[br(parse_with = binrw::until_eof)]
    entries: Vec<BucketTreeEntry>,
}

#[derive(Snafu, Debug)]
pub enum BucketTreeError {
    #[snafu(display("failed to parse bucket tree: {}", source))]
    Parse { source: binrw::Error },
    #[snafu(display("bucket tree has no entries"))]
    Empty,
}

#[derive(Debug, Clone)]
pub struct BucketTree {
    entries: Vec<BucketTreeEntry>,
    total_size: u64,
}

impl BucketTree {
    pub fn new(entries: Vec<BucketTreeEntry>, total_size: u64) -> Self {
        debug_assert!(entries
            .windows(2)
            .all(|w| w[0].virtual_offset < w[1].virtual_offset));
        Self {
            entries,
            total_size,
        }
    }

    pub fn from_storage(storage: impl ReadableStorage) -> Result<Self, BucketTreeError> {
        let mut io = storage.buf_read();
        let header = BucketTreeHeader::read(&mut io).context(ParseSnafu)?;
        let Entries { entries } = Entries::read(&mut io).context(ParseSnafu)?;
        let entries: Vec<_> = entries
            .into_iter()
            .take(header.entry_count as usize)
            .collect();

        if entries.is_empty() {
            return Err(BucketTreeError::Empty);
        }

        Ok(Self::new(entries, header.total_size))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn entries(&self) -> &[BucketTreeEntry] {
        &self.entries
    }

    /// Returns the entry covering `virtual_offset` together with the length of the
    /// contiguous run starting there, capped to `max_len` and to the entry's own extent.
    pub fn find(&self, virtual_offset: u64, max_len: u64) -> Option<(BucketTreeEntry, u64)> {
        if virtual_offset >= self.total_size || max_len == 0 {
            return None;
        }

        let index = match self
            .entries
            .binary_search_by_key(&virtual_offset, |e| e.virtual_offset)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };

        let entry = self.entries[index];
        let next_offset = self
            .entries
            .get(index + 1)
            .map(|e| e.virtual_offset)
            .unwrap_or(self.total_size);

        let len = (next_offset - virtual_offset).min(max_len);
        Some((entry, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: &[(u64, u64)], total_size: u64) -> BucketTree {
        BucketTree::new(
            entries
                .iter()
                .map(|&(virtual_offset, payload)| BucketTreeEntry {
                    virtual_offset,
                    payload,
                })
                .collect(),
            total_size,
        )
    }

    #[test]
    fn finds_covering_entry() {
        let t = tree(&[(0, 10), (0x100, 20), (0x200, 30)], 0x300);

        let (entry, len) = t.find(0x50, 0x1000).unwrap();
        assert_eq!(entry.payload, 10);
        assert_eq!(len, 0xb0); // up to 0x100

        let (entry, len) = t.find(0x180, 0x1000).unwrap();
        assert_eq!(entry.payload, 20);
        assert_eq!(len, 0x80); // up to 0x200

        let (entry, len) = t.find(0x2f0, 0x1000).unwrap();
        assert_eq!(entry.payload, 30);
        assert_eq!(len, 0x10); // up to total_size
    }

    #[test]
    fn out_of_range_is_none() {
        let t = tree(&[(0, 10)], 0x100);
        assert!(t.find(0x100, 0x10).is_none());
    }

    #[test]
    fn exact_boundary_hit() {
        let t = tree(&[(0, 1), (0x10, 2)], 0x20);
        let (entry, len) = t.find(0x10, 0x10).unwrap();
        assert_eq!(entry.payload, 2);
        assert_eq!(len, 0x10);
    }
}
