use crate::formats::nca::patch::bucket_tree::BucketTree;
use crate::storage::block_transforms::CtrExGenerationLookup;

/// A [`CtrExGenerationLookup`] backed by a [`BucketTree`]'s own entries: each entry's
/// `payload` holds the `generation_id` (AES-CTR-EX's substitute for the upper 32 bits of
/// the counter's `high64`) to use for bytes from its `virtual_offset` onward.
#[derive(Debug, Clone)]
pub struct BucketTreeGenerationLookup {
    entries: Vec<(u64, u32)>,
}

impl BucketTreeGenerationLookup {
    pub fn new(tree: &BucketTree) -> Self {
        let entries = tree
            .entries()
            .iter()
            .map(|entry| (entry.virtual_offset, entry.payload as u32))
            .collect();
        Self { entries }
    }
}

impl CtrExGenerationLookup for BucketTreeGenerationLookup {
    fn generation_id(&self, absolute_offset: u64) -> u32 {
        let index = match self
            .entries
            .binary_search_by_key(&absolute_offset, |&(offset, _)| offset)
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        self.entries.get(index).map(|&(_, gen)| gen).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::nca::patch::bucket_tree::{BucketTreeEntry, BucketTree};

    #[test]
    fn looks_up_generation_by_offset() {
        let tree = BucketTree::new(
            vec![
                BucketTreeEntry { virtual_offset: 0, payload: 1 },
                BucketTreeEntry { virtual_offset: 0x1000, payload: 2 },
            ],
            0x2000,
        );
        let lookup = BucketTreeGenerationLookup::new(&tree);

        assert_eq!(lookup.generation_id(0), 1);
        assert_eq!(lookup.generation_id(0x500), 1);
        assert_eq!(lookup.generation_id(0x1000), 2);
        assert_eq!(lookup.generation_id(0x1fff), 2);
    }
}
