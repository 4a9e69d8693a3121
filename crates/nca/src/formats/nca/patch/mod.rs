//! RomFS patch composition: the relocation and encryption bucket trees stored in a
//! patch NCA's `PatchInfo`, and the storages built from them.

mod bucket_tree;
mod generation_lookup;
mod indirect_storage;

pub use bucket_tree::{BucketTree, BucketTreeEntry, BucketTreeError};
pub use generation_lookup::BucketTreeGenerationLookup;
pub use indirect_storage::{IndirectSource, IndirectStorage};
