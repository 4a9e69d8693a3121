use crate::crypto::{AesKey, AesXtsKey};
use crate::formats::nca::patch::BucketTreeGenerationLookup;
use crate::storage::block_transforms::{AesCtrBlockTransform, AesCtrExBlockTransform, XtsBlockTransform};
use crate::storage::{
    AesCtrStorage, BlockAdapterStorage, BlockTransformStorage, LinearAdapterStorage,
    ReadableStorage, Storage, StorageError,
};

type AesCtrExStorage<S> = BlockTransformStorage<
    BlockAdapterStorage<S>,
    AesCtrExBlockTransform<BucketTreeGenerationLookup>,
>;
type XtsStorage<S> = BlockTransformStorage<BlockAdapterStorage<S>, XtsBlockTransform>;

#[derive(Debug)]
pub enum NcaCryptStorage<S: ReadableStorage> {
    Plaintext(S),
    AesCtr(LinearAdapterStorage<AesCtrStorage<BlockAdapterStorage<S>>>),
    AesCtrEx(LinearAdapterStorage<AesCtrExStorage<S>>),
    Xts(LinearAdapterStorage<XtsStorage<S>>),
}

impl<S: ReadableStorage> NcaCryptStorage<S> {
    pub fn new_plaintext(storage: S) -> Self {
        Self::Plaintext(storage)
    }

    pub fn new_ctr(storage: S, key: AesKey, fs_header_counter: u64, start_offset: u64) -> Self {
        let block_adapter = BlockAdapterStorage::new(storage, 0x10);
        let transform = AesCtrBlockTransform::new(key, fs_header_counter, start_offset);
        let aes_ctr = AesCtrStorage::new(block_adapter, transform);

        Self::AesCtr(LinearAdapterStorage::new(aes_ctr))
    }

    pub fn new_ctr_ex(
        storage: S,
        key: AesKey,
        fs_header_counter: u64,
        start_offset: u64,
        generation_lookup: BucketTreeGenerationLookup,
    ) -> Self {
        let block_adapter = BlockAdapterStorage::new(storage, 0x10);
        let transform =
            AesCtrExBlockTransform::new(key, fs_header_counter, start_offset, generation_lookup);
        let aes_ctr_ex = AesCtrExStorage::new(block_adapter, transform);

        Self::AesCtrEx(LinearAdapterStorage::new(aes_ctr_ex))
    }

    /// `base_sector` is the section's absolute start offset in units of the 0x200-byte XTS
    /// sector, matching the legacy NCA2 "XtsOld" tweak derivation.
    pub fn new_xts(storage: S, key: AesXtsKey, base_sector: usize) -> Self {
        let block_adapter = BlockAdapterStorage::new(storage, 0x200);
        let transform = XtsBlockTransform::new(key, base_sector);
        let xts = XtsStorage::new(block_adapter, transform);

        Self::Xts(LinearAdapterStorage::new(xts))
    }
}

impl<S: ReadableStorage> ReadableStorage for NcaCryptStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesCtr(storage) => storage.read(offset, buf),
            NcaCryptStorage::AesCtrEx(storage) => storage.read(offset, buf),
            NcaCryptStorage::Xts(storage) => storage.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.get_size(),
            NcaCryptStorage::AesCtr(storage) => storage.get_size(),
            NcaCryptStorage::AesCtrEx(storage) => storage.get_size(),
            NcaCryptStorage::Xts(storage) => storage.get_size(),
        }
    }
}

impl<S: Storage> Storage for NcaCryptStorage<S> {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.write(offset, buf),
            NcaCryptStorage::AesCtr(storage) => storage.write(offset, buf),
            NcaCryptStorage::AesCtrEx(storage) => storage.write(offset, buf),
            NcaCryptStorage::Xts(storage) => storage.write(offset, buf),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.flush(),
            NcaCryptStorage::AesCtr(storage) => storage.flush(),
            NcaCryptStorage::AesCtrEx(storage) => storage.flush(),
            NcaCryptStorage::Xts(storage) => storage.flush(),
        }
    }

    fn set_size(&self, new_size: u64) -> Result<(), StorageError> {
        match self {
            NcaCryptStorage::Plaintext(storage) => storage.set_size(new_size),
            NcaCryptStorage::AesCtr(storage) => storage.set_size(new_size),
            NcaCryptStorage::AesCtrEx(storage) => storage.set_size(new_size),
            NcaCryptStorage::Xts(storage) => storage.set_size(new_size),
        }
    }
}
