use snafu::{ResultExt, Snafu};

use crate::crypto::AesKey;
use crate::formats::nca::filesystem::NcaFileSystem;
use crate::formats::nca::patch::{BucketTree, BucketTreeError, BucketTreeGenerationLookup, IndirectStorage};
use crate::formats::nca::structs::{IntegrityInfo, NcaEncryptionType, NcaFormatType, NcaFsHeader};
use crate::formats::nca::{
    IntegrityCheckLevel, Nca, NcaContentKeys, NcaCryptStorage, NcaSectionType,
    NcaVerificationStorage,
};
use crate::formats::{pfs, romfs};
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorage, SliceStorageError,
    StorageError,
};

pub type RawEncryptedSectionStorage<S> = SliceStorage<SharedStorage<S>>;
pub type RawDecryptedSectionStorage<S> = NcaCryptStorage<RawEncryptedSectionStorage<S>>;
pub type VerifiedSectionStorage<S> = NcaVerificationStorage<RawDecryptedSectionStorage<S>>;
pub type SectionFileSystem<S> = NcaFileSystem<VerifiedSectionStorage<S>>;

/// Logical RomFS data composed from a base section and a patch section's relocation tree.
pub type PatchedSectionStorage<B, P> = IndirectStorage<B, P>;

type ComposedSectionStorage<S, B> =
    NcaVerificationStorage<PatchedSectionStorage<RawDecryptedSectionStorage<B>, RawDecryptedSectionStorage<S>>>;

/// A section opened either directly (`self` alone) or composed over a base NCA's matching
/// section (`self` is the patch). Both cases yield a verified byte stream; which arm is
/// produced depends only on whether a base was given and whether the section actually
/// carries a relocation tree, never on the caller.
#[derive(Debug)]
pub enum MountedSectionStorage<S: ReadableStorage, B: ReadableStorage> {
    Direct(VerifiedSectionStorage<S>),
    Patched(ComposedSectionStorage<S, B>),
}

impl<S: ReadableStorage, B: ReadableStorage> ReadableStorage for MountedSectionStorage<S, B> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), crate::storage::StorageError> {
        match self {
            MountedSectionStorage::Direct(storage) => storage.read(offset, buf),
            MountedSectionStorage::Patched(storage) => storage.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            MountedSectionStorage::Direct(storage) => storage.get_size(),
            MountedSectionStorage::Patched(storage) => storage.get_size(),
        }
    }
}

pub type MountedSectionFileSystem<S, B> = NcaFileSystem<MountedSectionStorage<S, B>>;

#[derive(Snafu, Debug)]
pub enum SectionOpenError {
    #[snafu(display("failed to slice section storage: {}", source))]
    Slice { source: SliceStorageError },
    #[snafu(display("failed to parse patch bucket tree: {}", source))]
    BucketTree { source: BucketTreeError },
    #[snafu(display("failed to parse RomFS section: {}", source))]
    Romfs { source: romfs::RomFsParseError },
    #[snafu(display("failed to parse PFS0 section: {}", source))]
    Pfs { source: pfs::PfsParseError },
    #[snafu(display("this section uses a sparse layer, which isn't supported"))]
    SparseLayerUnsupported,
    #[snafu(display("this section uses a compression layer, which isn't supported"))]
    CompressionLayerUnsupported,
}

#[derive(Debug)]
pub struct SectionRange {
    pub offset: u64,
    pub size: u64,
}

/// Outcome of [`Nca::verify_section`]: whether every hashed block in the section
/// matched its recorded hash, or the section carries no hash tree to check at all.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SectionValidity {
    Valid,
    Invalid,
    /// The section is disabled, or has no integrity info to check against.
    Unchecked,
}

impl<S: ReadableStorage> Nca<S> {
    fn get_section_range(&self, index: usize) -> Option<SectionRange> {
        let section_entry = self.headers.nca_header.section_table[index];

        if !section_entry.is_enabled {
            return None;
        }

        Some(SectionRange {
            offset: section_entry.start.into(),
            size: section_entry.size(),
        })
    }

    pub fn get_raw_encrypted_section_storage(
        &self,
        index: usize,
    ) -> Result<Option<RawEncryptedSectionStorage<S>>, SectionOpenError> {
        let section_entry = self.headers.nca_header.section_table[index];

        if !section_entry.is_enabled {
            return Ok(None);
        }

        let fs_header = self.headers.fs_headers[index].as_ref().unwrap();
        if fs_header.exists_sparse_layer() {
            return Err(SectionOpenError::SparseLayerUnsupported);
        }

        let storage = self
            .body
            .clone()
            .slice(section_entry.start.into(), section_entry.size())
            .context(SliceSnafu)?;

        Ok(Some(storage))
    }

    fn get_ctr_key(&self) -> AesKey {
        match self.content_key {
            NcaContentKeys::Plaintext => panic!("Attempt to get CTR key for plaintext NCA"),
            NcaContentKeys::KeyArea { ctr: key, .. }
            | NcaContentKeys::Nca0RsaOaep { ctr: key, .. }
            | NcaContentKeys::RightsId(key) => key,
        }
    }

    /// Builds the relocation/encryption bucket trees carried by a patch section, reading
    /// them from the section's own AES-CTR-decrypted byte range (the trees sit past the
    /// logical RomFS data, at `patch_info.{relocation,encryption}_tree_offset`).
    fn get_patch_trees(
        &self,
        index: usize,
    ) -> Result<Option<(BucketTree, BucketTree)>, SectionOpenError> {
        let Some(fs_header) = self.headers.fs_headers[index].as_ref() else {
            return Ok(None);
        };

        if !fs_header.is_patch_section() {
            return Ok(None);
        }

        let Some(raw) = self.get_raw_encrypted_section_storage(index)? else {
            return Ok(None);
        };

        let section_entry = self.headers.nca_header.section_table[index];
        let ctr_storage = NcaCryptStorage::new_ctr(
            raw,
            self.get_ctr_key(),
            fs_header.upper_counter,
            section_entry.start.into(),
        )
        .shared();

        let relocation_storage = ctr_storage
            .clone()
            .slice(
                fs_header.patch_info.relocation_tree_offset,
                fs_header.patch_info.relocation_tree_size,
            )
            .context(SliceSnafu)?;
        let relocation_tree =
            BucketTree::from_storage(relocation_storage).context(BucketTreeSnafu)?;

        let encryption_storage = ctr_storage
            .clone()
            .slice(
                fs_header.patch_info.encryption_tree_offset,
                fs_header.patch_info.encryption_tree_size,
            )
            .context(SliceSnafu)?;
        let encryption_tree =
            BucketTree::from_storage(encryption_storage).context(BucketTreeSnafu)?;

        Ok(Some((relocation_tree, encryption_tree)))
    }

    pub fn get_raw_decrypted_section_storage(
        &self,
        index: usize,
    ) -> Result<Option<RawDecryptedSectionStorage<S>>, SectionOpenError> {
        let Some(storage) = self.get_raw_encrypted_section_storage(index)? else {
            return Ok(None);
        };

        let fs_header = self.headers.fs_headers[index].as_ref().unwrap();
        let section_entry = self.headers.nca_header.section_table[index];

        let storage = if self.is_plaintext() {
            NcaCryptStorage::new_plaintext(storage)
        } else {
            match fs_header.encryption_type {
                NcaEncryptionType::Auto | NcaEncryptionType::None => {
                    NcaCryptStorage::new_plaintext(storage)
                }
                NcaEncryptionType::Xts => NcaCryptStorage::new_xts(
                    storage,
                    match self.content_key {
                        NcaContentKeys::KeyArea { xts, .. }
                        | NcaContentKeys::Nca0RsaOaep { xts, .. } => xts,
                        _ => panic!("XTS-encrypted section on a rights-ID NCA"),
                    },
                    (u64::from(section_entry.start) / 0x200) as usize,
                ),
                NcaEncryptionType::AesCtr => {
                    let key = self.get_ctr_key();
                    NcaCryptStorage::new_ctr(
                        storage,
                        key,
                        fs_header.upper_counter,
                        section_entry.start.into(),
                    )
                }
                NcaEncryptionType::AesCtrEx => {
                    let (_, encryption_tree) = self
                        .get_patch_trees(index)?
                        .expect("AesCtrEx section must have a patch_info");
                    let generation_lookup = BucketTreeGenerationLookup::new(&encryption_tree);

                    NcaCryptStorage::new_ctr_ex(
                        storage,
                        self.get_ctr_key(),
                        fs_header.upper_counter,
                        section_entry.start.into(),
                        generation_lookup,
                    )
                }
            }
        };

        Ok(Some(storage))
    }

    pub fn get_patch_relocation_tree(
        &self,
        index: usize,
    ) -> Result<Option<BucketTree>, SectionOpenError> {
        Ok(self.get_patch_trees(index)?.map(|(relocation, _)| relocation))
    }

    /// Composes this (patch) NCA's section with the corresponding section of a base NCA,
    /// selecting bytes from either per the patch's relocation tree.
    pub fn get_patched_section_storage<B: ReadableStorage>(
        &self,
        index: usize,
        base_storage: B,
    ) -> Result<Option<PatchedSectionStorage<B, RawDecryptedSectionStorage<S>>>, SectionOpenError>
    {
        let Some(relocation_tree) = self.get_patch_relocation_tree(index)? else {
            return Ok(None);
        };
        let patch_storage = self
            .get_raw_decrypted_section_storage(index)?
            .expect("patch section must be enabled to have a relocation tree");

        Ok(Some(IndirectStorage::new(
            base_storage,
            patch_storage,
            relocation_tree,
        )))
    }

    /// Wraps `storage` in the verification layer called for by `fs_header.integrity_info`.
    /// Shared between the direct and base-composed section-opening paths: a patched
    /// section's hash tables address the same virtual offsets as its own unpatched
    /// `integrity_info`, so verification is identical either way, only the underlying
    /// storage differs.
    fn build_verification_storage<S2: ReadableStorage>(
        storage: S2,
        fs_header: &NcaFsHeader,
        integrity_level: IntegrityCheckLevel,
    ) -> NcaVerificationStorage<S2> {
        match fs_header.integrity_info {
            IntegrityInfo::None => NcaVerificationStorage::Identity(storage),
            IntegrityInfo::Sha256(s) => {
                assert_eq!(s.level_count, 2);
                let levels = s.level_info[..2].try_into().unwrap();

                NcaVerificationStorage::new_pfs_verification_storage(
                    storage,
                    s.master_hash.0 .0,
                    levels,
                    s.block_size,
                    integrity_level,
                )
                .expect("FS header specifies invalid hash level offsets for HierarchicalSha256 integrity verification")
            }
            IntegrityInfo::Ivfc(s) => {
                assert_eq!(s.master_hash_size, 0x20);
                let master_hash = s.master_hash.0[..0x20].try_into().unwrap();

                // -1 because the last level is the master hash
                NcaVerificationStorage::new_ivfc_verification_storage(
                    storage,
                    master_hash,
                    s.level_count - 1,
                    s.level_info,
                    integrity_level,
                )
                .expect("FS header specifies invalid hash level offsets for IVFC integrity verification")
            }
        }
    }

    pub fn get_section_storage(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<Option<VerifiedSectionStorage<S>>, SectionOpenError> {
        let Some(storage) = self.get_raw_decrypted_section_storage(index)? else {
            return Ok(None);
        };

        let fs_header = self.headers.fs_headers[index].as_ref().unwrap();

        if fs_header.exists_compression_layer() {
            return Err(SectionOpenError::CompressionLayerUnsupported);
        }

        Ok(Some(Self::build_verification_storage(
            storage,
            fs_header,
            integrity_level,
        )))
    }

    pub fn get_section_fs(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<Option<SectionFileSystem<S>>, SectionOpenError> {
        let Some(storage) = self.get_section_storage(index, integrity_level)? else {
            return Ok(None);
        };

        let fs_header = self.headers.fs_headers[index].as_ref().unwrap();

        let fs = match fs_header.format_type {
            NcaFormatType::Romfs => NcaFileSystem::new_romfs(storage).context(RomfsSnafu)?,
            NcaFormatType::Pfs0 => NcaFileSystem::new_pfs(storage).context(PfsSnafu)?,
        };

        Ok(Some(fs))
    }

    /// Like [`Self::get_section_storage`], but for a patch NCA's section: when `base` is
    /// given, the section's content is the base section with the patch's relocation tree
    /// applied, verified against the patch's own (unchanged) integrity metadata. A section
    /// that carries no `patch_info` (e.g. ExeFS, Logo) falls back to opening directly from
    /// `self`, ignoring `base`.
    pub fn get_section_storage_with_base<B: ReadableStorage>(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
        base: Option<&Nca<B>>,
    ) -> Result<Option<MountedSectionStorage<S, B>>, SectionOpenError> {
        let Some(base) = base else {
            return Ok(self
                .get_section_storage(index, integrity_level)?
                .map(MountedSectionStorage::Direct));
        };

        let Some(base_storage) = base.get_raw_decrypted_section_storage(index)? else {
            return Ok(None);
        };

        let Some(composed) = self.get_patched_section_storage(index, base_storage)? else {
            return Ok(self
                .get_section_storage(index, integrity_level)?
                .map(MountedSectionStorage::Direct));
        };

        let fs_header = self.headers.fs_headers[index].as_ref().unwrap();
        if fs_header.exists_compression_layer() {
            return Err(SectionOpenError::CompressionLayerUnsupported);
        }

        Ok(Some(MountedSectionStorage::Patched(
            Self::build_verification_storage(composed, fs_header, integrity_level),
        )))
    }

    pub fn get_section_fs_with_base<B: ReadableStorage>(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
        base: Option<&Nca<B>>,
    ) -> Result<Option<MountedSectionFileSystem<S, B>>, SectionOpenError> {
        let Some(storage) = self.get_section_storage_with_base(index, integrity_level, base)?
        else {
            return Ok(None);
        };

        let fs_header = self.headers.fs_headers[index].as_ref().unwrap();

        let fs = match fs_header.format_type {
            NcaFormatType::Romfs => NcaFileSystem::new_romfs(storage).context(RomfsSnafu)?,
            NcaFormatType::Pfs0 => NcaFileSystem::new_pfs(storage).context(PfsSnafu)?,
        };

        Ok(Some(fs))
    }

    pub fn get_section_type(&self, index: usize) -> Option<NcaSectionType> {
        use crate::formats::nca::NcaContentType::Program;
        use crate::formats::nca::NcaSectionType::{Code, Data, Logo};

        match (index, self.headers.nca_header.content_type) {
            (0, Program) => Some(Code),
            (1, Program) => Some(Data),
            (2, Program) => Some(Logo),
            (0, _) => Some(Data),
            _ => None,
        }
    }

    pub fn get_fs(
        &self,
        ty: NcaSectionType,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<Option<SectionFileSystem<S>>, SectionOpenError> {
        let Some(index) = (0..4).find(|&i| self.get_section_type(i) == Some(ty)) else {
            return Ok(None);
        };

        self.get_section_fs(index, integrity_level)
    }

    /// Reads every hashed block of section `index` (optionally composed over `base`,
    /// same as [`Self::get_section_storage_with_base`]) at [`IntegrityCheckLevel::Full`]
    /// and reports whether any failed, without holding the whole section in memory at
    /// once.
    pub fn verify_section<B: ReadableStorage>(
        &self,
        index: usize,
        base: Option<&Nca<B>>,
    ) -> Result<SectionValidity, SectionOpenError> {
        let Some(fs_header) = self.headers.fs_headers[index].as_ref() else {
            return Ok(SectionValidity::Unchecked);
        };
        if matches!(fs_header.integrity_info, IntegrityInfo::None) {
            return Ok(SectionValidity::Unchecked);
        }

        let Some(storage) = self.get_section_storage_with_base(index, IntegrityCheckLevel::Full, base)?
        else {
            return Ok(SectionValidity::Unchecked);
        };

        const CHUNK_SIZE: usize = 0x10000;
        let size = storage.get_size();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let read_size = std::cmp::min(CHUNK_SIZE as u64, size - offset) as usize;
            match storage.read(offset, &mut buf[..read_size]) {
                Ok(()) => {}
                Err(StorageError::IntegrityCheckFailed {}) => return Ok(SectionValidity::Invalid),
                Err(_) => return Ok(SectionValidity::Invalid),
            }
            offset += read_size as u64;
        }

        Ok(SectionValidity::Valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::nca::structs::{
        DistributionType, NcaContentType, NcaHashType, NcaHeader, NcaKeyArea, NcaMagic,
        NcaSignature, SectionTableEntry, Sha256Hash, Sha256IntegrityInfo, Sha256IntegrityInfoLevel,
    };
    use crate::hexstring::HexData;
    use crate::ids::{RightsId, TitleId};
    use crate::storage::VecStorage;
    use binrw::{BinRead, BinWrite};
    use std::io::Cursor;

    fn test_key_set() -> crate::crypto::keyset::KeySet {
        crate::crypto::keyset::KeySet::from_file_contents(
            &format!("header_key = {}\n", "0".repeat(64)),
            "",
        )
        .unwrap()
    }

    fn zero_title_id() -> TitleId {
        TitleId::read(&mut Cursor::new([0u8; 8])).unwrap()
    }

    fn zero_rights_id() -> RightsId {
        RightsId::read(&mut Cursor::new([0u8; 0x10])).unwrap()
    }

    fn zero_key_area() -> NcaKeyArea {
        NcaKeyArea::read(&mut Cursor::new([0u8; 0x100])).unwrap()
    }

    /// Builds an unencrypted, single-Pfs0-section NCA whose section is
    /// hierarchically SHA-256-hashed at block size 0x200, optionally with a
    /// deliberately wrong master hash to exercise the invalid path.
    fn build_hashed_pfs_nca(data: &[u8], corrupt_master_hash: bool) -> VecStorage {
        let hash_table = data
            .chunks(0x200)
            .flat_map(crate::crypto::sha256)
            .collect::<Vec<u8>>();
        let mut master_hash = crate::crypto::sha256(&hash_table);
        if corrupt_master_hash {
            master_hash[0] ^= 0xff;
        }

        let data_offset = 0x200u64;
        let mut section_content = vec![0u8; data_offset as usize + data.len()];
        section_content[..hash_table.len()].copy_from_slice(&hash_table);
        section_content[data_offset as usize..].copy_from_slice(data);

        let mut level_info = [Sha256IntegrityInfoLevel { offset: 0, size: 0 }; 6];
        level_info[0] = Sha256IntegrityInfoLevel { offset: 0, size: hash_table.len() as u64 };
        level_info[1] = Sha256IntegrityInfoLevel { offset: data_offset, size: data.len() as u64 };

        let fs_header = NcaFsHeader {
            version: 2,
            format_type: NcaFormatType::Pfs0,
            hash_type: NcaHashType::Sha256,
            encryption_type: NcaEncryptionType::None,
            integrity_info: IntegrityInfo::Sha256(Sha256IntegrityInfo {
                master_hash: Sha256Hash(HexData(master_hash)),
                block_size: 0x200,
                level_count: 2,
                level_info,
            }),
            patch_info: crate::formats::nca::structs::PatchInfo {
                relocation_tree_offset: 0,
                relocation_tree_size: 0,
                relocation_tree_header: HexData([0; 0x10]),
                encryption_tree_offset: 0,
                encryption_tree_size: 0,
                encryption_tree_header: HexData([0; 0x10]),
            },
            upper_counter: 0,
            sparse_info: crate::formats::nca::structs::SparseInfo {
                meta_offset: 0,
                meta_size: 0,
                meta_header: HexData([0; 0x10]),
                physical_offset: 0,
                generation: 0,
            },
            compression_info: crate::formats::nca::structs::CompressionInfo {
                table_offset: 0,
                table_size: 0,
                table_header: HexData([0; 0x10]),
            },
        };

        let mut fs_header_bytes = [0u8; 0x200];
        fs_header.write(&mut Cursor::new(&mut fs_header_bytes[..])).unwrap();

        let mut header = NcaHeader {
            fixed_key_signature: NcaSignature(HexData([0; 0x100])),
            npdm_signature: NcaSignature(HexData([0; 0x100])),
            magic: NcaMagic::Nca3,
            distribution_type: DistributionType::Download,
            content_type: NcaContentType::Data,
            key_generation_1: 0,
            key_area_key_index: crate::crypto::keyset::KeyAreaKeyIndex::Application,
            nca_size: 0,
            title_id: zero_title_id(),
            content_index: 0,
            sdk_version: 0,
            key_generation_2: 0,
            rights_id: zero_rights_id(),
            section_table: [SectionTableEntry { start: 0u64.into(), end: 0u64.into(), is_enabled: false }; 4],
            fs_header_hashes: [Sha256Hash(HexData([0; 0x20])); 4],
            key_area: zero_key_area(),
        };

        let start = 0xc00u64;
        let end = start + section_content.len() as u64;
        let aligned_end = (end + 0x1ff) / 0x200 * 0x200;
        header.section_table[0] = SectionTableEntry {
            start: start.into(),
            end: aligned_end.into(),
            is_enabled: true,
        };
        header.fs_header_hashes[0] = Sha256Hash(HexData(crate::crypto::sha256(&fs_header_bytes)));
        header.nca_size = aligned_end;

        let mut bytes = vec![0u8; aligned_end as usize];
        header.write(&mut Cursor::new(&mut bytes[0..0x400])).unwrap();
        bytes[0x400..0x600].copy_from_slice(&fs_header_bytes);
        bytes[start as usize..start as usize + section_content.len()].copy_from_slice(&section_content);

        VecStorage::new(bytes)
    }

    #[test]
    fn verify_section_reports_valid_for_intact_section() {
        let key_set = test_key_set();
        let nca = Nca::new(&key_set, build_hashed_pfs_nca(b"hello, world!", false)).unwrap();

        let validity = nca.verify_section::<VecStorage>(0, None).unwrap();
        assert_eq!(validity, SectionValidity::Valid);
    }

    #[test]
    fn verify_section_reports_invalid_for_corrupted_master_hash() {
        let key_set = test_key_set();
        let nca = Nca::new(&key_set, build_hashed_pfs_nca(b"hello, world!", true)).unwrap();

        let validity = nca.verify_section::<VecStorage>(0, None).unwrap();
        assert_eq!(validity, SectionValidity::Invalid);
    }

    #[test]
    fn verify_section_reports_unchecked_for_disabled_section() {
        let key_set = test_key_set();
        let nca = Nca::new(&key_set, build_hashed_pfs_nca(b"hello, world!", false)).unwrap();

        let validity = nca.verify_section::<VecStorage>(1, None).unwrap();
        assert_eq!(validity, SectionValidity::Unchecked);
    }
}
