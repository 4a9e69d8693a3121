//! Rewrites the content-entries table of a Meta NCA's CNMT and re-emits it as a
//! fresh, freestanding Meta NCA, the way [`super::build_merged`] re-emits a
//! Program NCA: a new PFS0 holding just the rewritten CNMT, SHA-256-hashed at
//! [`META_HASH_BLOCK_SIZE`], wrapped in a header copied from the base Meta NCA.
//!
//! Like the Program merger, this never re-signs: `fixed_key_signature` and
//! `npdm_signature` are carried over from `base_meta` verbatim, so they read
//! back as `Invalid`/`NotChecked` on reopen rather than `Valid`.

use binrw::{BinRead, BinWrite};
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use super::structs::{
    CompressionInfo, IntegrityInfo, NcaEncryptionType, NcaFormatType, NcaFsHeader, NcaHashType,
    NcaHeader, PatchInfo, SectionTableEntry, Sha256Hash, Sha256IntegrityInfo,
    Sha256IntegrityInfoLevel, SparseInfo,
};
use super::{
    IntegrityCheckLevel, Nca, NcaContentType, NcaSectionType, SectionOpenError,
};
use super::{ALL_HEADERS_SIZE, HEADER_SECTOR_SIZE, NCA_HEADER_SIZE};
use crate::crypto::keyset::{KeySet, MissingKeyError};
use crate::filesystem::{Entry, ReadableDirectory, ReadableFile, ReadableFileSystem};
use crate::formats::cnmt::{Cnmt, CnmtContentEntry};
use crate::formats::nca::filesystem::NcaOpenError;
use crate::formats::pfs;
use crate::hexstring::HexData;
use crate::storage::{ReadableStorage, ReadableStorageExt, StorageError, VecStorage};

/// Block size the rebuilt CNMT-PFS0 is SHA-256-hashed at.
pub const META_HASH_BLOCK_SIZE: u32 = 0x1000;
const HASH_TABLE_ALIGNMENT: u64 = 0x200;

#[derive(Snafu, Debug)]
pub enum MetaPatchError {
    #[snafu(display("build_meta_patch only accepts Meta-content NCAs"))]
    NotMeta,
    #[snafu(display("failed to open the base Meta NCA's Data section: {}", source))]
    SectionOpen { source: SectionOpenError },
    #[snafu(display("base Meta NCA has no Data section"))]
    MissingDataSection,
    #[snafu(display("base Meta NCA's Data partition contains no *.cnmt file"))]
    MissingCnmt,
    #[snafu(display("failed to open the base CNMT file's storage: {}", source))]
    CnmtStorageOpen { source: NcaOpenError },
    #[snafu(display("failed to read the base CNMT: {}", source))]
    CnmtRead { source: StorageError },
    #[snafu(display("failed to parse the base CNMT: {}", source))]
    CnmtParse { source: binrw::Error },
    #[snafu(display("failed to serialize the rewritten CNMT: {}", source))]
    CnmtWrite { source: binrw::Error },
    #[snafu(display("missing a crypto key: {}", source))]
    MissingKey { source: MissingKeyError },
}

fn sha256_hash_table(data: &[u8], block_size: u32) -> Vec<u8> {
    data.chunks(block_size as usize)
        .flat_map(crate::crypto::sha256)
        .collect()
}

fn empty_patch_info() -> PatchInfo {
    PatchInfo {
        relocation_tree_offset: 0,
        relocation_tree_size: 0,
        relocation_tree_header: HexData([0; 0x10]),
        encryption_tree_offset: 0,
        encryption_tree_size: 0,
        encryption_tree_header: HexData([0; 0x10]),
    }
}

fn empty_sparse_info() -> SparseInfo {
    SparseInfo {
        meta_offset: 0,
        meta_size: 0,
        meta_header: HexData([0; 0x10]),
        physical_offset: 0,
        generation: 0,
    }
}

fn empty_compression_info() -> CompressionInfo {
    CompressionInfo {
        table_offset: 0,
        table_size: 0,
        table_header: HexData([0; 0x10]),
    }
}

/// Replaces `base_meta`'s sole `*.cnmt` file's content-entries list with
/// `new_contents` and re-emits the Meta NCA from scratch.
#[tracing::instrument(skip(key_set, base_meta, new_contents))]
pub fn build_meta_patch<S: ReadableStorage>(
    key_set: &KeySet,
    base_meta: &Nca<S>,
    new_contents: &[CnmtContentEntry],
) -> Result<VecStorage, MetaPatchError> {
    if base_meta.content_type() != NcaContentType::Meta {
        return Err(MetaPatchError::NotMeta);
    }

    let fs = base_meta
        .get_fs(NcaSectionType::Data, IntegrityCheckLevel::Full)
        .context(SectionOpenSnafu)?
        .ok_or(MetaPatchError::MissingDataSection)?;

    let cnmt_file = fs
        .root()
        .entries()
        .find_map(|entry| match entry {
            Entry::File(file) if file.name().ends_with(".cnmt") => Some(file),
            _ => None,
        })
        .ok_or(MetaPatchError::MissingCnmt)?;

    let cnmt_name = cnmt_file.name().to_string();
    let cnmt_storage = cnmt_file.storage().context(CnmtStorageOpenSnafu)?;
    let cnmt_bytes = cnmt_storage.read_all().context(CnmtReadSnafu)?;

    let mut cnmt = Cnmt::read(&mut Cursor::new(&cnmt_bytes)).context(CnmtParseSnafu)?;
    cnmt.content_entry_count = new_contents.len() as u16;
    cnmt.meta_tables.content_entries = new_contents.to_vec();

    let mut new_cnmt_bytes = Vec::new();
    cnmt.write(&mut Cursor::new(&mut new_cnmt_bytes))
        .context(CnmtWriteSnafu)?;

    let pfs0_bytes = pfs::write_pfs0(&[(&cnmt_name, &new_cnmt_bytes)]);

    let hash_table = sha256_hash_table(&pfs0_bytes, META_HASH_BLOCK_SIZE);
    let master_hash = crate::crypto::sha256(&hash_table);

    let data_offset = (hash_table.len() as u64 + HASH_TABLE_ALIGNMENT - 1) / HASH_TABLE_ALIGNMENT
        * HASH_TABLE_ALIGNMENT;

    let mut section_content = vec![0u8; data_offset as usize + pfs0_bytes.len()];
    section_content[..hash_table.len()].copy_from_slice(&hash_table);
    section_content[data_offset as usize..].copy_from_slice(&pfs0_bytes);

    let mut level_info = [Sha256IntegrityInfoLevel { offset: 0, size: 0 }; 6];
    level_info[0] = Sha256IntegrityInfoLevel {
        offset: 0,
        size: hash_table.len() as u64,
    };
    level_info[1] = Sha256IntegrityInfoLevel {
        offset: data_offset,
        size: pfs0_bytes.len() as u64,
    };

    let fs_header = NcaFsHeader {
        version: 2,
        format_type: NcaFormatType::Pfs0,
        hash_type: NcaHashType::Sha256,
        encryption_type: NcaEncryptionType::None,
        integrity_info: IntegrityInfo::Sha256(Sha256IntegrityInfo {
            master_hash: Sha256Hash(HexData(master_hash)),
            block_size: META_HASH_BLOCK_SIZE,
            level_count: 2,
            level_info,
        }),
        patch_info: empty_patch_info(),
        upper_counter: 0,
        sparse_info: empty_sparse_info(),
        compression_info: empty_compression_info(),
    };

    let mut header = base_meta.headers.nca_header;
    header.section_table = [SectionTableEntry {
        start: 0u64.into(),
        end: 0u64.into(),
        is_enabled: false,
    }; 4];

    let section_start = ALL_HEADERS_SIZE as u64;
    let section_end = section_start + section_content.len() as u64;
    let aligned_end = (section_end + 0x1ff) / 0x200 * 0x200;
    header.section_table[0] = SectionTableEntry {
        start: section_start.into(),
        end: aligned_end.into(),
        is_enabled: true,
    };
    header.nca_size = aligned_end;

    let mut fs_header_bytes = [0u8; 0x200];
    {
        let mut cur = Cursor::new(&mut fs_header_bytes[..]);
        fs_header
            .write(&mut cur)
            .expect("NcaFsHeader is a fixed-size plain struct");
    }
    let mut fs_header_hashes = [Sha256Hash(HexData([0; 0x20])); 4];
    fs_header_hashes[0] = Sha256Hash(HexData(crate::crypto::sha256(&fs_header_bytes)));
    header.fs_header_hashes = fs_header_hashes;

    let mut header_bytes = [0u8; ALL_HEADERS_SIZE];
    {
        let (header_region, fs_region) = header_bytes.split_at_mut(NCA_HEADER_SIZE);
        let mut cur = Cursor::new(&mut *header_region);
        header
            .write(&mut cur)
            .expect("NcaHeader is a fixed-size plain struct");
        fs_region[..0x200].copy_from_slice(&fs_header_bytes);
    }

    let header_key = key_set.header_key().context(MissingKeySnafu)?;
    {
        let (header_region, fs_region) = header_bytes.split_at_mut(NCA_HEADER_SIZE);
        header_key.encrypt(header_region, 0, HEADER_SECTOR_SIZE);
        header_key.encrypt(fs_region, 2, HEADER_SECTOR_SIZE);
    }

    let mut out = Vec::with_capacity(aligned_end as usize);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&section_content);
    out.resize(aligned_end as usize, 0);

    Ok(VecStorage::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::cnmt::{
        CnmtMetaTables, ContentMetaAttribute, ContentMetaType, ContentType, TypeSpecificContentMeta,
    };
    use crate::formats::nca::structs::{
        DistributionType, NcaContentType, NcaHashType, NcaHeader, NcaKeyArea, NcaMagic,
        NcaSignature,
    };
    use crate::ids::NcaId;

    fn test_key_set() -> KeySet {
        KeySet::from_file_contents(&format!("header_key = {}\n", "0".repeat(64)), "").unwrap()
    }

    fn zero_title_id() -> crate::ids::TitleId {
        crate::ids::TitleId::read(&mut Cursor::new([0u8; 8])).unwrap()
    }

    fn zero_nca_id() -> NcaId {
        NcaId::read(&mut Cursor::new([0u8; 0x10])).unwrap()
    }

    fn zero_rights_id() -> crate::ids::RightsId {
        crate::ids::RightsId::read(&mut Cursor::new([0u8; 0x10])).unwrap()
    }

    fn zero_key_area() -> NcaKeyArea {
        NcaKeyArea::read(&mut Cursor::new([0u8; 0x100])).unwrap()
    }

    fn sample_cnmt(entries: Vec<CnmtContentEntry>) -> Cnmt {
        Cnmt {
            title_id: zero_title_id(),
            version: 1,
            ty: ContentMetaType::Application,
            field_d: 0,
            table_offset: 0x10,
            content_entry_count: entries.len() as u16,
            meta_entry_count: 0,
            content_meta_attributes: ContentMetaAttribute::empty(),
            type_specific: TypeSpecificContentMeta::Application {
                patch_title_id: zero_title_id(),
                minimum_system_version: 0,
            },
            meta_tables: CnmtMetaTables {
                content_entries: entries,
                meta_entries: Vec::new(),
                extended_data: None,
                hash: HexData([0; 0x20]),
            },
        }
    }

    /// Builds an unencrypted Meta NCA whose sole Data section is a PFS0
    /// holding one `*.cnmt` file, SHA-256-hashed at block size 0x200 (the base
    /// fixture's hashing granularity is unrelated to `META_HASH_BLOCK_SIZE`,
    /// which only governs the rebuilt output).
    fn build_meta_nca(cnmt: &Cnmt) -> VecStorage {
        build_nca_with_content_type(cnmt, NcaContentType::Meta)
    }

    fn build_nca_with_content_type(cnmt: &Cnmt, content_type: NcaContentType) -> VecStorage {
        let mut cnmt_bytes = Vec::new();
        cnmt.write(&mut Cursor::new(&mut cnmt_bytes)).unwrap();

        let pfs0_bytes = pfs::write_pfs0(&[("0000000000000000.cnmt", &cnmt_bytes)]);

        let hash_table = sha256_hash_table(&pfs0_bytes, 0x200);
        let master_hash = crate::crypto::sha256(&hash_table);
        let data_offset = 0x200u64;
        let mut section_content = vec![0u8; data_offset as usize + pfs0_bytes.len()];
        section_content[..hash_table.len()].copy_from_slice(&hash_table);
        section_content[data_offset as usize..].copy_from_slice(&pfs0_bytes);

        let mut level_info = [Sha256IntegrityInfoLevel { offset: 0, size: 0 }; 6];
        level_info[0] = Sha256IntegrityInfoLevel {
            offset: 0,
            size: hash_table.len() as u64,
        };
        level_info[1] = Sha256IntegrityInfoLevel {
            offset: data_offset,
            size: pfs0_bytes.len() as u64,
        };

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
            patch_info: empty_patch_info(),
            upper_counter: 0,
            sparse_info: empty_sparse_info(),
            compression_info: empty_compression_info(),
        };

        let mut header = NcaHeader {
            fixed_key_signature: NcaSignature(HexData([0; 0x100])),
            npdm_signature: NcaSignature(HexData([0; 0x100])),
            magic: NcaMagic::Nca3,
            distribution_type: DistributionType::Download,
            content_type,
            key_generation_1: 0,
            key_area_key_index: crate::crypto::keyset::KeyAreaKeyIndex::Application,
            nca_size: 0,
            title_id: zero_title_id(),
            content_index: 0,
            sdk_version: 0,
            key_generation_2: 0,
            rights_id: zero_rights_id(),
            section_table: [SectionTableEntry {
                start: 0u64.into(),
                end: 0u64.into(),
                is_enabled: false,
            }; 4],
            fs_header_hashes: [Sha256Hash(HexData([0; 0x20])); 4],
            key_area: zero_key_area(),
        };

        let section_start = ALL_HEADERS_SIZE as u64;
        let section_end = section_start + section_content.len() as u64;
        let aligned_end = (section_end + 0x1ff) / 0x200 * 0x200;
        header.section_table[0] = SectionTableEntry {
            start: section_start.into(),
            end: aligned_end.into(),
            is_enabled: true,
        };
        header.nca_size = aligned_end;

        let mut fs_header_bytes = [0u8; 0x200];
        {
            let mut cur = Cursor::new(&mut fs_header_bytes[..]);
            fs_header.write(&mut cur).unwrap();
        }
        header.fs_header_hashes[0] = Sha256Hash(HexData(crate::crypto::sha256(&fs_header_bytes)));

        let mut bytes = vec![0u8; aligned_end as usize];
        {
            let mut cur = Cursor::new(&mut bytes[0..0x400]);
            header.write(&mut cur).unwrap();
        }
        bytes[0x400..0x600].copy_from_slice(&fs_header_bytes);
        bytes[section_start as usize..section_start as usize + section_content.len()]
            .copy_from_slice(&section_content);

        VecStorage::new(bytes)
    }

    #[test]
    fn rejects_non_meta_content() {
        let key_set = test_key_set();
        let cnmt = sample_cnmt(Vec::new());
        let base = Nca::new(
            &key_set,
            build_nca_with_content_type(&cnmt, NcaContentType::Control),
        )
        .unwrap();

        let err = build_meta_patch(&key_set, &base, &[]).unwrap_err();
        assert!(matches!(err, MetaPatchError::NotMeta));
    }

    #[test]
    fn rewrites_content_entries_and_round_trips() {
        let key_set = test_key_set();
        let old_entry = CnmtContentEntry {
            hash: HexData([0x11; 0x20]),
            nca_id: zero_nca_id(),
            size: 0x1000,
            ty: ContentType::Program,
        };
        let cnmt = sample_cnmt(vec![old_entry]);
        let base = Nca::new(&key_set, build_meta_nca(&cnmt)).unwrap();

        let mut new_nca_id_bytes = [0u8; 0x10];
        new_nca_id_bytes[0] = 0xab;
        let new_entry = CnmtContentEntry {
            hash: HexData([0x22; 0x20]),
            nca_id: NcaId::read(&mut Cursor::new(new_nca_id_bytes)).unwrap(),
            size: 0x2000,
            ty: ContentType::Control,
        };

        let patched_storage = build_meta_patch(&key_set, &base, &[new_entry]).unwrap();
        let patched = Nca::new(&key_set, patched_storage).unwrap();
        assert_eq!(patched.content_type(), NcaContentType::Meta);

        let fs = patched
            .get_fs(NcaSectionType::Data, IntegrityCheckLevel::Full)
            .unwrap()
            .unwrap();
        let cnmt_file = fs
            .root()
            .entries()
            .find_map(|entry| match entry {
                Entry::File(file) if file.name().ends_with(".cnmt") => Some(file),
                _ => None,
            })
            .unwrap();
        let cnmt_bytes = cnmt_file.storage().unwrap().read_all().unwrap();
        let reparsed = Cnmt::read(&mut Cursor::new(&cnmt_bytes)).unwrap();

        assert_eq!(reparsed.content_entry_count, 1);
        assert_eq!(reparsed.meta_tables.content_entries, vec![new_entry]);
    }

    #[test]
    fn carries_over_signatures_verbatim() {
        let key_set = test_key_set();
        let cnmt = sample_cnmt(Vec::new());
        let base = Nca::new(&key_set, build_meta_nca(&cnmt)).unwrap();

        let patched_storage = build_meta_patch(&key_set, &base, &[]).unwrap();
        let patched = Nca::new(&key_set, patched_storage).unwrap();

        assert_eq!(
            patched.fixed_key_signature_verdict(),
            base.fixed_key_signature_verdict()
        );
    }
}
