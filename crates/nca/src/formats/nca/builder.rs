//! Merges a base NCA with an update (patch) NCA into a new, lazily-assembled
//! NCA byte stream: same header/FsHeader shape, sections drawn from whichever
//! side contributed them, RomFS sections recomposed via the patch's
//! relocation tree.
//!
//! Built sections are never re-encrypted with fresh key material -- that's
//! outside this crate's scope, which only ever reads and recomposes existing
//! ciphertext, never synthesizes new. Every merged section is instead emitted
//! as cleartext (`encryption_type = None`); the merged NCA's own FsHeader
//! says so, so opening it back up via [`Nca::new`] reads the composed bytes
//! directly, no content key needed at all. The header itself still gets a
//! real AES-XTS re-encryption pass (that key is the keyset's `header_key`,
//! unrelated to section content), and `fixed_key_signature`/`npdm_signature`
//! are carried over verbatim from the base NCA: lacking Nintendo's signing
//! key, the carried-over signature just reads back as `Invalid`/`NotChecked`
//! on reopen rather than `Valid` -- never claimed, never forged.

use binrw::BinWrite;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use super::contents::{PatchedSectionStorage, RawDecryptedSectionStorage, SectionOpenError};
use super::structs::{
    CompressionInfo, NcaEncryptionType, NcaFsHeader, NcaHeader, PatchInfo, SectionTableEntry,
    Sha256Hash, SparseInfo,
};
use super::{Nca, NcaContentType, ALL_HEADERS_SIZE, HEADER_SECTOR_SIZE, NCA_HEADER_SIZE};
use crate::crypto::keyset::{KeySet, MissingKeyError};
use crate::hexstring::HexData;
use crate::storage::{ConcatStorageN, NullStorage, ReadableStorage, StorageError, VecStorage};

/// Sections are laid out back to back, each padded with zeroes up to this boundary.
pub const SECTION_ALIGNMENT: u64 = 0x200;

#[derive(Snafu, Debug)]
pub enum BuilderError {
    #[snafu(display("build_merged only supports Program-content NCAs"))]
    NotProgram,
    #[snafu(display(
        "patch declares section {} as a relocation patch but the base has no matching section",
        index
    ))]
    MissingBaseSection { index: usize },
    #[snafu(display("section {} is already present in the builder", index))]
    AlreadyAdded { index: usize },
    #[snafu(display("builder precondition violated: {}", reason))]
    PreconditionViolation { reason: String },
    #[snafu(display("failed to open a section while building: {}", source))]
    SectionOpen { source: SectionOpenError },
    #[snafu(display("storage error while building: {}", source))]
    Storage { source: StorageError },
    #[snafu(display("missing a crypto key: {}", source))]
    MissingKey { source: MissingKeyError },
}

/// A section's content as assembled by the builder: copied verbatim from one
/// side, or recomposed from both.
#[derive(Debug)]
pub enum BuiltSection<B: ReadableStorage, P: ReadableStorage> {
    Base(RawDecryptedSectionStorage<B>),
    Patch(RawDecryptedSectionStorage<P>),
    Composed(PatchedSectionStorage<RawDecryptedSectionStorage<B>, RawDecryptedSectionStorage<P>>),
}

impl<B: ReadableStorage, P: ReadableStorage> ReadableStorage for BuiltSection<B, P> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            BuiltSection::Base(s) => s.read(offset, buf),
            BuiltSection::Patch(s) => s.read(offset, buf),
            BuiltSection::Composed(s) => s.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            BuiltSection::Base(s) => s.get_size(),
            BuiltSection::Patch(s) => s.get_size(),
            BuiltSection::Composed(s) => s.get_size(),
        }
    }
}

/// The pieces `build_merged` concatenates into the final byte stream: the
/// freshly re-encrypted header, each section in turn, and zero-fill padding
/// out to the next `SECTION_ALIGNMENT` boundary between them.
#[derive(Debug)]
pub enum BuilderSegment<B: ReadableStorage, P: ReadableStorage> {
    Header(VecStorage),
    Section(BuiltSection<B, P>),
    Pad(NullStorage),
}

impl<B: ReadableStorage, P: ReadableStorage> ReadableStorage for BuilderSegment<B, P> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        match self {
            BuilderSegment::Header(s) => s.read(offset, buf),
            BuilderSegment::Section(s) => s.read(offset, buf),
            BuilderSegment::Pad(s) => s.read(offset, buf),
        }
    }

    fn get_size(&self) -> u64 {
        match self {
            BuilderSegment::Header(s) => s.get_size(),
            BuilderSegment::Section(s) => s.get_size(),
            BuilderSegment::Pad(s) => s.get_size(),
        }
    }
}

/// The complete byte stream `build_merged` produces: a fresh header followed
/// by the merged sections. Feed it to [`Nca::new`] to mount it.
pub type MergedNcaStorage<B, P> = ConcatStorageN<BuilderSegment<B, P>>;

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

/// Clears everything marking `fs_header`'s section as patched/sparse/compressed and
/// declares it plaintext: whatever storage ends up at this section's offset in the
/// merged file must be read back verbatim, with no further transform applied.
fn strip_to_plain_section(mut fs_header: NcaFsHeader) -> NcaFsHeader {
    fs_header.patch_info = empty_patch_info();
    fs_header.sparse_info = empty_sparse_info();
    fs_header.compression_info = empty_compression_info();
    fs_header.encryption_type = NcaEncryptionType::None;
    fs_header.upper_counter = 0;
    fs_header
}

struct PlannedSection<B: ReadableStorage, P: ReadableStorage> {
    fs_header: NcaFsHeader,
    content: BuiltSection<B, P>,
}

fn plan_section<B: ReadableStorage, P: ReadableStorage>(
    index: usize,
    base: &Nca<B>,
    patch: &Nca<P>,
) -> Result<Option<PlannedSection<B, P>>, BuilderError> {
    let base_entry = base.headers.nca_header.section_table[index];
    let patch_entry = patch.headers.nca_header.section_table[index];

    if patch_entry.is_enabled {
        let patch_fs_header = *patch.headers.fs_headers[index].as_ref().unwrap();

        if patch_fs_header.is_patch_section() {
            if !base_entry.is_enabled {
                return Err(BuilderError::MissingBaseSection { index });
            }

            let base_storage = base
                .get_raw_decrypted_section_storage(index)
                .context(SectionOpenSnafu)?
                .expect("base_entry.is_enabled just checked");

            let composed = patch
                .get_patched_section_storage(index, base_storage)
                .context(SectionOpenSnafu)?
                .expect("patch_entry.is_enabled just checked");

            Ok(Some(PlannedSection {
                fs_header: strip_to_plain_section(patch_fs_header),
                content: BuiltSection::Composed(composed),
            }))
        } else {
            let patch_storage = patch
                .get_raw_decrypted_section_storage(index)
                .context(SectionOpenSnafu)?
                .expect("patch_entry.is_enabled just checked");

            Ok(Some(PlannedSection {
                fs_header: strip_to_plain_section(patch_fs_header),
                content: BuiltSection::Patch(patch_storage),
            }))
        }
    } else if base_entry.is_enabled {
        let base_fs_header = *base.headers.fs_headers[index].as_ref().unwrap();
        let base_storage = base
            .get_raw_decrypted_section_storage(index)
            .context(SectionOpenSnafu)?
            .expect("base_entry.is_enabled just checked");

        Ok(Some(PlannedSection {
            fs_header: strip_to_plain_section(base_fs_header),
            content: BuiltSection::Base(base_storage),
        }))
    } else {
        Ok(None)
    }
}

/// Drives the merge step by step: `Init`/`HeaderCopied` is `NcaBuilder::new`, each
/// `add_section` call is one `SectionsAdded` transition, and `finish` collapses
/// `HashesFinalized -> HeaderEncrypted -> Sealed` into one pass over the staged
/// sections. Re-adding an index that already has staged content is the one
/// fatal user error this surface can produce (`AlreadyAdded`); everything else
/// is either precondition-checked up front by `new` or infallible arithmetic.
pub struct NcaBuilder<B: ReadableStorage, P: ReadableStorage> {
    header: NcaHeader,
    sections: [Option<PlannedSection<B, P>>; 4],
}

impl<B: ReadableStorage, P: ReadableStorage> NcaBuilder<B, P> {
    /// Validates both inputs are Program-content NCAs and copies the base header as the
    /// starting point for the merged one (signatures included, verbatim).
    pub fn new(base: &Nca<B>, patch: &Nca<P>) -> Result<Self, BuilderError> {
        if base.content_type() != NcaContentType::Program
            || patch.content_type() != NcaContentType::Program
        {
            return Err(BuilderError::NotProgram);
        }

        let mut header = base.headers.nca_header;
        header.key_generation_1 = header
            .key_generation_1
            .max(patch.headers.nca_header.key_generation_1);
        header.key_generation_2 = header
            .key_generation_2
            .max(patch.headers.nca_header.key_generation_2);

        Ok(Self {
            header,
            sections: [None, None, None, None],
        })
    }

    /// Stages section `index`'s content, picked from `base`/`patch` by the same rule
    /// [`Nca::get_section_storage_with_base`] uses for read-only mounting. Fatal
    /// `AlreadyAdded` if this index was already staged.
    pub fn add_section(
        &mut self,
        index: usize,
        base: &Nca<B>,
        patch: &Nca<P>,
    ) -> Result<(), BuilderError> {
        if self.sections[index].is_some() {
            return Err(BuilderError::AlreadyAdded { index });
        }

        self.sections[index] = plan_section(index, base, patch)?;
        Ok(())
    }

    /// Lays out the staged sections back to back, recomputes their FsHeader hashes,
    /// re-encrypts the header, and assembles the final byte stream.
    pub fn finish(mut self, key_set: &KeySet) -> Result<MergedNcaStorage<B, P>, BuilderError> {
        let mut segments: Vec<BuilderSegment<B, P>> = Vec::new();
        let mut section_table = [SectionTableEntry {
            start: 0u64.into(),
            end: 0u64.into(),
            is_enabled: false,
        }; 4];
        let mut fs_headers: [Option<NcaFsHeader>; 4] = [None, None, None, None];

        let mut running_offset = ALL_HEADERS_SIZE as u64;
        for (index, planned_section) in self.sections.into_iter().enumerate() {
            let Some(PlannedSection { fs_header, content }) = planned_section else {
                continue;
            };

            let size = content.get_size();
            let start = running_offset;
            let end = start + size;
            let aligned_end =
                (end + SECTION_ALIGNMENT - 1) / SECTION_ALIGNMENT * SECTION_ALIGNMENT;

            section_table[index] = SectionTableEntry {
                start: start.into(),
                end: aligned_end.into(),
                is_enabled: true,
            };
            fs_headers[index] = Some(fs_header);

            segments.push(BuilderSegment::Section(content));
            if aligned_end > end {
                segments.push(BuilderSegment::Pad(NullStorage::new(aligned_end - end)));
            }

            running_offset = aligned_end;
        }

        self.header.section_table = section_table;
        self.header.nca_size = running_offset;

        let mut fs_header_hashes = [Sha256Hash(HexData([0; 0x20])); 4];
        let mut fs_header_bytes = [[0u8; 0x200]; 4];
        for (index, fs_header) in fs_headers.iter().enumerate() {
            if let Some(fs_header) = fs_header {
                let mut cur = Cursor::new(&mut fs_header_bytes[index][..]);
                fs_header
                    .write(&mut cur)
                    .expect("NcaFsHeader is a fixed-size plain struct");
                fs_header_hashes[index] =
                    Sha256Hash(HexData(crate::crypto::sha256(&fs_header_bytes[index])));
            }
        }
        self.header.fs_header_hashes = fs_header_hashes;

        let mut header_bytes = [0u8; ALL_HEADERS_SIZE];
        {
            let (header_region, fs_region) = header_bytes.split_at_mut(NCA_HEADER_SIZE);
            let mut cur = Cursor::new(&mut *header_region);
            self.header
                .write(&mut cur)
                .expect("NcaHeader is a fixed-size plain struct");
            for (index, bytes) in fs_header_bytes.iter().enumerate() {
                if fs_headers[index].is_some() {
                    fs_region[index * 0x200..(index + 1) * 0x200].copy_from_slice(bytes);
                }
            }
        }

        let header_key = key_set.header_key().context(MissingKeySnafu)?;
        {
            let (header_region, fs_region) = header_bytes.split_at_mut(NCA_HEADER_SIZE);
            header_key.encrypt(header_region, 0, HEADER_SECTOR_SIZE);
            header_key.encrypt(fs_region, 2, HEADER_SECTOR_SIZE);
        }

        let mut all_segments = Vec::with_capacity(segments.len() + 1);
        all_segments.push(BuilderSegment::Header(VecStorage::new(header_bytes.to_vec())));
        all_segments.extend(segments);

        Ok(ConcatStorageN::new(all_segments))
    }
}

/// Merges a base NCA with its update into a new lazily-assembled NCA byte
/// stream. Per section: an update-only section (ExeFS/Code) is copied from
/// the patch, a base-only section (Logo) is copied from the base, and a
/// section the patch marks as a relocation patch (RomFS) is recomposed over
/// the matching base section using the patch's own relocation tree -- the
/// same composition [`Nca::get_patched_section_storage`] already produces
/// for read-only mounting, baked into a concrete byte range here.
///
/// The returned storage is a complete, still-unopened NCA. Drives
/// [`NcaBuilder`] through all four sections in order; callers that need finer
/// control (e.g. to stop after staging one section) can drive it directly.
#[tracing::instrument(skip(key_set, base, patch))]
pub fn build_merged<B: ReadableStorage, P: ReadableStorage>(
    key_set: &KeySet,
    base: &Nca<B>,
    patch: &Nca<P>,
) -> Result<MergedNcaStorage<B, P>, BuilderError> {
    let mut builder = NcaBuilder::new(base, patch)?;
    for index in 0..4 {
        builder.add_section(index, base, patch)?;
    }
    builder.finish(key_set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::nca::structs::{
        DistributionType, IntegrityInfo, NcaContentType, NcaFormatType, NcaFsHeader, NcaHashType,
        NcaHeader, NcaKeyArea, NcaMagic, NcaSignature,
    };
    use crate::ids::{RightsId, TitleId};
    use crate::storage::{ReadableStorageExt, VecStorage};
    use binrw::{BinRead, BinWrite};

    fn test_key_set() -> KeySet {
        KeySet::from_file_contents(&format!("header_key = {}\n", "0".repeat(64)), "").unwrap()
    }

    /// Reads a value straight out of all-zero bytes, for header sub-structs (title id,
    /// rights id, key area) whose fields are private to the crypto/id modules and so
    /// can't be built with a struct literal from here.
    fn zero_title_id() -> TitleId {
        let mut cur = Cursor::new([0u8; 8]);
        TitleId::read(&mut cur).unwrap()
    }

    fn zero_rights_id() -> RightsId {
        let mut cur = Cursor::new([0u8; 0x10]);
        RightsId::read(&mut cur).unwrap()
    }

    fn zero_key_area() -> NcaKeyArea {
        let mut cur = Cursor::new([0u8; 0x100]);
        NcaKeyArea::read(&mut cur).unwrap()
    }

    fn empty_section_entry() -> SectionTableEntry {
        SectionTableEntry {
            start: 0u64.into(),
            end: 0u64.into(),
            is_enabled: false,
        }
    }

    fn plain_data_fs_header() -> NcaFsHeader {
        NcaFsHeader {
            version: 2,
            format_type: NcaFormatType::Romfs,
            hash_type: NcaHashType::None,
            encryption_type: NcaEncryptionType::None,
            integrity_info: IntegrityInfo::None,
            patch_info: empty_patch_info(),
            upper_counter: 0,
            sparse_info: empty_sparse_info(),
            compression_info: empty_compression_info(),
        }
    }

    /// Builds an unencrypted, signature-less NCA3 directly in memory, one plain-data
    /// section per `Some` entry of `sections`: `Nca::new` accepts already-decrypted
    /// headers as-is (no header key needed).
    fn build_plaintext_nca(content_type: NcaContentType, sections: [Option<&[u8]>; 4]) -> VecStorage {
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
            section_table: [empty_section_entry(); 4],
            fs_header_hashes: [Sha256Hash(HexData([0; 0x20])); 4],
            key_area: zero_key_area(),
        };

        let mut fs_header_bytes = [[0u8; 0x200]; 4];
        let mut running = 0xc00u64;
        let mut body = Vec::new();

        for (index, data) in sections.into_iter().enumerate() {
            let Some(data) = data else { continue };

            let mut bytes = [0u8; 0x200];
            {
                let mut cur = Cursor::new(&mut bytes[..]);
                plain_data_fs_header().write(&mut cur).unwrap();
            }
            fs_header_bytes[index] = bytes;

            let start = running;
            let end = start + data.len() as u64;
            let aligned_end = (end + 0x1ff) / 0x200 * 0x200;

            header.section_table[index] = SectionTableEntry {
                start: start.into(),
                end: aligned_end.into(),
                is_enabled: true,
            };
            header.fs_header_hashes[index] = Sha256Hash(HexData(crate::crypto::sha256(&bytes)));

            body.resize((aligned_end - 0xc00) as usize, 0);
            let rel_start = (start - 0xc00) as usize;
            body[rel_start..rel_start + data.len()].copy_from_slice(data);

            running = aligned_end;
        }

        header.nca_size = running;

        let mut bytes = vec![0u8; running as usize];
        {
            let mut cur = Cursor::new(&mut bytes[0..0x400]);
            header.write(&mut cur).unwrap();
        }
        for (index, fs_bytes) in fs_header_bytes.iter().enumerate() {
            bytes[0x400 + index * 0x200..0x400 + (index + 1) * 0x200].copy_from_slice(fs_bytes);
        }
        bytes[0xc00..].copy_from_slice(&body);

        VecStorage::new(bytes)
    }

    #[test]
    fn rejects_non_program_content() {
        let key_set = test_key_set();
        let base = Nca::new(
            &key_set,
            build_plaintext_nca(NcaContentType::Control, [Some(&b"base"[..]), None, None, None]),
        )
        .unwrap();
        let patch = Nca::new(
            &key_set,
            build_plaintext_nca(NcaContentType::Control, [Some(&b"patch"[..]), None, None, None]),
        )
        .unwrap();

        let err = build_merged(&key_set, &base, &patch).unwrap_err();
        assert!(matches!(err, BuilderError::NotProgram));
    }

    fn program_fixture(code: &'static [u8], data: &'static [u8]) -> VecStorage {
        build_plaintext_nca(NcaContentType::Program, [Some(code), Some(data), None, None])
    }

    #[test]
    fn already_added_is_fatal() {
        let key_set = test_key_set();
        let base = Nca::new(&key_set, program_fixture(b"code-base", b"data-base")).unwrap();
        let patch = Nca::new(&key_set, program_fixture(b"code-patch", b"data-patch")).unwrap();

        let mut builder = NcaBuilder::new(&base, &patch).unwrap();
        builder.add_section(0, &base, &patch).unwrap();
        let err = builder.add_section(0, &base, &patch).unwrap_err();
        assert!(matches!(err, BuilderError::AlreadyAdded { index: 0 }));
    }

    #[test]
    fn merges_plain_sections_from_patch() {
        let key_set = test_key_set();
        let base = Nca::new(&key_set, program_fixture(b"code-base", b"data-base")).unwrap();
        let patch = Nca::new(&key_set, program_fixture(b"code-patch", b"data-patch")).unwrap();

        let merged_storage = build_merged(&key_set, &base, &patch).unwrap();
        let merged = Nca::new(&key_set, merged_storage).unwrap();

        assert_eq!(merged.content_type(), NcaContentType::Program);

        let code = merged.get_raw_decrypted_section_storage(0).unwrap().unwrap();
        assert_eq!(code.read_all().unwrap(), b"code-patch");

        let data = merged.get_raw_decrypted_section_storage(1).unwrap().unwrap();
        assert_eq!(data.read_all().unwrap(), b"data-patch");
    }
}
