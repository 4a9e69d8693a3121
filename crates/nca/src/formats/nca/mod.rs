mod builder;
mod contents;
mod crypt_storage;
pub mod filesystem;
mod meta_patch;
mod patch;
mod structs;
mod verification_storage;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use crate::crypto::keyset::KeySet;
use crate::crypto::{AesKey, AesXtsKey, SignatureVerifyError};
use crate::formats::nca::structs::{NcaFsHeader, NcaHeader, NcaMagic};
use crate::storage::{ReadableStorage, ReadableStorageExt, SharedStorage, StorageError};

pub use builder::{
    build_merged, BuilderError, BuilderSegment, BuiltSection, MergedNcaStorage, NcaBuilder,
};
pub use contents::{
    MountedSectionFileSystem, MountedSectionStorage, PatchedSectionStorage,
    RawDecryptedSectionStorage, RawEncryptedSectionStorage, SectionFileSystem, SectionOpenError,
    SectionRange, SectionValidity, VerifiedSectionStorage,
};
pub use crypt_storage::NcaCryptStorage;
pub use meta_patch::{build_meta_patch, MetaPatchError, META_HASH_BLOCK_SIZE};
pub use patch::{BucketTree, BucketTreeEntry, BucketTreeError, IndirectSource, IndirectStorage};
pub use structs::{NcaContentType, NcaSectionType};
pub use verification_storage::{IntegrityCheckLevel, IntegrityStorageType, NcaVerificationStorage};

#[derive(Snafu, Debug)]
pub enum NcaError {
    #[snafu(display("NCA: failed to read from the storage: {}", source))]
    Storage { source: StorageError },
    #[snafu(display("NCA: missing a crypto key: {}", source))]
    MissingKey {
        source: crate::crypto::keyset::MissingKeyError,
    },
    #[snafu(display("NCA: missing a title key: {}", source))]
    MissingTitleKey {
        source: crate::crypto::keyset::MissingTitleKeyError,
    },
    #[snafu(display("NCA: NCA0 title but no nca0_rsa_private_key is present in the key set"))]
    MissingNca0Key,
    #[snafu(display("NCA: failed to RSA-OAEP decrypt the NCA0 key area: {}", source))]
    Nca0KeyAreaDecrypt {
        source: crate::crypto::RsaOaepDecryptError,
    },
    #[snafu(display("NCA: failed to parse the NCA header: {}", source))]
    NcaHeaderParsing { source: binrw::Error },
    #[snafu(display("NCA: failed to parse the NCA FS header for section {}: {}", index, source))]
    FsHeaderParsing { index: usize, source: binrw::Error },
    #[snafu(display("NCA: FS header hash mismatch for section {}", index))]
    FsHeaderHashMismatch { index: usize },
    #[snafu(display("NCA: invalid size: expected {}, got {}", expected, actual))]
    StorageSizeMismatch { expected: u64, actual: u64 },
    #[snafu(display("NCA: {:?} containers are not supported", magic))]
    UnsupportedVersion { magic: NcaMagic },
}

/// Outcome of checking a NCA's `fixed_key_signature` (RSA-2048-PSS over the header body)
/// against the platform's fixed public modulus.
///
/// Per the format, a failed or unchecked signature never prevents opening the archive;
/// it's surfaced for the caller to act on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SignatureVerdict {
    Valid,
    Invalid,
    /// No modulus was loaded in the `KeySet` to check against.
    NotChecked,
}

#[derive(Debug)]
struct AllNcaHeaders {
    pub nca_header: NcaHeader,
    pub fs_headers: [Option<NcaFsHeader>; 4],
    /// Bytes `[0x200, 0x400)` of the decrypted header, the region `fixed_key_signature` and
    /// `npdm_signature` are computed over.
    pub signed_region: [u8; 0x200],
}

impl AllNcaHeaders {
    pub fn has_rights_id(&self) -> bool {
        !self.nca_header.rights_id.is_empty()
    }

    pub fn master_key_revision(&self) -> u8 {
        std::cmp::max(
            self.nca_header.key_generation_1,
            self.nca_header.key_generation_2,
        )
        .saturating_sub(1)
    }
}

#[derive(Debug)]
enum NcaContentKeys {
    /// NCA is decrypted, no keys are needed.
    Plaintext,
    /// Keys that were decrypted from the key area for Normal crypto
    KeyArea { ctr: AesKey, xts: AesXtsKey },
    /// Decrypted key for the RightsId crypto obtained externally
    RightsId(AesKey),
    /// NCA0's legacy key area: the whole 0x100-byte area is a single
    /// RSA-OAEP(SHA-256) ciphertext rather than four key-area-key-wrapped keys.
    Nca0RsaOaep { ctr: AesKey, xts: AesXtsKey },
}

#[derive(Debug)]
pub struct Nca<S: ReadableStorage> {
    body: SharedStorage<S>,
    headers: AllNcaHeaders,
    content_key: NcaContentKeys,
    fixed_key_signature_verdict: SignatureVerdict,
}

const ALL_HEADERS_SIZE: usize = 0xc00;
const NCA_HEADER_SIZE: usize = 0x400;
const HEADER_SECTOR_SIZE: usize = 0x200;

impl<S: ReadableStorage> Nca<S> {
    #[tracing::instrument(skip(key_set, storage))]
    pub fn new(key_set: &KeySet, storage: S) -> Result<Self, NcaError> {
        let (headers, is_decrypted) = Self::parse_headers(key_set, &storage)?;

        let fixed_key_signature_verdict = match key_set.fixed_key_modulus() {
            Some(modulus) => {
                match Self::verify_signature(modulus, &headers) {
                    Ok(()) => {
                        tracing::debug!("fixed-key signature valid");
                        SignatureVerdict::Valid
                    }
                    Err(source) => {
                        tracing::warn!(%source, "fixed-key signature invalid");
                        SignatureVerdict::Invalid
                    }
                }
            }
            None => SignatureVerdict::NotChecked,
        };

        let content_key = if is_decrypted {
            NcaContentKeys::Plaintext
        } else if headers.nca_header.magic == NcaMagic::Nca0 {
            let private_key = key_set.nca0_rsa_private_key().ok_or(NcaError::MissingNca0Key)?;
            let ciphertext = headers.nca_header.key_area.to_bytes();
            let plaintext = crate::crypto::decrypt_rsa_oaep(private_key, &ciphertext)
                .context(Nca0KeyAreaDecryptSnafu)?;
            if plaintext.len() < 0x30 {
                return Err(NcaError::MissingNca0Key);
            }

            let mut ctr_bytes = [0u8; 0x10];
            let mut xts_bytes = [0u8; 0x20];
            ctr_bytes.copy_from_slice(&plaintext[0x00..0x10]);
            xts_bytes.copy_from_slice(&plaintext[0x10..0x30]);

            NcaContentKeys::Nca0RsaOaep {
                ctr: AesKey::from_bytes(ctr_bytes),
                xts: AesXtsKey::from_bytes(xts_bytes),
            }
        } else if headers.has_rights_id() {
            let title_key = key_set
                .title_key(&headers.nca_header.rights_id)
                .context(MissingTitleKeySnafu)?;

            let title_kek = key_set
                .title_kek(headers.master_key_revision())
                .context(MissingKeySnafu)?;

            NcaContentKeys::RightsId(title_key.decrypt(title_kek))
        } else {
            let kak = key_set
                .key_area_key(
                    headers.master_key_revision(),
                    headers.nca_header.key_area_key_index,
                )
                .context(MissingKeySnafu)?;

            let ctr = kak.decrypt_key(headers.nca_header.key_area.encrypted_ctr_key);
            let xts = kak.decrypt_xts_key(headers.nca_header.key_area.encrypted_xts_key);

            NcaContentKeys::KeyArea { ctr, xts }
        };

        let section_count = headers.fs_headers.iter().flatten().count();
        if headers.nca_header.content_type == NcaContentType::Program {
            assert!(matches!(section_count, 2 | 3)); // base NCA contain 3 sections, update NCA contain 2 sections (w/o the logo)
        } else {
            assert_eq!(section_count, 1);
        };

        let body = storage.shared();

        if headers.nca_header.nca_size != body.get_size() {
            return Err(NcaError::StorageSizeMismatch {
                expected: headers.nca_header.nca_size,
                actual: body.get_size(),
            });
        }

        Ok(Self {
            body,
            headers,
            content_key,
            fixed_key_signature_verdict,
        })
    }

    fn verify_signature(
        modulus: &[u8; 0x100],
        headers: &AllNcaHeaders,
    ) -> Result<(), SignatureVerifyError> {
        crate::crypto::verify_rsa_pss(
            modulus,
            &headers.nca_header.fixed_key_signature.0 .0,
            &headers.signed_region,
        )
    }

    /// Verifies `npdm_signature` against a RSA modulus derived from this title's NPDM, which
    /// this crate does not itself parse.
    pub fn verify_npdm_signature(&self, modulus: &[u8; 0x100]) -> Result<(), SignatureVerifyError> {
        crate::crypto::verify_rsa_pss(
            modulus,
            &self.headers.nca_header.npdm_signature.0 .0,
            &self.headers.signed_region,
        )
    }

    pub fn fixed_key_signature_verdict(&self) -> SignatureVerdict {
        self.fixed_key_signature_verdict
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self.content_key, NcaContentKeys::Plaintext)
    }

    fn try_parse_nca_header(header: &[u8]) -> Result<NcaHeader, NcaError> {
        assert_eq!(header.len(), NCA_HEADER_SIZE);
        let mut cur = Cursor::new(header);

        let res = NcaHeader::read(&mut cur).context(NcaHeaderParsingSnafu)?;
        assert_eq!(cur.position(), NCA_HEADER_SIZE as u64);
        Ok(res)
    }

    /// Just do the decryption, don't parse the full header yet.
    #[tracing::instrument(skip(key_set, storage))]
    fn parse_headers(key_set: &KeySet, storage: &S) -> Result<(AllNcaHeaders, bool), NcaError> {
        let mut headers_data = [0; ALL_HEADERS_SIZE];
        storage.read(0, &mut headers_data).context(StorageSnafu)?;

        let (nca_header_data, fs_header_data) = headers_data.split_at_mut(NCA_HEADER_SIZE);

        let mut is_decrypted = false;

        let nca_header = if let Ok(nca_header) = Self::try_parse_nca_header(nca_header_data) {
            // if we were able to parse the NCA header, chances are it's not encrypted
            is_decrypted = true;
            nca_header
        } else {
            // else - perform the decryption
            let key = key_set.header_key().context(MissingKeySnafu)?;

            key.decrypt(nca_header_data, 0, HEADER_SECTOR_SIZE);

            let nca_header = Self::try_parse_nca_header(nca_header_data)?;

            match nca_header.magic {
                NcaMagic::Nca1 => return Err(NcaError::UnsupportedVersion { magic: NcaMagic::Nca1 }),
                // Nca0 and Nca2 both encrypt each fs header as if it was sector 0.
                NcaMagic::Nca0 | NcaMagic::Nca2 => {
                    for i in 0..4 {
                        key.decrypt(
                            &mut fs_header_data[i * HEADER_SECTOR_SIZE..],
                            0,
                            HEADER_SECTOR_SIZE,
                        );
                    }
                }
                NcaMagic::Nca3 => {
                    // decrypt the rest with normal sector numbers
                    key.decrypt(fs_header_data, 2, HEADER_SECTOR_SIZE);
                }
            }

            nca_header
        };

        let signed_region: [u8; 0x200] = nca_header_data[0x200..0x400].try_into().unwrap();

        let mut fs_headers = [None; 4];
        // parse the section fs headers
        for (index, data) in fs_header_data.chunks_exact(HEADER_SECTOR_SIZE).enumerate() {
            let section_entry = nca_header.section_table[index];

            if section_entry.is_enabled {
                let hash = nca_header.fs_header_hashes[index];
                hash.verify(data)
                    .map_err(|_| NcaError::FsHeaderHashMismatch { index })?;

                let mut cur = Cursor::new(data);

                fs_headers[index] =
                    Some(NcaFsHeader::read(&mut cur).context(FsHeaderParsingSnafu { index })?);
                assert_eq!(cur.position(), HEADER_SECTOR_SIZE as u64);
            }
        }

        Ok((
            AllNcaHeaders {
                nca_header,
                fs_headers,
                signed_region,
            },
            is_decrypted,
        ))
    }
}
impl<S: ReadableStorage> Nca<S> {
    pub fn content_type(&self) -> NcaContentType {
        self.headers.nca_header.content_type
    }
}
