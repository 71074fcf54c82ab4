//! Transparent BitLocker decryption filter.
//!
//! Sits between an image handle and a file-system parser: once unlocked,
//! reads against the volume come back as plaintext, including the volume
//! header that BitLocker relocates out of the way. The filter is built
//! over anything `Read + Seek`, so it stacks directly on [`crate::Image`]
//! or on a plain file.
//!
//! Unlocking walks the key chain (password → stretched key → VMK → FVEK)
//! against each of the three redundant FVE metadata blocks, keeping the
//! most actionable failure when all of them refuse.

pub mod crypt;
pub mod keys;
pub mod metadata;

use log::{debug, info, warn};
use std::io::{self, Read, Seek, SeekFrom};
use thiserror::Error;
use zeroize::Zeroize;

use crate::error::ImageError;
use crypt::{EncryptionType, SectorCipher};
use keys::{KeySource, PasswordHashes};
use metadata::{EntryPayload, FveBlockHeader, FveDataset, VolumeHeader, FVE_SIGNATURE};

/// Outcome of a failed unlock attempt, ordered so the bootstrap can keep
/// the most actionable one across the three metadata copies.
#[derive(Debug, Error)]
pub enum UnlockError {
    /// The signature probe failed; the volume is simply not BitLocker.
    #[error("not a BitLocker volume")]
    NotBitlocker,

    /// A supported protector exists but no usable password was supplied.
    #[error("a password or recovery password is required to unlock this volume")]
    NeedPassword,

    /// Key unwrapping failed its authenticity check.
    #[error("wrong password or recovery password")]
    WrongPassword,

    /// Every protector present is of a kind we cannot unwrap (TPM, …).
    #[error("unsupported key protection type(s): {}", .0.join(", "))]
    UnsupportedProtection(Vec<String>),

    /// Corruption or inconsistency in the FVE metadata.
    #[error("BitLocker metadata error: {0}")]
    General(String),

    /// The underlying image failed.
    #[error(transparent)]
    Image(#[from] ImageError),
}

impl UnlockError {
    /// Comma-separated list of the protection types encountered, when the
    /// failure was [`UnlockError::UnsupportedProtection`].
    pub fn unsupported_protection_types(&self) -> Option<String> {
        match self {
            UnlockError::UnsupportedProtection(kinds) => Some(kinds.join(", ")),
            _ => None,
        }
    }
}

/// Context set produced by one successful metadata-copy initialisation.
struct Unlocked {
    cipher: SectorCipher,
    encryption_type: EncryptionType,
    key_source: KeySource,
    volume_header_offset: u64,
    volume_header_size: u64,
    volume_size: u64,
}

/// A BitLocker volume unlocked over a readable body.
///
/// All offsets accepted by the read API are logical volume offsets; the
/// filter adds `volume_offset` when it touches the body, splits reads
/// that straddle the relocated volume header, and seeds each sector's
/// decryption with the physical offset BitLocker encrypted it under.
pub struct BitLocker<T: Read + Seek> {
    body: T,
    volume_offset: u64,
    sector_size: u16,
    volume_header_offset: u64,
    volume_header_size: u64,
    volume_size: u64,
    cipher: SectorCipher,
    encryption_type: EncryptionType,
    key_source: KeySource,
    position: u64,
}

impl<T: Read + Seek> std::fmt::Debug for BitLocker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitLocker")
            .field("volume_offset", &self.volume_offset)
            .field("sector_size", &self.sector_size)
            .field("volume_header_offset", &self.volume_header_offset)
            .field("volume_header_size", &self.volume_header_size)
            .field("volume_size", &self.volume_size)
            .field("encryption_type", &self.encryption_type)
            .field("key_source", &self.key_source)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<T: Read + Seek> BitLocker<T> {
    /// Cheap signature probe: does a BitLocker volume start at
    /// `volume_offset`?
    pub fn probe(body: &mut T, volume_offset: u64) -> Result<bool, ImageError> {
        let mut signature = [0u8; 8];
        body.seek(SeekFrom::Start(volume_offset + 3))
            .map_err(|e| ImageError::Seek {
                offset: volume_offset + 3,
                source: e,
            })?;
        match body.read_exact(&mut signature) {
            Ok(()) => Ok(&signature == FVE_SIGNATURE),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(ImageError::read_io(volume_offset + 3, e)),
        }
    }

    /// Attempt to unlock the volume at `volume_offset`, consuming `body`.
    ///
    /// Tries each of the three FVE metadata copies in turn and reports
    /// the most specific failure when none succeeds. On success the
    /// returned filter serves plaintext; no key material other than the
    /// initialised AES contexts is retained.
    pub fn try_unlock(
        mut body: T,
        volume_offset: u64,
        password: Option<&str>,
    ) -> Result<BitLocker<T>, UnlockError> {
        if !Self::probe(&mut body, volume_offset)? {
            return Err(UnlockError::NotBitlocker);
        }

        let mut raw_header = [0u8; 512];
        read_body(&mut body, volume_offset, &mut raw_header)?;
        let volume_header = VolumeHeader::parse(&raw_header)?;
        debug!(
            "BitLocker volume header: sector size {}, metadata at {:#x?}",
            volume_header.sector_size, volume_header.metadata_offsets
        );

        let hashes = match password {
            Some(password) => PasswordHashes::derive(password),
            None => PasswordHashes::none(),
        };

        let mut best: Option<UnlockError> = None;
        let mut unlocked = None;
        for (copy, &offset) in volume_header.metadata_offsets.iter().enumerate() {
            match Self::init_from_copy(&mut body, volume_offset, offset, &hashes) {
                Ok(u) => {
                    debug!("FVE metadata copy {} accepted", copy + 1);
                    unlocked = Some(u);
                    break;
                }
                Err(e) => {
                    debug!("FVE metadata copy {} rejected: {}", copy + 1, e);
                    best = keys::worst_error(best, e);
                }
            }
        }

        let unlocked = match unlocked {
            Some(u) => u,
            None => {
                return Err(
                    best.unwrap_or_else(|| UnlockError::General("no usable FVE metadata".into()))
                )
            }
        };

        let filter = BitLocker {
            body,
            volume_offset,
            sector_size: volume_header.sector_size,
            volume_header_offset: unlocked.volume_header_offset,
            volume_header_size: unlocked.volume_header_size,
            volume_size: unlocked.volume_size,
            cipher: unlocked.cipher,
            encryption_type: unlocked.encryption_type,
            key_source: unlocked.key_source,
            position: 0,
        };
        info!("{}", filter.description());
        Ok(filter)
    }

    /// Parse one FVE metadata copy and run the key chain against it.
    fn init_from_copy(
        body: &mut T,
        volume_offset: u64,
        metadata_offset: u64,
        hashes: &PasswordHashes,
    ) -> Result<Unlocked, UnlockError> {
        let base = volume_offset + metadata_offset;

        let mut raw = [0u8; metadata::BLOCK_HEADER_LEN + metadata::DATASET_HEADER_LEN];
        read_body(body, base, &mut raw)?;
        let block = FveBlockHeader::parse(&raw[..metadata::BLOCK_HEADER_LEN])?;
        let dataset = FveDataset::parse(&raw[metadata::BLOCK_HEADER_LEN..])?;

        let mut entries_raw = vec![0u8; dataset.entries_size() as usize];
        read_body(body, base + raw.len() as u64, &mut entries_raw)?;
        let entries = metadata::parse_entries(&entries_raw)?;
        debug!(
            "FVE dataset {}: {} top-level entries, version {}, redundant copies at {:#x?}",
            dataset.guid,
            entries.len(),
            block.version,
            block.metadata_offsets
        );

        let vmk = keys::unlock_vmk(&entries, hashes)?;
        let (fvek_type, mut fvek) = keys::unwrap_fvek(&entries, &vmk)?;

        // The encryption method is declared twice; when the copies
        // disagree, the type carried on the FVEK itself wins.
        let header_code = (dataset.encryption_method & 0xffff) as u16;
        let fvek_code = (fvek_type & 0xffff) as u16;
        let code = if fvek_code != 0 && fvek_code != header_code {
            warn!(
                "FVEK encryption type 0x{:04x} disagrees with metadata header 0x{:04x}; \
                 trusting the key entry",
                fvek_code, header_code
            );
            fvek_code
        } else {
            header_code
        };
        let encryption_type = EncryptionType::from_code(code).ok_or_else(|| {
            UnlockError::General(format!("unsupported sector encryption type 0x{:04x}", code))
        })?;

        let cipher = SectorCipher::new(encryption_type, &fvek);
        fvek.zeroize();
        let cipher = cipher?;

        let (volume_header_offset, volume_header_size) = entries
            .iter()
            .filter(|e| e.entry_type == metadata::ENTRY_TYPE_VOLUME_HEADER_BLOCK)
            .find_map(|e| match &e.payload {
                EntryPayload::OffsetAndSize { offset, size } => Some((*offset, *size)),
                _ => None,
            })
            .ok_or_else(|| {
                UnlockError::General("no relocated volume header entry found".into())
            })?;

        Ok(Unlocked {
            cipher,
            encryption_type,
            key_source: vmk.source,
            volume_header_offset,
            volume_header_size,
            volume_size: block.encrypted_volume_size,
        })
    }

    /// Human-readable summary of how the volume was unlocked, e.g.
    /// `BitLocker AES-XTS 128-bit encryption, decrypted using recovery
    /// password`.
    pub fn description(&self) -> String {
        format!(
            "BitLocker {} encryption, decrypted using {}",
            self.encryption_type.describe(),
            self.key_source.describe()
        )
    }

    #[inline]
    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    /// Size of the encrypted volume in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.volume_size
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    /// Give the underlying body back (e.g. to reuse the image handle).
    pub fn into_inner(self) -> T {
        self.body
    }

    pub fn print_info(&self) {
        info!("BitLocker Volume Information:");
        info!("  {}", self.description());
        info!("  Sector Size: {}", self.sector_size);
        info!("  Volume Size: {} bytes", self.volume_size);
        info!(
            "  Relocated Header: {} bytes at volume offset 0x{:x}",
            self.volume_header_size, self.volume_header_offset
        );
    }

    /// Read and decrypt whole sectors at the sector-aligned logical
    /// `offset`. Returns the byte count delivered; short reads from the
    /// body propagate as short results.
    ///
    /// Reads below `volume_header_size` are served from the relocated
    /// header region and decrypted with the *host* sector offset as seed;
    /// BitLocker encrypts by physical sector address.
    pub fn read_and_decrypt_sectors(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ImageError> {
        let ss = self.sector_size as u64;
        if offset % ss != 0 || buf.len() as u64 % ss != 0 {
            return Err(ImageError::Arg(
                "BitLocker reads must be sector-aligned".into(),
            ));
        }

        let len = buf.len() as u64;
        let mut delivered = 0usize;

        if offset < self.volume_header_size {
            // The head of the volume lives at the relocation address.
            let relocated = (self.volume_header_size - offset).min(len);
            let host = self.volume_header_offset + offset;
            let got = self.read_decrypt_run(host, &mut buf[..relocated as usize])?;
            delivered += got;
            if (got as u64) < relocated || relocated == len {
                return Ok(delivered);
            }
            let got = self.read_decrypt_run(offset + relocated, &mut buf[relocated as usize..])?;
            delivered += got;
        } else {
            delivered = self.read_decrypt_run(offset, buf)?;
        }
        Ok(delivered)
    }

    /// Read `buf` from volume-relative `host_offset` and decrypt each
    /// sector seeded by its own host offset. The seed always equals the
    /// physical address: that is precisely why relocated-header reads
    /// must pass the relocation address here, not the logical one.
    fn read_decrypt_run(&mut self, host_offset: u64, buf: &mut [u8]) -> Result<usize, ImageError> {
        let absolute = self.volume_offset + host_offset;
        let got = read_body_short(&mut self.body, absolute, buf)?;

        let ss = self.sector_size as usize;
        for (i, sector) in buf[..got - got % ss].chunks_exact_mut(ss).enumerate() {
            let seed = host_offset + (i * ss) as u64;
            self.cipher.decrypt_sector(seed, self.sector_size, sector);
        }
        // A trailing partial sector cannot be decrypted; do not hand it out.
        Ok(got - got % ss)
    }
}

/// Byte-granular plaintext access on top of the sector-aligned decrypt
/// path, so file-system parsers can consume the filter directly.
impl<T: Read + Seek> Read for BitLocker<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.volume_size != 0 && self.position >= self.volume_size {
            return Ok(0);
        }
        let mut want = buf.len() as u64;
        if self.volume_size != 0 {
            want = want.min(self.volume_size - self.position);
        }
        if want == 0 {
            return Ok(0);
        }

        let ss = self.sector_size as u64;
        let start = self.position - self.position % ss;
        let end = (self.position + want).div_ceil(ss) * ss;
        let mut aligned = vec![0u8; (end - start) as usize];
        let got = self.read_and_decrypt_sectors(start, &mut aligned)?;

        let skip = (self.position - start) as usize;
        if got <= skip {
            return Ok(0);
        }
        let usable = (got - skip).min(want as usize);
        buf[..usable].copy_from_slice(&aligned[skip..skip + usable]);
        self.position += usable as u64;
        Ok(usable)
    }
}

impl<T: Read + Seek> Seek for BitLocker<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => self.position as i64 + o,
            SeekFrom::End(o) => self.volume_size as i64 + o,
        };
        if new_offset < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before start of volume",
            ));
        }
        self.position = new_offset as u64;
        Ok(self.position)
    }
}

/// Seek + read_exact against the body, with image-layer error mapping.
fn read_body<T: Read + Seek>(body: &mut T, offset: u64, buf: &mut [u8]) -> Result<(), ImageError> {
    body.seek(SeekFrom::Start(offset))
        .map_err(|e| ImageError::Seek { offset, source: e })?;
    body.read_exact(buf)
        .map_err(|e| ImageError::read_io(offset, e))
}

/// Like [`read_body`] but tolerates running into end-of-body.
fn read_body_short<T: Read + Seek>(
    body: &mut T,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize, ImageError> {
    body.seek(SeekFrom::Start(offset))
        .map_err(|e| ImageError::Seek { offset, source: e })?;
    let mut total = 0usize;
    while total < buf.len() {
        match body.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ImageError::read_io(offset + total as u64, e)),
        }
    }
    Ok(total)
}
