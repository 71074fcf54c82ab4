//! FVE (Full-Volume Encryption) on-disk metadata parser.
//!
//! BitLocker keeps three redundant metadata blocks on the volume; their
//! offsets live in the modified volume boot sector. Each block carries a
//! 64-byte block header, a 48-byte dataset header, and a list of
//! variable-size entries. All multi-byte fields are little-endian.
//!
//! Entries this crate does not interpret are retained opaquely so the
//! walk can continue past them.

use log::warn;
use uuid::Uuid;

use super::UnlockError;

/// Signature found at offset 3 of the volume header and offset 0 of each
/// FVE metadata block.
pub const FVE_SIGNATURE: &[u8; 8] = b"-FVE-FS-";

/// Size of the FVE metadata block header.
pub const BLOCK_HEADER_LEN: usize = 64;
/// Size of the dataset header that follows it.
pub const DATASET_HEADER_LEN: usize = 48;
/// Corruption guard on the entry list size.
const MAX_ENTRIES_SIZE: u32 = 0x80000;

// Entry types.
pub const ENTRY_TYPE_VMK: u16 = 0x0002;
pub const ENTRY_TYPE_FVEK: u16 = 0x0003;
pub const ENTRY_TYPE_DESCRIPTION: u16 = 0x0007;
pub const ENTRY_TYPE_VOLUME_HEADER_BLOCK: u16 = 0x000f;

// Value types.
pub const VALUE_TYPE_ERASED: u16 = 0x0000;
pub const VALUE_TYPE_KEY: u16 = 0x0001;
pub const VALUE_TYPE_UNICODE: u16 = 0x0002;
pub const VALUE_TYPE_STRETCH_KEY: u16 = 0x0003;
pub const VALUE_TYPE_USE_KEY: u16 = 0x0004;
pub const VALUE_TYPE_AES_CCM_ENCRYPTED_KEY: u16 = 0x0005;
pub const VALUE_TYPE_VOLUME_MASTER_KEY: u16 = 0x0008;
pub const VALUE_TYPE_OFFSET_AND_SIZE: u16 = 0x000f;

/// The BitLocker volume header: the 512-byte boot sector BitLocker
/// rewrites, pointing at the three FVE metadata blocks.
pub struct VolumeHeader {
    pub sector_size: u16,
    /// Offsets of the three FVE metadata blocks, relative to the start of
    /// the volume.
    pub metadata_offsets: [u64; 3],
}

impl VolumeHeader {
    /// Parse the 512-byte volume header. The caller has already verified
    /// the `-FVE-FS-` signature at offset 3.
    pub fn parse(raw: &[u8]) -> Result<VolumeHeader, UnlockError> {
        if raw.len() < 512 {
            return Err(UnlockError::General(
                "volume header shorter than one sector".into(),
            ));
        }
        let sector_size = u16::from_le_bytes(raw[11..13].try_into().unwrap());
        if sector_size == 0 || sector_size % 512 != 0 {
            return Err(UnlockError::General(format!(
                "implausible sector size {} in volume header",
                sector_size
            )));
        }
        let mut metadata_offsets = [0u64; 3];
        for (i, off) in metadata_offsets.iter_mut().enumerate() {
            let at = 176 + i * 8;
            *off = u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
        }
        Ok(VolumeHeader {
            sector_size,
            metadata_offsets,
        })
    }
}

/// The 64-byte header that opens each FVE metadata block.
pub struct FveBlockHeader {
    pub version: u16,
    pub encrypted_volume_size: u64,
    /// Redundant copy of the three metadata offsets.
    pub metadata_offsets: [u64; 3],
}

impl FveBlockHeader {
    pub fn parse(raw: &[u8]) -> Result<FveBlockHeader, UnlockError> {
        if raw.len() < BLOCK_HEADER_LEN {
            return Err(UnlockError::General("FVE block header truncated".into()));
        }
        if &raw[0..8] != FVE_SIGNATURE {
            return Err(UnlockError::General(
                "FVE block signature mismatch".into(),
            ));
        }
        let version = u16::from_le_bytes(raw[10..12].try_into().unwrap());
        let encrypted_volume_size = u64::from_le_bytes(raw[16..24].try_into().unwrap());
        let mut metadata_offsets = [0u64; 3];
        for (i, off) in metadata_offsets.iter_mut().enumerate() {
            let at = 32 + i * 8;
            *off = u64::from_le_bytes(raw[at..at + 8].try_into().unwrap());
        }
        Ok(FveBlockHeader {
            version,
            encrypted_volume_size,
            metadata_offsets,
        })
    }
}

/// The 48-byte dataset header: total size of the entry region and the
/// volume's sector encryption method.
pub struct FveDataset {
    pub size: u32,
    pub header_size: u32,
    pub guid: Uuid,
    pub encryption_method: u32,
}

impl FveDataset {
    pub fn parse(raw: &[u8]) -> Result<FveDataset, UnlockError> {
        if raw.len() < DATASET_HEADER_LEN {
            return Err(UnlockError::General("FVE dataset header truncated".into()));
        }
        let size = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let header_size = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        let guid = Uuid::from_bytes_le(raw[16..32].try_into().unwrap());
        let encryption_method = u32::from_le_bytes(raw[36..40].try_into().unwrap());

        let dataset = FveDataset {
            size,
            header_size,
            guid,
            encryption_method,
        };
        let entries = dataset.entries_size();
        if entries <= 0 || entries as u32 > MAX_ENTRIES_SIZE {
            return Err(UnlockError::General(format!(
                "FVE entry list size {} out of range",
                entries
            )));
        }
        Ok(dataset)
    }

    /// Byte length of the entry list that follows this header.
    pub fn entries_size(&self) -> i64 {
        self.size as i64 - DATASET_HEADER_LEN as i64
    }
}

/// One parsed metadata entry. The payload variant depends on
/// `value_type`; unknown variants are carried opaquely.
pub struct MetadataEntry {
    pub entry_type: u16,
    pub value_type: u16,
    pub version: u16,
    pub payload: EntryPayload,
}

pub enum EntryPayload {
    Erased,
    /// Raw key material, prefixed on disk by its encryption type.
    Key { encryption_type: u32, key: Vec<u8> },
    /// UTF-16LE string.
    Unicode(String),
    /// Salt plus a nested encrypted-key entry, used to harden passwords.
    StretchKey {
        encryption_type: u32,
        salt: [u8; 16],
        properties: Vec<MetadataEntry>,
    },
    /// Indirection entry holding nested properties.
    UseKey {
        encryption_type: u32,
        properties: Vec<MetadataEntry>,
    },
    /// AES-CCM wrapped key: 12-byte nonce, then the 16-byte MAC followed
    /// by the ciphertext body.
    AesCcmEncryptedKey {
        nonce: [u8; 12],
        /// MAC-led ciphertext (`mac[16] || body`).
        ciphertext: Vec<u8>,
    },
    /// A wrapped copy of the volume master key with its protector list.
    VolumeMasterKey {
        guid: Uuid,
        last_modified: u64,
        protection_type: u16,
        properties: Vec<MetadataEntry>,
    },
    /// Region descriptor (used for the relocated volume header).
    OffsetAndSize { offset: u64, size: u64 },
    /// Retained but not interpreted.
    Unknown(Vec<u8>),
}

impl MetadataEntry {
    /// First nested property, by value type.
    pub fn property(&self, value_type: u16) -> Option<&MetadataEntry> {
        let properties = match &self.payload {
            EntryPayload::StretchKey { properties, .. } => properties,
            EntryPayload::UseKey { properties, .. } => properties,
            EntryPayload::VolumeMasterKey { properties, .. } => properties,
            _ => return None,
        };
        properties.iter().find(|p| p.value_type == value_type)
    }
}

/// Parse a list of metadata entries out of `data`.
///
/// Each entry is `u16 size | u16 entry_type | u16 value_type |
/// u16 version | payload[size-8]`. A zero-size entry means the region is
/// corrupt; unknown value types are kept opaque so iteration continues.
pub fn parse_entries(data: &[u8]) -> Result<Vec<MetadataEntry>, UnlockError> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;

    while data.len() - cursor >= 8 {
        let size = u16::from_le_bytes(data[cursor..cursor + 2].try_into().unwrap()) as usize;
        if size == 0 {
            return Err(UnlockError::General(
                "zero-size FVE metadata entry (corrupt region)".into(),
            ));
        }
        if size < 8 || cursor + size > data.len() {
            return Err(UnlockError::General(format!(
                "FVE metadata entry overruns its region ({} bytes at {})",
                size, cursor
            )));
        }
        let entry_type = u16::from_le_bytes(data[cursor + 2..cursor + 4].try_into().unwrap());
        let value_type = u16::from_le_bytes(data[cursor + 4..cursor + 6].try_into().unwrap());
        let version = u16::from_le_bytes(data[cursor + 6..cursor + 8].try_into().unwrap());
        let payload = &data[cursor + 8..cursor + size];

        entries.push(MetadataEntry {
            entry_type,
            value_type,
            version,
            payload: parse_payload(value_type, payload)?,
        });
        cursor += size;
    }

    if cursor != data.len() {
        warn!(
            "{} trailing byte(s) after the last FVE metadata entry",
            data.len() - cursor
        );
    }
    Ok(entries)
}

fn parse_payload(value_type: u16, payload: &[u8]) -> Result<EntryPayload, UnlockError> {
    let truncated = |what: &str| UnlockError::General(format!("{} entry truncated", what));
    match value_type {
        VALUE_TYPE_ERASED => Ok(EntryPayload::Erased),
        VALUE_TYPE_KEY => {
            if payload.len() < 4 {
                return Err(truncated("key"));
            }
            Ok(EntryPayload::Key {
                encryption_type: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
                key: payload[4..].to_vec(),
            })
        }
        VALUE_TYPE_UNICODE => Ok(EntryPayload::Unicode(decode_utf16le(payload))),
        VALUE_TYPE_STRETCH_KEY => {
            if payload.len() < 20 {
                return Err(truncated("stretch key"));
            }
            Ok(EntryPayload::StretchKey {
                encryption_type: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
                salt: payload[4..20].try_into().unwrap(),
                properties: parse_entries(&payload[20..])?,
            })
        }
        VALUE_TYPE_USE_KEY => {
            if payload.len() < 4 {
                return Err(truncated("use key"));
            }
            Ok(EntryPayload::UseKey {
                encryption_type: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
                properties: parse_entries(&payload[4..])?,
            })
        }
        VALUE_TYPE_AES_CCM_ENCRYPTED_KEY => {
            // nonce[12] | mac[16] | body — at least one body byte.
            if payload.len() < 29 {
                return Err(truncated("AES-CCM encrypted key"));
            }
            Ok(EntryPayload::AesCcmEncryptedKey {
                nonce: payload[0..12].try_into().unwrap(),
                ciphertext: payload[12..].to_vec(),
            })
        }
        VALUE_TYPE_VOLUME_MASTER_KEY => {
            if payload.len() < 28 {
                return Err(truncated("volume master key"));
            }
            Ok(EntryPayload::VolumeMasterKey {
                guid: Uuid::from_bytes_le(payload[0..16].try_into().unwrap()),
                last_modified: u64::from_le_bytes(payload[16..24].try_into().unwrap()),
                protection_type: u16::from_le_bytes(payload[26..28].try_into().unwrap()),
                properties: parse_entries(&payload[28..])?,
            })
        }
        VALUE_TYPE_OFFSET_AND_SIZE => {
            if payload.len() < 16 {
                return Err(truncated("offset-and-size"));
            }
            Ok(EntryPayload::OffsetAndSize {
                offset: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
                size: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
            })
        }
        _ => Ok(EntryPayload::Unknown(payload.to_vec())),
    }
}

fn decode_utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}

/// Serialize one entry (header + payload), for fixture construction in
/// this crate's tests.
#[cfg(test)]
pub(crate) fn build_entry(entry_type: u16, value_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + payload.len());
    raw.extend_from_slice(&((payload.len() as u16 + 8).to_le_bytes()));
    raw.extend_from_slice(&entry_type.to_le_bytes());
    raw.extend_from_slice(&value_type.to_le_bytes());
    raw.extend_from_slice(&1u16.to_le_bytes());
    raw.extend_from_slice(payload);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_entry() {
        let mut payload = 0x2003u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0xAB; 32]);
        let raw = build_entry(ENTRY_TYPE_FVEK, VALUE_TYPE_KEY, &payload);

        let entries = parse_entries(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].payload {
            EntryPayload::Key {
                encryption_type,
                key,
            } => {
                assert_eq!(*encryption_type, 0x2003);
                assert_eq!(key.as_slice(), &[0xAB; 32]);
            }
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn test_parse_vmk_with_nested_stretch_key() {
        // Stretch key holding a nested CCM entry.
        let mut ccm_payload = vec![0u8; 12]; // nonce
        ccm_payload.extend_from_slice(&[0x11; 16]); // mac
        ccm_payload.extend_from_slice(&[0x22; 44]); // body
        let ccm = build_entry(0, VALUE_TYPE_AES_CCM_ENCRYPTED_KEY, &ccm_payload);

        let mut stretch_payload = 0x1000u32.to_le_bytes().to_vec();
        stretch_payload.extend_from_slice(&[0x55; 16]); // salt
        stretch_payload.extend_from_slice(&ccm);
        let stretch = build_entry(0, VALUE_TYPE_STRETCH_KEY, &stretch_payload);

        let mut vmk_payload = vec![0u8; 16]; // guid
        vmk_payload.extend_from_slice(&[0u8; 8]); // last modified
        vmk_payload.extend_from_slice(&[0u8; 2]); // reserved
        vmk_payload.extend_from_slice(&0x2000u16.to_le_bytes()); // password
        vmk_payload.extend_from_slice(&stretch);
        let raw = build_entry(ENTRY_TYPE_VMK, VALUE_TYPE_VOLUME_MASTER_KEY, &vmk_payload);

        let entries = parse_entries(&raw).unwrap();
        let vmk = &entries[0];
        match &vmk.payload {
            EntryPayload::VolumeMasterKey {
                protection_type,
                properties,
                ..
            } => {
                assert_eq!(*protection_type, 0x2000);
                assert_eq!(properties.len(), 1);
            }
            _ => panic!("wrong payload variant"),
        }
        let stretch = vmk.property(VALUE_TYPE_STRETCH_KEY).unwrap();
        match &stretch.payload {
            EntryPayload::StretchKey {
                salt, properties, ..
            } => {
                assert_eq!(salt, &[0x55; 16]);
                assert_eq!(properties.len(), 1);
            }
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn test_zero_size_entry_is_corruption() {
        let raw = [0u8; 16];
        assert!(parse_entries(&raw).is_err());
    }

    #[test]
    fn test_unknown_entry_retained() {
        let raw = build_entry(0x99, 0x77, &[1, 2, 3, 4]);
        let entries = parse_entries(&raw).unwrap();
        match &entries[0].payload {
            EntryPayload::Unknown(data) => assert_eq!(data.as_slice(), &[1, 2, 3, 4]),
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn test_volume_header_offsets() {
        let mut raw = vec![0u8; 512];
        raw[3..11].copy_from_slice(FVE_SIGNATURE);
        raw[11..13].copy_from_slice(&512u16.to_le_bytes());
        raw[176..184].copy_from_slice(&0x1000u64.to_le_bytes());
        raw[184..192].copy_from_slice(&0x2000u64.to_le_bytes());
        raw[192..200].copy_from_slice(&0x3000u64.to_le_bytes());

        let header = VolumeHeader::parse(&raw).unwrap();
        assert_eq!(header.sector_size, 512);
        assert_eq!(header.metadata_offsets, [0x1000, 0x2000, 0x3000]);
    }
}
