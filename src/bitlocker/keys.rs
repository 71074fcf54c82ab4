//! BitLocker key chain: password hashing, key stretching, and AES-CCM
//! key unwrapping.
//!
//! The chain runs password → stretched key → volume master key (VMK) →
//! full-volume encryption key (FVEK). Intermediate material is zeroed as
//! soon as it has served its purpose; only the FVEK leaves this module.

use aes::Aes256;
use ccm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    consts::{U12, U16},
    Ccm,
};
use log::{debug, warn};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use zeroize::Zeroize;

use super::metadata::{
    EntryPayload, MetadataEntry, ENTRY_TYPE_FVEK, ENTRY_TYPE_VMK, VALUE_TYPE_AES_CCM_ENCRYPTED_KEY,
    VALUE_TYPE_KEY, VALUE_TYPE_STRETCH_KEY,
};
use super::UnlockError;

/// BitLocker CCM parameters: 16-byte tag, 12-byte nonce (`L = 3`).
type Aes256Ccm = Ccm<Aes256, U16, U12>;

/// Rounds of the SHA-256 stretch applied to password hashes.
const STRETCH_ROUNDS: u64 = 0x100000;

// VMK protection types.
pub const PROTECTION_CLEAR_KEY: u16 = 0x0000;
pub const PROTECTION_TPM: u16 = 0x0100;
pub const PROTECTION_STARTUP_KEY: u16 = 0x0200;
pub const PROTECTION_TPM_AND_PIN: u16 = 0x0500;
pub const PROTECTION_RECOVERY_PASSWORD: u16 = 0x0800;
pub const PROTECTION_PASSWORD: u16 = 0x2000;

/// Human-readable name of a VMK protection type.
pub fn protection_name(protection_type: u16) -> String {
    match protection_type {
        PROTECTION_CLEAR_KEY => "clear key".into(),
        PROTECTION_TPM => "TPM".into(),
        PROTECTION_STARTUP_KEY => "startup key".into(),
        PROTECTION_TPM_AND_PIN => "TPM+PIN".into(),
        PROTECTION_RECOVERY_PASSWORD => "recovery password".into(),
        PROTECTION_PASSWORD => "password".into(),
        other => format!("unknown (0x{:04x})", other),
    }
}

/// How the VMK ended up unwrapped; feeds the user-visible description.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeySource {
    ClearKey,
    Password,
    RecoveryPassword,
}

impl KeySource {
    pub fn describe(&self) -> &'static str {
        match self {
            KeySource::ClearKey => "clear key",
            KeySource::Password => "password",
            KeySource::RecoveryPassword => "recovery password",
        }
    }
}

/// SHA-256 digests derived from a caller-supplied password. The same
/// string can be usable both as a plain password and as a recovery
/// password; both hashes are kept and tried where appropriate.
pub struct PasswordHashes {
    password: Option<[u8; 32]>,
    recovery: Option<[u8; 32]>,
}

impl PasswordHashes {
    /// No password supplied.
    pub fn none() -> PasswordHashes {
        PasswordHashes {
            password: None,
            recovery: None,
        }
    }

    /// Hash `password` both ways. The plain-password hash is the double
    /// SHA-256 of the UTF-16LE encoding; the recovery hash only exists
    /// when the string matches the eight-group recovery format with every
    /// group divisible by 11.
    pub fn derive(password: &str) -> PasswordHashes {
        let mut utf16: Vec<u8> = password
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let mut first: [u8; 32] = Sha256::digest(&utf16).into();
        let password_hash: [u8; 32] = Sha256::digest(first).into();
        utf16.zeroize();
        first.zeroize();

        let recovery = recovery_password_bytes(password).map(|mut packed| {
            let digest: [u8; 32] = Sha256::digest(packed).into();
            packed.zeroize();
            digest
        });
        if recovery.is_some() {
            debug!("Supplied password also parses as a recovery password");
        }

        PasswordHashes {
            password: Some(password_hash),
            recovery,
        }
    }
}

static RECOVERY_PASSWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,6}(-\d{1,6}){7}$").unwrap());

/// Pack a recovery password (eight dash-separated groups, each a multiple
/// of 11 whose quotient fits 16 bits) into its 16-byte key form.
fn recovery_password_bytes(password: &str) -> Option<[u8; 16]> {
    if !RECOVERY_PASSWORD_RE.is_match(password) {
        return None;
    }
    let mut packed = [0u8; 16];
    for (i, group) in password.split('-').enumerate() {
        let value: u32 = group.parse().ok()?;
        if value % 11 != 0 {
            return None;
        }
        let quotient = value / 11;
        if quotient > u16::MAX as u32 {
            return None;
        }
        packed[i * 2..i * 2 + 2].copy_from_slice(&(quotient as u16).to_le_bytes());
    }
    Some(packed)
}

/// Run the 2^20-round SHA-256 stretch over an 88-byte chain struct
/// `{ updated_hash[32], password_hash[32], salt[16], hash_count:u64 }`.
pub fn stretch_key(password_hash: &[u8; 32], salt: &[u8; 16]) -> [u8; 32] {
    let mut chain = [0u8; 88];
    chain[32..64].copy_from_slice(password_hash);
    chain[64..80].copy_from_slice(salt);

    for count in 0..STRETCH_ROUNDS {
        chain[80..88].copy_from_slice(&count.to_le_bytes());
        let digest = Sha256::digest(chain);
        chain[0..32].copy_from_slice(&digest);
    }

    let mut stretched = [0u8; 32];
    stretched.copy_from_slice(&chain[0..32]);
    chain.zeroize();
    stretched
}

/// Decrypt an AES-CCM wrapped key. `ciphertext` starts with the 16-byte
/// MAC, followed by the encrypted body. A MAC mismatch is reported as
/// [`UnlockError::WrongPassword`]: the only way to produce one with sane
/// metadata is a wrong wrapping key.
pub fn ccm_unwrap(
    key: &[u8],
    nonce: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, UnlockError> {
    if ciphertext.len() < 17 {
        return Err(UnlockError::General("wrapped key too short".into()));
    }
    let cipher = Aes256Ccm::new_from_slice(key)
        .map_err(|_| UnlockError::General("CCM wrapping key must be 32 bytes".into()))?;

    // The aead interface wants the tag appended, not leading.
    let (mac, body) = ciphertext.split_at(16);
    let mut payload = Vec::with_capacity(ciphertext.len());
    payload.extend_from_slice(body);
    payload.extend_from_slice(mac);

    cipher
        .decrypt(GenericArray::from_slice(nonce), payload.as_ref())
        .map_err(|_| UnlockError::WrongPassword)
}

/// The plaintext of a wrapped key is itself a metadata entry; it must be
/// a `Key`. Returns the key bytes and their declared encryption type.
fn parse_unwrapped_key(plaintext: &[u8]) -> Result<(u32, Vec<u8>), UnlockError> {
    let entries = super::metadata::parse_entries(plaintext)?;
    match entries.into_iter().next() {
        Some(MetadataEntry {
            payload:
                EntryPayload::Key {
                    encryption_type,
                    key,
                },
            ..
        }) => Ok((encryption_type, key)),
        _ => Err(UnlockError::General(
            "unwrapped key is not a key entry".into(),
        )),
    }
}

/// A successfully unwrapped VMK.
pub struct UnlockedVmk {
    pub key: Vec<u8>,
    pub source: KeySource,
}

impl Drop for UnlockedVmk {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Specificity ranking for the "most actionable error wins" reducer.
fn rank(err: &UnlockError) -> u8 {
    match err {
        UnlockError::WrongPassword => 4,
        UnlockError::NeedPassword => 3,
        UnlockError::UnsupportedProtection(_) => 2,
        _ => 1,
    }
}

/// Keep the more specific of two unlock failures.
pub(super) fn worst_error(best: Option<UnlockError>, new: UnlockError) -> Option<UnlockError> {
    match best {
        Some(old) if rank(&old) >= rank(&new) => Some(old),
        _ => Some(new),
    }
}

/// Walk the VMK entries and unwrap the first one our key material can
/// open. On exhaustion, the most specific failure observed is returned;
/// if every protector was of an unsupported kind, the full list of kinds
/// is reported.
pub fn unlock_vmk(
    entries: &[MetadataEntry],
    hashes: &PasswordHashes,
) -> Result<UnlockedVmk, UnlockError> {
    let mut best: Option<UnlockError> = None;
    let mut unsupported: Vec<String> = Vec::new();

    for entry in entries
        .iter()
        .filter(|e| e.entry_type == ENTRY_TYPE_VMK)
    {
        let (protection_type, properties) = match &entry.payload {
            EntryPayload::VolumeMasterKey {
                protection_type,
                properties,
                ..
            } => (*protection_type, properties.as_slice()),
            _ => continue,
        };

        let attempt = match protection_type {
            PROTECTION_PASSWORD => {
                try_stretched_protector(entry, properties, hashes.password, KeySource::Password)
            }
            PROTECTION_RECOVERY_PASSWORD => try_stretched_protector(
                entry,
                properties,
                hashes.recovery,
                KeySource::RecoveryPassword,
            ),
            PROTECTION_CLEAR_KEY => try_clear_key(entry, properties),
            other => {
                let name = protection_name(other);
                debug!("Skipping VMK protected by {}", name);
                if !unsupported.contains(&name) {
                    unsupported.push(name);
                }
                Err(UnlockError::UnsupportedProtection(Vec::new()))
            }
        };

        match attempt {
            Ok(vmk) => {
                debug!("VMK unwrapped using {}", vmk.source.describe());
                return Ok(vmk);
            }
            Err(e) => best = worst_error(best, e),
        }
    }

    match best {
        Some(UnlockError::UnsupportedProtection(_)) | None if !unsupported.is_empty() => {
            Err(UnlockError::UnsupportedProtection(unsupported))
        }
        Some(e) => Err(e),
        None => Err(UnlockError::General("no VMK entry found".into())),
    }
}

/// Password / recovery-password protector: stretch the hash with the
/// entry's salt, then open the wrapped VMK.
fn try_stretched_protector(
    entry: &MetadataEntry,
    properties: &[MetadataEntry],
    hash: Option<[u8; 32]>,
    source: KeySource,
) -> Result<UnlockedVmk, UnlockError> {
    let hash = hash.ok_or(UnlockError::NeedPassword)?;

    let stretch = entry
        .property(VALUE_TYPE_STRETCH_KEY)
        .ok_or_else(|| UnlockError::General("VMK entry has no stretch key".into()))?;
    let (salt, nested) = match &stretch.payload {
        EntryPayload::StretchKey {
            salt, properties, ..
        } => (salt, properties.as_slice()),
        _ => return Err(UnlockError::General("malformed stretch key".into())),
    };

    let mut stretched = stretch_key(&hash, salt);

    // The wrapped VMK sits beside the stretch key; older layouts nest it
    // inside the stretch key instead.
    let wrapped = first_ccm(properties)
        .or_else(|| first_ccm(nested))
        .ok_or_else(|| UnlockError::General("VMK entry has no wrapped key".into()))?;

    let result = open_wrapped_vmk(&stretched, wrapped, source);
    stretched.zeroize();
    result
}

/// Clear-key protector: the key property directly wraps the VMK.
fn try_clear_key(
    entry: &MetadataEntry,
    properties: &[MetadataEntry],
) -> Result<UnlockedVmk, UnlockError> {
    let key = match entry.property(VALUE_TYPE_KEY).map(|p| &p.payload) {
        Some(EntryPayload::Key { key, .. }) => key.clone(),
        _ => return Err(UnlockError::General("clear-key VMK has no key".into())),
    };
    warn!("Volume master key is protected by a clear key");

    let wrapped = first_ccm(properties)
        .ok_or_else(|| UnlockError::General("clear-key VMK has no wrapped key".into()))?;
    open_wrapped_vmk(&key, wrapped, KeySource::ClearKey)
}

fn first_ccm(properties: &[MetadataEntry]) -> Option<(&[u8; 12], &[u8])> {
    properties.iter().find_map(|p| match &p.payload {
        EntryPayload::AesCcmEncryptedKey { nonce, ciphertext }
            if p.value_type == VALUE_TYPE_AES_CCM_ENCRYPTED_KEY =>
        {
            Some((nonce, ciphertext.as_slice()))
        }
        _ => None,
    })
}

fn open_wrapped_vmk(
    wrapping_key: &[u8],
    (nonce, ciphertext): (&[u8; 12], &[u8]),
    source: KeySource,
) -> Result<UnlockedVmk, UnlockError> {
    let mut plaintext = ccm_unwrap(wrapping_key, nonce, ciphertext)?;
    let parsed = parse_unwrapped_key(&plaintext);
    plaintext.zeroize();
    let (_, key) = parsed?;
    if key.len() != 32 {
        return Err(UnlockError::General(format!(
            "VMK has unexpected length {}",
            key.len()
        )));
    }
    Ok(UnlockedVmk { key, source })
}

/// Unwrap the full-volume encryption key with the VMK. Returns the FVEK
/// bytes and the encryption type declared on the key entry.
pub fn unwrap_fvek(
    entries: &[MetadataEntry],
    vmk: &UnlockedVmk,
) -> Result<(u32, Vec<u8>), UnlockError> {
    let wrapped = entries
        .iter()
        .filter(|e| e.entry_type == ENTRY_TYPE_FVEK)
        .find_map(|e| match &e.payload {
            EntryPayload::AesCcmEncryptedKey { nonce, ciphertext } => {
                Some((nonce, ciphertext.as_slice()))
            }
            _ => None,
        })
        .ok_or_else(|| UnlockError::General("no wrapped FVEK entry found".into()))?;

    let mut plaintext = ccm_unwrap(&vmk.key, wrapped.0, wrapped.1)?;
    let parsed = parse_unwrapped_key(&plaintext);
    plaintext.zeroize();
    parsed
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Password hash stretched with `salt`, as a volume builder needs it.
    pub fn stretched_password(password: &str, salt: &[u8; 16]) -> [u8; 32] {
        let hashes = PasswordHashes::derive(password);
        stretch_key(&hashes.password.unwrap(), salt)
    }

    /// Wrap `plaintext` the way BitLocker stores it: 12-byte nonce, then
    /// MAC-led ciphertext.
    pub fn ccm_wrap(key: &[u8], nonce: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Ccm::new_from_slice(key).unwrap();
        let mut sealed = cipher
            .encrypt(GenericArray::from_slice(nonce), plaintext)
            .unwrap();
        // encrypt() appends the tag; move it to the front.
        let mac = sealed.split_off(sealed.len() - 16);
        let mut out = mac;
        out.extend_from_slice(&sealed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitlocker::metadata::{build_entry, parse_entries};

    #[test]
    fn test_recovery_password_packing() {
        // Quotients 1..=8, each multiplied by 11.
        let packed = recovery_password_bytes("11-22-33-44-55-66-77-88").unwrap();
        let expected: Vec<u8> = (1u16..=8).flat_map(|q| q.to_le_bytes()).collect();
        assert_eq!(&packed[..], &expected[..]);

        // Not divisible by 11.
        assert!(recovery_password_bytes("11-22-33-44-55-66-77-89").is_none());
        // Wrong group count.
        assert!(recovery_password_bytes("11-22-33").is_none());
        // Not a recovery password at all.
        assert!(recovery_password_bytes("correcthorsebatterystaple").is_none());
    }

    #[test]
    fn test_password_hash_shape() {
        let hashes = PasswordHashes::derive("password");
        assert!(hashes.password.is_some());
        assert!(hashes.recovery.is_none());

        let hashes =
            PasswordHashes::derive("111111-222222-333333-444444-555555-666666-715000-704000");
        assert!(hashes.password.is_some());
        assert!(hashes.recovery.is_some());
    }

    #[test]
    fn test_stretch_key_is_deterministic_and_salted() {
        let hash = [0x42u8; 32];
        let a = stretch_key(&hash, &[0x01; 16]);
        let b = stretch_key(&hash, &[0x01; 16]);
        let c = stretch_key(&hash, &[0x02; 16]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, [0u8; 32]);
    }

    #[test]
    fn test_ccm_round_trip_and_tamper_detection() {
        let key = [0x33u8; 32];
        let nonce = [0x07u8; 12];
        let secret = b"the quick brown fox jumps over";

        let wrapped = test_support::ccm_wrap(&key, &nonce, secret);
        let opened = ccm_unwrap(&key, &nonce, &wrapped).unwrap();
        assert_eq!(opened.as_slice(), secret);

        // One flipped ciphertext bit must fail the MAC.
        let mut tampered = wrapped.clone();
        tampered[20] ^= 0x01;
        match ccm_unwrap(&key, &nonce, &tampered) {
            Err(UnlockError::WrongPassword) => {}
            other => panic!("expected WrongPassword, got {:?}", other.map(|_| ())),
        }
    }

    /// Build a password-protected VMK entry wrapping `vmk_key`.
    fn password_vmk_entry(password: &str, salt: [u8; 16], vmk_key: &[u8; 32]) -> Vec<u8> {
        let hashes = PasswordHashes::derive(password);
        let stretched = stretch_key(&hashes.password.unwrap(), &salt);

        let mut key_payload = 0x2003u32.to_le_bytes().to_vec();
        key_payload.extend_from_slice(vmk_key);
        let key_entry = build_entry(0, VALUE_TYPE_KEY, &key_payload);

        let nonce = [0x44u8; 12];
        let wrapped = test_support::ccm_wrap(&stretched, &nonce, &key_entry);
        let mut ccm_payload = nonce.to_vec();
        ccm_payload.extend_from_slice(&wrapped);
        let ccm_entry = build_entry(0, VALUE_TYPE_AES_CCM_ENCRYPTED_KEY, &ccm_payload);

        let mut stretch_payload = 0x1000u32.to_le_bytes().to_vec();
        stretch_payload.extend_from_slice(&salt);
        let stretch_entry = build_entry(0, VALUE_TYPE_STRETCH_KEY, &stretch_payload);

        let mut vmk_payload = vec![0u8; 16]; // guid
        vmk_payload.extend_from_slice(&[0u8; 8]); // last modified
        vmk_payload.extend_from_slice(&[0u8; 2]);
        vmk_payload.extend_from_slice(&PROTECTION_PASSWORD.to_le_bytes());
        vmk_payload.extend_from_slice(&stretch_entry);
        vmk_payload.extend_from_slice(&ccm_entry);
        build_entry(
            ENTRY_TYPE_VMK,
            super::super::metadata::VALUE_TYPE_VOLUME_MASTER_KEY,
            &vmk_payload,
        )
    }

    #[test]
    fn test_unlock_vmk_with_password() {
        let vmk_key = [0x5Au8; 32];
        let raw = password_vmk_entry("hunter2", [0x10; 16], &vmk_key);
        let entries = parse_entries(&raw).unwrap();

        let unlocked = unlock_vmk(&entries, &PasswordHashes::derive("hunter2")).unwrap();
        assert_eq!(unlocked.key.as_slice(), &vmk_key);
        assert_eq!(unlocked.source, KeySource::Password);
    }

    #[test]
    fn test_unlock_vmk_wrong_password() {
        let raw = password_vmk_entry("hunter2", [0x10; 16], &[0x5A; 32]);
        let entries = parse_entries(&raw).unwrap();

        match unlock_vmk(&entries, &PasswordHashes::derive("wrongpassword")) {
            Err(UnlockError::WrongPassword) => {}
            other => panic!("expected WrongPassword, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unlock_vmk_needs_password() {
        let raw = password_vmk_entry("hunter2", [0x10; 16], &[0x5A; 32]);
        let entries = parse_entries(&raw).unwrap();

        match unlock_vmk(&entries, &PasswordHashes::none()) {
            Err(UnlockError::NeedPassword) => {}
            other => panic!("expected NeedPassword, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_tpm_only_reports_unsupported() {
        let mut vmk_payload = vec![0u8; 16];
        vmk_payload.extend_from_slice(&[0u8; 8]);
        vmk_payload.extend_from_slice(&[0u8; 2]);
        vmk_payload.extend_from_slice(&PROTECTION_TPM.to_le_bytes());
        let raw = build_entry(
            ENTRY_TYPE_VMK,
            super::super::metadata::VALUE_TYPE_VOLUME_MASTER_KEY,
            &vmk_payload,
        );
        let entries = parse_entries(&raw).unwrap();

        match unlock_vmk(&entries, &PasswordHashes::none()) {
            Err(UnlockError::UnsupportedProtection(kinds)) => {
                assert_eq!(kinds, vec!["TPM".to_string()]);
            }
            other => panic!("expected UnsupportedProtection, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_fvek_unwrap() {
        let vmk = UnlockedVmk {
            key: vec![0x77u8; 32],
            source: KeySource::Password,
        };
        let fvek_key = [0xC3u8; 32];

        let mut key_payload = 0x8004u32.to_le_bytes().to_vec();
        key_payload.extend_from_slice(&fvek_key);
        let key_entry = build_entry(0, VALUE_TYPE_KEY, &key_payload);

        let nonce = [0x09u8; 12];
        let wrapped = test_support::ccm_wrap(&vmk.key, &nonce, &key_entry);
        let mut ccm_payload = nonce.to_vec();
        ccm_payload.extend_from_slice(&wrapped);
        let raw = build_entry(ENTRY_TYPE_FVEK, VALUE_TYPE_AES_CCM_ENCRYPTED_KEY, &ccm_payload);

        let entries = parse_entries(&raw).unwrap();
        let (enc_type, key) = unwrap_fvek(&entries, &vmk).unwrap();
        assert_eq!(enc_type, 0x8004);
        assert_eq!(key.as_slice(), &fvek_key);
    }
}
