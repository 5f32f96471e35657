//! At-rest protection: Argon2id master key derivation and AES-256-GCM sealing.

use crate::config::KdfConfig;
use crate::error::CoreError;
use crate::utils::digest::keyed_digest_bytes;
use crate::utils::fs::load_or_create_salt;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// 96-bit nonce, prefixed to every sealed blob.
pub const NONCE_SIZE: usize = 12;

/// Key derived from the operator's master password (zeroized on drop).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Derive a master key from a password using Argon2id.
    pub fn derive(password: &[u8], salt: &[u8], kdf: &KdfConfig) -> Result<Self, CoreError> {
        let params = Params::new(
            kdf.memory_kib,
            kdf.iterations,
            kdf.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CoreError::KeyDerivation(format!("Invalid Argon2 params: {e}")))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut bytes = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(password, salt, &mut bytes)
            .map_err(|e| CoreError::KeyDerivation(format!("Argon2 failed: {e}")))?;

        Ok(Self { bytes })
    }

    /// Fresh random key, for stores that never outlive the process.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Independent sub-key for one purpose, so stores never share a key.
    pub fn subkey(&self, label: &str) -> Result<Self, CoreError> {
        Ok(Self {
            bytes: keyed_digest_bytes(&self.bytes, &["custodian-subkey", label])?,
        })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

/// Seals and opens opaque blobs with AES-256-GCM.
///
/// Layout of a sealed blob: `nonce (12 bytes) || ciphertext+tag`.
pub struct Sealer {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl Sealer {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            key: Zeroizing::new(*key.as_bytes()),
        }
    }

    /// Sealer for a store directory: per-directory salt, password-derived
    /// master key, then a sub-key for `label`.
    pub fn for_directory(
        dir: &Path,
        password: &[u8],
        kdf: &KdfConfig,
        label: &str,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(dir)?;
        let salt = load_or_create_salt(dir)?;
        let master = MasterKey::derive(password, &salt, kdf)?;
        Ok(Self::new(&master.subkey(label)?))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|e| CoreError::Crypto(format!("Invalid key: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CoreError::Crypto(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CoreError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CoreError::Crypto(format!(
                "Sealed blob too short: {} bytes",
                sealed.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|e| CoreError::Crypto(format!("Invalid key: {e}")))?;

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CoreError::Crypto(format!("Decryption failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_kdf() -> KdfConfig {
        KdfConfig {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_derive_deterministic() {
        let key1 = MasterKey::derive(b"password123", b"salt-salt-salt-1", &cheap_kdf()).unwrap();
        let key2 = MasterKey::derive(b"password123", b"salt-salt-salt-1", &cheap_kdf()).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_different_salts_different_keys() {
        let key1 = MasterKey::derive(b"password", b"salt-salt-salt-1", &cheap_kdf()).unwrap();
        let key2 = MasterKey::derive(b"password", b"salt-salt-salt-2", &cheap_kdf()).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_subkeys_are_independent() {
        let master = MasterKey::from_bytes([7u8; KEY_SIZE]);
        let keys = master.subkey("keys").unwrap();
        let audit = master.subkey("audit").unwrap();
        assert_ne!(keys.as_bytes(), audit.as_bytes());
        assert_ne!(keys.as_bytes(), master.as_bytes());
    }

    #[test]
    fn test_seal_open() {
        let sealer = Sealer::new(&MasterKey::random());
        let sealed = sealer.seal(b"key material").unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], b"key material");
        assert_eq!(sealer.open(&sealed).unwrap(), b"key material");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = Sealer::new(&MasterKey::random()).seal(b"secret").unwrap();
        let other = Sealer::new(&MasterKey::random());
        assert!(matches!(other.open(&sealed), Err(CoreError::Crypto(_))));
    }

    #[test]
    fn test_tampered_blob_fails() {
        let sealer = Sealer::new(&MasterKey::random());
        let mut sealed = sealer.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(sealer.open(&sealed).is_err());
    }

    #[test]
    fn test_short_blob_rejected() {
        let sealer = Sealer::new(&MasterKey::random());
        assert!(sealer.open(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_for_directory_reuses_salt() {
        let dir = tempfile::tempdir().unwrap();
        let first = Sealer::for_directory(dir.path(), b"pw", &cheap_kdf(), "keys").unwrap();
        let sealed = first.seal(b"payload").unwrap();

        let again = Sealer::for_directory(dir.path(), b"pw", &cheap_kdf(), "keys").unwrap();
        assert_eq!(again.open(&sealed).unwrap(), b"payload");

        let other_label = Sealer::for_directory(dir.path(), b"pw", &cheap_kdf(), "audit").unwrap();
        assert!(other_label.open(&sealed).is_err());
    }
}
