//! Key material and the primitive operations performed with it.
//!
//! Nothing in this module leaves the crate: the vault is the only owner.

use crate::error::VaultError;
use crate::models::KeyKind;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub(crate) const DATA_KEY_SIZE: usize = 32;
pub(crate) const NONCE_SIZE: usize = 12;

pub(crate) enum KeyMaterial {
    Symmetric(Zeroizing<[u8; DATA_KEY_SIZE]>),
    // RsaPrivateKey zeroizes itself on drop.
    Asymmetric {
        private: Box<RsaPrivateKey>,
        public: RsaPublicKey,
    },
}

impl KeyMaterial {
    pub(crate) fn generate(kind: KeyKind, rsa_bits: usize) -> Result<Self, VaultError> {
        match kind {
            KeyKind::Symmetric => Ok(KeyMaterial::Symmetric(random_data_key())),
            KeyKind::Asymmetric => {
                let private = RsaPrivateKey::new(&mut rand::thread_rng(), rsa_bits)?;
                let public = RsaPublicKey::from(&private);
                Ok(KeyMaterial::Asymmetric {
                    private: Box::new(private),
                    public,
                })
            }
        }
    }

    pub(crate) fn kind(&self) -> KeyKind {
        match self {
            KeyMaterial::Symmetric(_) => KeyKind::Symmetric,
            KeyMaterial::Asymmetric { .. } => KeyKind::Asymmetric,
        }
    }

    /// Raw AES key or PKCS#8 DER, for the key store only.
    pub(crate) fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        match self {
            KeyMaterial::Symmetric(key) => Ok(Zeroizing::new(key.to_vec())),
            KeyMaterial::Asymmetric { private, .. } => {
                let der = private
                    .to_pkcs8_der()
                    .map_err(|e| VaultError::Crypto(format!("PKCS#8 encoding failed: {}", e)))?;
                Ok(Zeroizing::new(der.as_bytes().to_vec()))
            }
        }
    }

    pub(crate) fn from_bytes(kind: KeyKind, bytes: &[u8]) -> Result<Self, VaultError> {
        match kind {
            KeyKind::Symmetric => {
                if bytes.len() != DATA_KEY_SIZE {
                    return Err(VaultError::Storage(format!(
                        "Symmetric key has {} bytes, expected {}",
                        bytes.len(),
                        DATA_KEY_SIZE
                    )));
                }
                let mut key = Zeroizing::new([0u8; DATA_KEY_SIZE]);
                key.copy_from_slice(bytes);
                Ok(KeyMaterial::Symmetric(key))
            }
            KeyKind::Asymmetric => {
                let private = RsaPrivateKey::from_pkcs8_der(bytes)
                    .map_err(|e| VaultError::Storage(format!("Invalid PKCS#8 key: {}", e)))?;
                let public = RsaPublicKey::from(&private);
                Ok(KeyMaterial::Asymmetric {
                    private: Box::new(private),
                    public,
                })
            }
        }
    }

    pub(crate) fn symmetric_key(&self) -> Option<&[u8; DATA_KEY_SIZE]> {
        match self {
            KeyMaterial::Symmetric(key) => Some(&**key),
            KeyMaterial::Asymmetric { .. } => None,
        }
    }

    /// RSA-OAEP(SHA-256) wrap of a per-message data key.
    pub(crate) fn wrap_key(&self, data_key: &[u8]) -> Result<Vec<u8>, VaultError> {
        let public = self.public()?;
        Ok(public.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data_key)?)
    }

    pub(crate) fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let private = self.private()?;
        Ok(Zeroizing::new(private.decrypt(Oaep::new::<Sha256>(), wrapped)?))
    }

    /// PKCS#1 v1.5 signature over SHA-256(message).
    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>, VaultError> {
        let private = self.private()?;
        let digest = Sha256::digest(message);
        Ok(private.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
    }

    pub(crate) fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, VaultError> {
        let public = self.public()?;
        let digest = Sha256::digest(message);
        Ok(public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok())
    }

    pub(crate) fn public_pem(&self) -> Result<String, VaultError> {
        self.public()?
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| VaultError::Crypto(format!("PEM encoding failed: {}", e)))
    }

    fn public(&self) -> Result<&RsaPublicKey, VaultError> {
        match self {
            KeyMaterial::Asymmetric { public, .. } => Ok(public),
            KeyMaterial::Symmetric(_) => Err(VaultError::Crypto(
                "symmetric key used for an asymmetric operation".to_string(),
            )),
        }
    }

    fn private(&self) -> Result<&RsaPrivateKey, VaultError> {
        match self {
            KeyMaterial::Asymmetric { private, .. } => Ok(&**private),
            KeyMaterial::Symmetric(_) => Err(VaultError::Crypto(
                "symmetric key used for an asymmetric operation".to_string(),
            )),
        }
    }
}

pub(crate) fn random_data_key() -> Zeroizing<[u8; DATA_KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; DATA_KEY_SIZE]);
    rand::thread_rng().fill_bytes(&mut key[..]);
    key
}

/// AES-256-GCM with associated data. Returns `(nonce, ciphertext)`.
pub(crate) fn aead_seal(
    key: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>), VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("Invalid key: {}", e)))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| VaultError::Crypto(format!("Encryption failed: {}", e)))?;
    Ok((nonce, ciphertext))
}

pub(crate) fn aead_open(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, VaultError> {
    if nonce.len() != NONCE_SIZE {
        return Err(VaultError::MalformedCiphertext(format!(
            "nonce has {} bytes, expected {}",
            nonce.len(),
            NONCE_SIZE
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("Invalid key: {}", e)))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|e| VaultError::Crypto(format!("Decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aead_binds_associated_data() {
        let key = random_data_key();
        let (nonce, ct) = aead_seal(&key[..], b"hello", b"key-1").unwrap();
        assert_eq!(aead_open(&key[..], &nonce, &ct, b"key-1").unwrap(), b"hello");
        assert!(aead_open(&key[..], &nonce, &ct, b"key-2").is_err());
    }

    #[test]
    fn test_symmetric_material_roundtrips_through_bytes() {
        let material = KeyMaterial::generate(KeyKind::Symmetric, 0).unwrap();
        let bytes = material.to_bytes().unwrap();
        let restored = KeyMaterial::from_bytes(KeyKind::Symmetric, &bytes).unwrap();
        assert_eq!(material.symmetric_key(), restored.symmetric_key());
        assert!(KeyMaterial::from_bytes(KeyKind::Symmetric, &bytes[..16]).is_err());
    }

    #[test]
    fn test_rsa_wrap_sign_and_reload() {
        let material = KeyMaterial::generate(KeyKind::Asymmetric, 1024).unwrap();
        let wrapped = material.wrap_key(b"data key").unwrap();
        assert_eq!(material.unwrap_key(&wrapped).unwrap().as_slice(), b"data key");

        let sig = material.sign(b"message").unwrap();
        assert!(material.verify(b"message", &sig).unwrap());
        assert!(!material.verify(b"massage", &sig).unwrap());

        let restored =
            KeyMaterial::from_bytes(KeyKind::Asymmetric, &material.to_bytes().unwrap()).unwrap();
        assert!(restored.verify(b"message", &sig).unwrap());
        assert!(material.public_pem().unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_symmetric_material_rejects_rsa_operations() {
        let material = KeyMaterial::generate(KeyKind::Symmetric, 0).unwrap();
        assert!(material.sign(b"m").is_err());
        assert_eq!(material.kind(), KeyKind::Symmetric);
    }
}
