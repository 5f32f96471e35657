use crate::error::VaultError;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// Per-message AES-256-GCM data key wrapped with RSA-OAEP(SHA-256).
    #[serde(rename = "RSA-OAEP-256+AES-256-GCM")]
    RsaOaepAes256Gcm,
    #[serde(rename = "RSA-PKCS1v15-SHA256")]
    RsaPkcs1v15Sha256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::RsaOaepAes256Gcm => "RSA-OAEP-256+AES-256-GCM",
            Algorithm::RsaPkcs1v15Sha256 => "RSA-PKCS1v15-SHA256",
        }
    }
}

/// Self-describing ciphertext or signature.
///
/// Serialized as JSON; binary fields are base64. The key id and algorithm
/// are bound into the AEAD associated data, so they cannot be swapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub algorithm: Algorithm,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_key: Option<String>,
    pub data: String,
}

impl Envelope {
    pub(crate) fn new(algorithm: Algorithm, key_id: &str, data: &[u8]) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            algorithm,
            key_id: key_id.to_string(),
            nonce: None,
            wrapped_key: None,
            data: general_purpose::STANDARD.encode(data),
        }
    }

    pub(crate) fn with_nonce(mut self, nonce: &[u8]) -> Self {
        self.nonce = Some(general_purpose::STANDARD.encode(nonce));
        self
    }

    pub(crate) fn with_wrapped_key(mut self, wrapped: &[u8]) -> Self {
        self.wrapped_key = Some(general_purpose::STANDARD.encode(wrapped));
        self
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, VaultError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::MalformedCiphertext(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(VaultError::MalformedCiphertext(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VaultError> {
        serde_json::to_vec(self).map_err(|e| VaultError::Crypto(e.to_string()))
    }

    /// Associated data authenticated alongside the payload.
    pub(crate) fn aad(algorithm: Algorithm, key_id: &str) -> Vec<u8> {
        format!("v{}|{}|{}", ENVELOPE_VERSION, algorithm.as_str(), key_id).into_bytes()
    }

    pub(crate) fn expect(&self, algorithm: Algorithm) -> Result<(), VaultError> {
        if self.algorithm != algorithm {
            return Err(VaultError::MalformedCiphertext(format!(
                "expected {}, found {}",
                algorithm.as_str(),
                self.algorithm.as_str()
            )));
        }
        Ok(())
    }

    pub(crate) fn data_bytes(&self) -> Result<Vec<u8>, VaultError> {
        decode_field("data", &self.data)
    }

    pub(crate) fn nonce_bytes(&self) -> Result<Vec<u8>, VaultError> {
        match &self.nonce {
            Some(nonce) => decode_field("nonce", nonce),
            None => Err(VaultError::MalformedCiphertext("missing nonce".to_string())),
        }
    }

    pub(crate) fn wrapped_key_bytes(&self) -> Result<Vec<u8>, VaultError> {
        match &self.wrapped_key {
            Some(wrapped) => decode_field("wrapped_key", wrapped),
            None => Err(VaultError::MalformedCiphertext("missing wrapped_key".to_string())),
        }
    }
}

fn decode_field(field: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|e| VaultError::MalformedCiphertext(format!("invalid base64 in {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_shape() {
        let envelope = Envelope::new(Algorithm::Aes256Gcm, "k-1", b"ct").with_nonce(&[0u8; 12]);
        let json: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["algorithm"], "AES-256-GCM");
        assert_eq!(json["key_id"], "k-1");
        assert!(json.get("wrapped_key").is_none());
    }

    #[test]
    fn test_parse_rejects_garbage_and_unknown_versions() {
        assert!(matches!(
            Envelope::parse(b"not json"),
            Err(VaultError::MalformedCiphertext(_))
        ));

        let mut envelope = Envelope::new(Algorithm::Aes256Gcm, "k-1", b"ct");
        envelope.version = 9;
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(Envelope::parse(&bytes).is_err());
    }

    #[test]
    fn test_missing_nonce_is_malformed() {
        let envelope = Envelope::new(Algorithm::Aes256Gcm, "k-1", b"ct");
        assert!(matches!(
            envelope.nonce_bytes(),
            Err(VaultError::MalformedCiphertext(_))
        ));
        assert!(envelope.expect(Algorithm::RsaOaepAes256Gcm).is_err());
    }
}
