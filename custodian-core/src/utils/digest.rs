use crate::error::CoreError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `parts` joined with `|`, hex encoded.
///
/// Used for stable pseudonyms and for deriving per-store sub-keys.
pub fn keyed_digest(secret: &[u8], parts: &[&str]) -> Result<String, CoreError> {
    Ok(hex::encode(keyed_digest_bytes(secret, parts)?))
}

pub fn keyed_digest_bytes(secret: &[u8], parts: &[&str]) -> Result<[u8; 32], CoreError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| CoreError::Crypto(format!("Invalid key length: {}", e)))?;
    mac.update(parts.join("|").as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Verify a hex digest using constant-time comparison
pub fn verify_keyed_digest(secret: &[u8], parts: &[&str], digest: &str) -> bool {
    let Ok(expected) = keyed_digest(secret, parts) else {
        return false;
    };
    let expected_bytes = expected.as_bytes();
    let digest_bytes = digest.as_bytes();

    if expected_bytes.len() != digest_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(digest_bytes).into()
}
