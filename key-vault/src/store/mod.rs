//! Backing stores for key records.

mod file;
mod memory;

pub use file::FileKeyStore;
pub use memory::MemoryKeyStore;

use crate::error::VaultError;
use crate::models::KeyInfo;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Persisted form of one key. `material` is base64 and absent once retired.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredKey {
    #[zeroize(skip)]
    pub info: KeyInfo,
    #[serde(default)]
    pub material: Option<String>,
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey")
            .field("info", &self.info)
            .field("material", &self.material.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Key record persistence. Every `save` must replace the record atomically.
pub trait KeyStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<StoredKey>, VaultError>;

    fn save(&self, key: &StoredKey) -> Result<(), VaultError>;
}
