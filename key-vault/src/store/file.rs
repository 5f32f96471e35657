use super::{KeyStore, StoredKey};
use crate::error::VaultError;
use custodian_core::utils::{write_atomic, Sealer};
use std::fs;
use std::path::PathBuf;
use zeroize::Zeroizing;

const KEY_SUFFIX: &str = "key";

/// One sealed file per key (`<id>.key`), replaced atomically on every change.
pub struct FileKeyStore {
    dir: PathBuf,
    sealer: Sealer,
}

impl FileKeyStore {
    pub fn open(dir: impl Into<PathBuf>, sealer: Sealer) -> Result<Self, VaultError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, sealer })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, KEY_SUFFIX))
    }
}

impl KeyStore for FileKeyStore {
    fn load_all(&self) -> Result<Vec<StoredKey>, VaultError> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_SUFFIX) {
                continue;
            }

            let sealed = fs::read(&path)?;
            let json = Zeroizing::new(self.sealer.open(&sealed).map_err(|e| {
                VaultError::Storage(format!("Cannot open {}: {}", path.display(), e))
            })?);
            let key: StoredKey = serde_json::from_slice(&json).map_err(|e| {
                VaultError::Storage(format!("Corrupt key record {}: {}", path.display(), e))
            })?;
            keys.push(key);
        }

        tracing::debug!(dir = %self.dir.display(), count = keys.len(), "Loaded key records");
        Ok(keys)
    }

    fn save(&self, key: &StoredKey) -> Result<(), VaultError> {
        let json = Zeroizing::new(
            serde_json::to_vec(key).map_err(|e| VaultError::Storage(e.to_string()))?,
        );
        let sealed = self.sealer.seal(&json)?;
        write_atomic(&self.path_for(&key.info.id), &sealed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeyInfo, KeyKind};
    use custodian_core::utils::MasterKey;

    #[test]
    fn test_records_are_sealed_and_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path(), Sealer::new(&MasterKey::from_bytes([1u8; 32]))).unwrap();

        let key = StoredKey {
            info: KeyInfo::new("k1", KeyKind::Symmetric, 1),
            material: Some("c2VjcmV0LWtleS1tYXRlcmlhbA==".to_string()),
        };
        store.save(&key).unwrap();

        let raw = fs::read(dir.path().join(format!("{}.key", key.info.id))).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("k1"));

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].info, key.info);
        assert_eq!(loaded[0].material, key.material);
    }

    #[test]
    fn test_wrong_master_key_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path(), Sealer::new(&MasterKey::from_bytes([1u8; 32]))).unwrap();
        store
            .save(&StoredKey {
                info: KeyInfo::new("k1", KeyKind::Symmetric, 1),
                material: None,
            })
            .unwrap();

        let other = FileKeyStore::open(dir.path(), Sealer::new(&MasterKey::from_bytes([2u8; 32]))).unwrap();
        assert!(matches!(other.load_all(), Err(VaultError::Storage(_))));
    }
}
