use super::{KeyStore, StoredKey};
use crate::error::VaultError;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Keeps records in process memory. Keys vanish with the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, StoredKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_all(&self) -> Result<Vec<StoredKey>, VaultError> {
        Ok(self.keys.lock().values().cloned().collect())
    }

    fn save(&self, key: &StoredKey) -> Result<(), VaultError> {
        self.keys.lock().insert(key.info.id.clone(), key.clone());
        Ok(())
    }
}
