//! Persistence of the policy document.

use crate::error::AccessError;
use crate::policy::PolicyDocument;
use custodian_core::utils::{write_atomic, Sealer};
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;

pub trait PolicyStore: Send + Sync {
    fn load(&self) -> Result<Option<PolicyDocument>, AccessError>;

    /// Replace the stored document atomically.
    fn save(&self, document: &PolicyDocument) -> Result<(), AccessError>;
}

#[derive(Default)]
pub struct MemoryPolicyStore {
    document: Mutex<Option<PolicyDocument>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn load(&self) -> Result<Option<PolicyDocument>, AccessError> {
        Ok(self.document.lock().clone())
    }

    fn save(&self, document: &PolicyDocument) -> Result<(), AccessError> {
        *self.document.lock() = Some(document.clone());
        Ok(())
    }
}

/// Single sealed JSON document at `path`.
pub struct FilePolicyStore {
    path: PathBuf,
    sealer: Sealer,
}

impl FilePolicyStore {
    pub fn new(path: impl Into<PathBuf>, sealer: Sealer) -> Self {
        Self {
            path: path.into(),
            sealer,
        }
    }
}

impl PolicyStore for FilePolicyStore {
    fn load(&self) -> Result<Option<PolicyDocument>, AccessError> {
        let sealed = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = self.sealer.open(&sealed)?;
        let document: PolicyDocument = serde_json::from_slice(&json)?;
        tracing::info!(
            path = %self.path.display(),
            version = document.version,
            roles = document.roles.len(),
            "Loaded access policy"
        );
        Ok(Some(document))
    }

    fn save(&self, document: &PolicyDocument) -> Result<(), AccessError> {
        let json = serde_json::to_vec(document)?;
        write_atomic(&self.path, &self.sealer.seal(&json)?)?;
        Ok(())
    }
}
