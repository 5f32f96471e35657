//! Persistence of the compliance document.

use crate::document::ComplianceDocument;
use crate::error::ComplianceError;
use custodian_core::utils::{write_atomic, Sealer};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

const DOCUMENT_FILE: &str = "compliance.sealed";

/// Backing store for consent, tracked records and retention policies.
///
/// Stores hold the serialized document opaquely; its schema is internal.
pub trait ComplianceStore: Send + Sync {
    fn load_document(&self) -> Result<Option<String>, ComplianceError>;

    /// Replace the stored document atomically.
    fn save_document(&self, json: &str) -> Result<(), ComplianceError>;
}

pub(crate) fn load(store: &dyn ComplianceStore) -> Result<ComplianceDocument, ComplianceError> {
    match store.load_document()? {
        Some(json) => Ok(serde_json::from_str::<ComplianceDocument>(&json)?.reindexed()),
        None => Ok(ComplianceDocument::default()),
    }
}

pub(crate) fn save(
    store: &dyn ComplianceStore,
    document: &ComplianceDocument,
) -> Result<(), ComplianceError> {
    store.save_document(&serde_json::to_string(document)?)
}

#[derive(Default)]
pub struct MemoryComplianceStore {
    json: Mutex<Option<String>>,
}

impl MemoryComplianceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComplianceStore for MemoryComplianceStore {
    fn load_document(&self) -> Result<Option<String>, ComplianceError> {
        Ok(self.json.lock().clone())
    }

    fn save_document(&self, json: &str) -> Result<(), ComplianceError> {
        *self.json.lock() = Some(json.to_string());
        Ok(())
    }
}

/// Sealed document under a directory, replaced atomically on every change.
pub struct FileComplianceStore {
    path: PathBuf,
    sealer: Sealer,
}

impl FileComplianceStore {
    pub fn open(dir: &Path, sealer: Sealer) -> Result<Self, ComplianceError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(DOCUMENT_FILE),
            sealer,
        })
    }
}

impl ComplianceStore for FileComplianceStore {
    fn load_document(&self) -> Result<Option<String>, ComplianceError> {
        let sealed = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = self.sealer.open(&sealed)?;
        let json = String::from_utf8(json)
            .map_err(|e| ComplianceError::Storage(format!("document is not UTF-8: {}", e)))?;
        tracing::info!(path = %self.path.display(), "Loaded compliance document");
        Ok(Some(json))
    }

    fn save_document(&self, json: &str) -> Result<(), ComplianceError> {
        write_atomic(&self.path, &self.sealer.seal(json.as_bytes())?)?;
        Ok(())
    }
}
