use crate::document::{BlobRef, ComplianceDocument, SealedBlob, StoredConsent, StoredRecord};
use crate::error::ComplianceError;
use crate::external::ExternalDataHandler;
use crate::models::{
    ComplianceReport, ConsentRecord, Disposition, ErasureReport, ExportedRecord, MigrationReport,
    TrackedRecord, UserDataExport, AUDIT_CATEGORY, CONSENT_CATEGORY,
};
use crate::store::{self, ComplianceStore, MemoryComplianceStore};
use crate::usage::RecordsUsage;
use arc_swap::ArcSwap;
use audit_pipeline::{AuditCategory, AuditEntry, AuditFilter, AuditOutcome, AuditPipeline, SYSTEM_USER};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use custodian_core::utils::keyed_digest;
use custodian_core::Details;
use key_vault::{KeyKind, KeyVault, VaultError};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Audit detail keys that stay inside the audit trail when events are exported.
const INTERNAL_DETAILS: &[&str] = &["error"];

pub struct ComplianceOptions {
    /// Vault key name sealing consent details and tracked payloads.
    pub records_key: String,
    pseudonym_secret: Zeroizing<Vec<u8>>,
}

impl ComplianceOptions {
    pub fn new(records_key: impl Into<String>, pseudonym_secret: &[u8]) -> Self {
        Self {
            records_key: records_key.into(),
            pseudonym_secret: Zeroizing::new(pseudonym_secret.to_vec()),
        }
    }

    /// Pseudonyms are only stable for the lifetime of this process.
    pub fn with_random_secret(records_key: impl Into<String>) -> Self {
        let mut secret = Zeroizing::new(vec![0u8; 32]);
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            records_key: records_key.into(),
            pseudonym_secret: secret,
        }
    }
}

impl Default for ComplianceOptions {
    fn default() -> Self {
        Self::with_random_secret("compliance-records")
    }
}

impl fmt::Debug for ComplianceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplianceOptions")
            .field("records_key", &self.records_key)
            .field("pseudonym_secret", &"[redacted]")
            .finish()
    }
}

pub(crate) struct ComplianceInner {
    pub snapshot: Arc<ArcSwap<ComplianceDocument>>,
    pub writer: Mutex<()>,
    pub sweep: Mutex<()>,
    pub store: Arc<dyn ComplianceStore>,
    pub vault: KeyVault,
    pub audit: AuditPipeline,
    pub options: ComplianceOptions,
    pub handlers: RwLock<Vec<Arc<dyn ExternalDataHandler>>>,
}

/// Consent, data-subject requests and retention over one persisted document.
///
/// Reads work on an immutable snapshot. Every change clones the document,
/// persists the clone and swaps it in under a single writer lock.
#[derive(Clone)]
pub struct ComplianceManager {
    pub(crate) inner: Arc<ComplianceInner>,
}

impl ComplianceManager {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        vault: KeyVault,
        audit: AuditPipeline,
        options: ComplianceOptions,
    ) -> Result<Self, ComplianceError> {
        let document = store::load(store.as_ref())?;
        vault.ensure_key(&options.records_key, KeyKind::Symmetric)?;

        tracing::info!(
            consents = document.consents.len(),
            records = document.records.len(),
            policies = document.policies.len(),
            "Compliance manager loaded"
        );

        let snapshot = Arc::new(ArcSwap::from_pointee(document));
        vault.register_usage_reporter(Arc::new(RecordsUsage {
            snapshot: snapshot.clone(),
        }));

        Ok(Self {
            inner: Arc::new(ComplianceInner {
                snapshot,
                writer: Mutex::new(()),
                sweep: Mutex::new(()),
                store,
                vault,
                audit,
                options,
                handlers: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn in_memory(vault: KeyVault, audit: AuditPipeline) -> Result<Self, ComplianceError> {
        Self::new(
            Arc::new(MemoryComplianceStore::new()),
            vault,
            audit,
            ComplianceOptions::default(),
        )
    }

    pub fn register_external_handler(&self, handler: Arc<dyn ExternalDataHandler>) {
        tracing::info!(handler = handler.name(), "Registered external data handler");
        self.inner.handlers.write().push(handler);
    }

    // ------------------------------------------------------------------
    // Consent
    // ------------------------------------------------------------------

    /// Append a consent statement. History is never overwritten.
    pub fn record_consent(
        &self,
        user_id: &str,
        consent_type: &str,
        granted: bool,
        details: Option<Details>,
    ) -> Result<String, ComplianceError> {
        require("user id", user_id)?;
        require("consent type", consent_type)?;

        let sealed = match details.as_ref().filter(|d| !d.is_empty()) {
            Some(details) => Some(self.seal(&serde_json::to_vec(details)?)?),
            None => None,
        };
        let consent = StoredConsent {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            consent_type: consent_type.to_string(),
            granted,
            timestamp: Utc::now(),
            details: sealed.clone(),
            disposition: Disposition::Active,
        };
        let id = consent.id.clone();

        if let Err(e) = self.commit(|doc| {
            doc.push_consent(consent);
            Ok(())
        }) {
            if let Some(blob) = &sealed {
                self.discard(blob);
            }
            return Err(e);
        }

        self.audit(
            AuditEntry::new(
                AuditCategory::Compliance,
                "consent_recorded",
                user_id,
                AuditOutcome::Success,
            )
            .details(
                Details::new()
                    .with("consent_type", consent_type)
                    .with("granted", granted)
                    .with("record_id", id.as_str()),
            ),
        );
        tracing::debug!(consent_type, granted, "Consent recorded");
        Ok(id)
    }

    /// Granted flag of the latest record. No record means no consent.
    pub fn check_consent(&self, user_id: &str, consent_type: &str) -> bool {
        self.inner
            .snapshot
            .load()
            .consent_granted(user_id, consent_type)
    }

    /// Full history for a user, oldest first, details decrypted.
    pub fn consent_history(&self, user_id: &str) -> Result<Vec<ConsentRecord>, ComplianceError> {
        let snapshot = self.inner.snapshot.load_full();
        snapshot
            .consents
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| self.consent_view(c))
            .collect()
    }

    // ------------------------------------------------------------------
    // Tracked records
    // ------------------------------------------------------------------

    /// Register personal data this core is responsible for. The payload is
    /// sealed with the records key before it is stored.
    pub fn track_record(
        &self,
        user_id: &str,
        data_category: &str,
        payload: &[u8],
    ) -> Result<String, ComplianceError> {
        require("user id", user_id)?;
        require("data category", data_category)?;
        if data_category == CONSENT_CATEGORY || data_category == AUDIT_CATEGORY {
            return Err(ComplianceError::InvalidInput(format!(
                "data category {} is reserved",
                data_category
            )));
        }

        let sealed = self.seal(payload)?;
        let record = StoredRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            data_category: data_category.to_string(),
            created_at: Utc::now(),
            payload: Some(sealed.clone()),
            legal_hold: false,
            disposition: Disposition::Active,
        };
        let id = record.id.clone();

        if let Err(e) = self.commit(|doc| {
            doc.records.insert(record.id.clone(), record);
            Ok(())
        }) {
            self.discard(&sealed);
            return Err(e);
        }

        self.audit(
            AuditEntry::new(
                AuditCategory::Compliance,
                "record_tracked",
                user_id,
                AuditOutcome::Success,
            )
            .details(
                Details::new()
                    .with("record_id", id.as_str())
                    .with("data_category", data_category),
            ),
        );
        Ok(id)
    }

    pub fn record(&self, record_id: &str) -> Option<TrackedRecord> {
        self.inner
            .snapshot
            .load()
            .records
            .get(record_id)
            .map(StoredRecord::view)
    }

    pub fn records_of(&self, user_id: &str) -> Vec<TrackedRecord> {
        self.inner
            .snapshot
            .load()
            .records
            .values()
            .filter(|r| r.user_id == user_id)
            .map(StoredRecord::view)
            .collect()
    }

    /// Decrypted payload, or `None` once erased or anonymized.
    pub fn record_payload(&self, record_id: &str) -> Result<Option<Vec<u8>>, ComplianceError> {
        let snapshot = self.inner.snapshot.load_full();
        let record = snapshot
            .records
            .get(record_id)
            .ok_or_else(|| ComplianceError::RecordNotFound(record_id.to_string()))?;
        record.payload.as_ref().map(|blob| self.open(blob)).transpose()
    }

    pub fn place_legal_hold(&self, record_id: &str) -> Result<(), ComplianceError> {
        self.set_legal_hold(record_id, true)
    }

    pub fn release_legal_hold(&self, record_id: &str) -> Result<(), ComplianceError> {
        self.set_legal_hold(record_id, false)
    }

    fn set_legal_hold(&self, record_id: &str, hold: bool) -> Result<(), ComplianceError> {
        let changed = self.commit(|doc| {
            let record = doc
                .records
                .get_mut(record_id)
                .ok_or_else(|| ComplianceError::RecordNotFound(record_id.to_string()))?;
            let changed = record.legal_hold != hold;
            record.legal_hold = hold;
            Ok(changed)
        })?;

        if changed {
            let action = if hold {
                "legal_hold_placed"
            } else {
                "legal_hold_released"
            };
            self.audit(
                AuditEntry::new(AuditCategory::Compliance, action, SYSTEM_USER, AuditOutcome::Success)
                    .detail("record_id", record_id),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data-subject requests
    // ------------------------------------------------------------------

    pub fn export_user_data(&self, user_id: &str) -> Result<UserDataExport, ComplianceError> {
        self.export_user_data_with(user_id, &CancellationToken::new())
    }

    /// Access request bundle: consent history, tracked records, audit events
    /// mentioning the user and every external handler's export.
    ///
    /// Returns `Cancelled` as soon as `token` fires; nothing partial is handed out.
    pub fn export_user_data_with(
        &self,
        user_id: &str,
        token: &CancellationToken,
    ) -> Result<UserDataExport, ComplianceError> {
        require("user id", user_id)?;
        let snapshot = self.inner.snapshot.load_full();

        let mut consents = Vec::new();
        for consent in snapshot.consents.iter().filter(|c| c.user_id == user_id) {
            check_cancelled(token)?;
            consents.push(self.consent_view(consent)?);
        }

        let mut records = Vec::new();
        for record in snapshot.records.values().filter(|r| r.user_id == user_id) {
            check_cancelled(token)?;
            records.push(ExportedRecord {
                record: record.view(),
                payload: record.payload.as_ref().map(|b| self.open(b)).transpose()?,
            });
        }

        let mut audit_events = Vec::new();
        for mut event in self
            .inner
            .audit
            .query_events(AuditFilter::new().mentioning(user_id))
        {
            check_cancelled(token)?;
            event.details = event.details.redacted(INTERNAL_DETAILS);
            audit_events.push(event);
        }

        let handlers = self.inner.handlers.read().clone();
        let mut external = BTreeMap::new();
        for handler in handlers {
            check_cancelled(token)?;
            let exported = handler
                .export(user_id)
                .map_err(|e| ComplianceError::External {
                    handler: handler.name().to_string(),
                    message: format!("{:#}", e),
                })?;
            external.insert(handler.name().to_string(), exported);
        }

        self.audit(
            AuditEntry::new(
                AuditCategory::Compliance,
                "user_data_exported",
                user_id,
                AuditOutcome::Success,
            )
            .details(
                Details::new()
                    .with("consents", consents.len())
                    .with("records", records.len())
                    .with("audit_events", audit_events.len())
                    .with("external_handlers", external.len()),
            ),
        );

        Ok(UserDataExport {
            user_id: user_id.to_string(),
            generated_at: Utc::now(),
            consents,
            records,
            audit_events,
            external,
        })
    }

    /// Right to erasure. Consent and tracked records are pseudonymised and
    /// their sealed contents destroyed; audit events are left untouched.
    /// Records under legal hold are kept and counted.
    pub fn erase_user_data(&self, user_id: &str) -> Result<ErasureReport, ComplianceError> {
        require("user id", user_id)?;
        let pseudonym = self.pseudonym(user_id)?;

        let (mut report, released) = self.commit(|doc| {
            let mut report = ErasureReport {
                pseudonym: pseudonym.clone(),
                ..ErasureReport::default()
            };
            let mut released = Vec::new();

            for consent in doc.consents.iter_mut().filter(|c| c.user_id == user_id) {
                consent.user_id = pseudonym.clone();
                consent.disposition = Disposition::Erased;
                released.extend(consent.details.take());
                report.consents_erased += 1;
            }
            for record in doc.records.values_mut().filter(|r| r.user_id == user_id) {
                if record.legal_hold {
                    report.records_held += 1;
                    continue;
                }
                record.user_id = pseudonym.clone();
                record.disposition = Disposition::Erased;
                released.extend(record.payload.take());
                report.records_erased += 1;
            }

            doc.stats.erasures += 1;
            doc.reindex();
            Ok((report, released))
        })?;

        for blob in &released {
            self.discard(blob);
        }

        let handlers = self.inner.handlers.read().clone();
        for handler in handlers {
            if let Err(e) = handler.erase(user_id, &pseudonym) {
                tracing::error!(handler = handler.name(), error = %e, "External erasure failed");
                report.handler_failures.push(handler.name().to_string());
            }
        }

        let outcome = if report.handler_failures.is_empty() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit(
            AuditEntry::new(AuditCategory::Compliance, "user_data_erased", SYSTEM_USER, outcome)
                .details(
                    Details::new()
                        .with("subject", pseudonym.as_str())
                        .with("consents", report.consents_erased)
                        .with("records", report.records_erased)
                        .with("records_held", report.records_held)
                        .with("handler_failures", report.handler_failures.len()),
                ),
        );
        tracing::info!(
            subject = %pseudonym,
            consents = report.consents_erased,
            records = report.records_erased,
            held = report.records_held,
            "User data erased"
        );
        Ok(report)
    }

    /// Stable replacement id for `user_id`.
    pub fn pseudonym(&self, user_id: &str) -> Result<String, ComplianceError> {
        let digest = keyed_digest(&self.inner.options.pseudonym_secret, &["pseudonym", user_id])?;
        Ok(format!("anon-{}", &digest[..16]))
    }

    // ------------------------------------------------------------------
    // Encryption maintenance
    // ------------------------------------------------------------------

    /// Re-seal every blob not under the active records key, so rotated
    /// keys can be retired.
    pub fn migrate_encryption(&self) -> Result<MigrationReport, ComplianceError> {
        let records_key = &self.inner.options.records_key;
        let active = self
            .inner
            .vault
            .active_key_id(records_key)
            .ok_or_else(|| VaultError::KeyNotFound(records_key.clone()))?;

        let stale: Vec<(BlobRef, SealedBlob)> = self
            .inner
            .snapshot
            .load()
            .blobs()
            .filter(|(_, blob)| blob.key_id != active)
            .map(|(slot, blob)| (slot, blob.clone()))
            .collect();
        if stale.is_empty() {
            return Ok(MigrationReport::default());
        }

        let mut report = MigrationReport::default();
        let mut resealed = Vec::with_capacity(stale.len());
        for (slot, old) in stale {
            match self.reseal(&old) {
                Ok(new) => resealed.push((slot, old, new)),
                Err(e) => {
                    tracing::warn!(key_id = %old.key_id, error = %e, "Failed to re-encrypt compliance blob");
                    report.failed += 1;
                }
            }
        }

        let (migrated, orphaned) = self.commit(|doc| {
            let mut migrated = 0;
            let mut orphaned = Vec::new();
            for (slot, old, new) in resealed {
                match doc.blob_slot(&slot) {
                    Some(current) if current.as_ref() == Some(&old) => {
                        *current = Some(new);
                        migrated += 1;
                    }
                    // Erased or deleted while we were re-encrypting.
                    _ => orphaned.push(new),
                }
            }
            Ok((migrated, orphaned))
        })?;
        for blob in &orphaned {
            self.discard(blob);
        }
        report.migrated = migrated;

        self.audit(
            AuditEntry::new(
                AuditCategory::KeyManagement,
                "compliance_records_reencrypted",
                SYSTEM_USER,
                if report.failed == 0 {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Failure
                },
            )
            .details(
                Details::new()
                    .with("key_id", active.as_str())
                    .with("migrated", report.migrated)
                    .with("failed", report.failed),
            ),
        );
        Ok(report)
    }

    /// Aggregate statistics that contain no user ids.
    pub fn compliance_report(&self) -> ComplianceReport {
        let doc = self.inner.snapshot.load();

        let mut records_by_category: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        let mut legal_holds = 0;
        for record in doc.records.values() {
            *records_by_category
                .entry(record.data_category.clone())
                .or_default()
                .entry(record.disposition.as_str().to_string())
                .or_default() += 1;
            if record.legal_hold {
                legal_holds += 1;
            }
        }
        let (_, policy_conflicts) = doc.resolve_policies();

        ComplianceReport {
            generated_at: Utc::now(),
            consents_by_type: doc.consent_counts(),
            records_by_category,
            legal_holds,
            erasures: doc.stats.erasures,
            deleted_by_category: doc.stats.deleted.clone(),
            anonymized_by_category: doc.stats.anonymized.clone(),
            policies: doc.policies.len(),
            policy_conflicts,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Apply `change` to a copy of the document, persist it, then publish it.
    pub(crate) fn commit<T, F>(&self, change: F) -> Result<T, ComplianceError>
    where
        F: FnOnce(&mut ComplianceDocument) -> Result<T, ComplianceError>,
    {
        let _writer = self.inner.writer.lock();
        let mut next = ComplianceDocument::clone(&self.inner.snapshot.load());
        let out = change(&mut next)?;
        store::save(self.inner.store.as_ref(), &next)?;
        self.inner.snapshot.store(Arc::new(next));
        Ok(out)
    }

    pub(crate) fn audit(&self, entry: AuditEntry) {
        self.inner.audit.record(entry);
    }

    fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob, ComplianceError> {
        let vault = &self.inner.vault;
        let ciphertext = vault.encrypt_symmetric(&self.inner.options.records_key, plaintext)?;
        Ok(SealedBlob {
            key_id: vault.key_id_of(&ciphertext)?,
            data: general_purpose::STANDARD.encode(&ciphertext),
        })
    }

    fn open(&self, blob: &SealedBlob) -> Result<Vec<u8>, ComplianceError> {
        let ciphertext = general_purpose::STANDARD.decode(&blob.data)?;
        Ok(self
            .inner
            .vault
            .decrypt_symmetric(&self.inner.options.records_key, &ciphertext)?)
    }

    fn reseal(&self, blob: &SealedBlob) -> Result<SealedBlob, ComplianceError> {
        let vault = &self.inner.vault;
        let ciphertext = general_purpose::STANDARD.decode(&blob.data)?;
        let fresh = vault.reencrypt(&self.inner.options.records_key, &ciphertext)?;
        Ok(SealedBlob {
            key_id: vault.key_id_of(&fresh)?,
            data: general_purpose::STANDARD.encode(&fresh),
        })
    }

    /// Tell the vault a sealed blob no longer exists.
    pub(crate) fn discard(&self, blob: &SealedBlob) {
        let released = general_purpose::STANDARD
            .decode(&blob.data)
            .map_err(ComplianceError::from)
            .and_then(|ciphertext| Ok(self.inner.vault.release(&ciphertext)?));
        if let Err(e) = released {
            tracing::warn!(key_id = %blob.key_id, error = %e, "Failed to release sealed blob");
        }
    }

    fn consent_view(&self, consent: &StoredConsent) -> Result<ConsentRecord, ComplianceError> {
        let details = match &consent.details {
            Some(blob) => serde_json::from_slice(&self.open(blob)?)?,
            None => Details::new(),
        };
        Ok(ConsentRecord {
            id: consent.id.clone(),
            user_id: consent.user_id.clone(),
            consent_type: consent.consent_type.clone(),
            granted: consent.granted,
            timestamp: consent.timestamp,
            details,
            disposition: consent.disposition,
        })
    }
}

pub(crate) fn require(what: &str, value: &str) -> Result<(), ComplianceError> {
    if value.trim().is_empty() {
        return Err(ComplianceError::InvalidInput(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn check_cancelled(token: &CancellationToken) -> Result<(), ComplianceError> {
    if token.is_cancelled() {
        return Err(ComplianceError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use key_vault::VaultOptions;

    fn manager() -> (ComplianceManager, KeyVault, AuditPipeline) {
        let audit = AuditPipeline::in_memory();
        let vault = KeyVault::in_memory(audit.clone(), VaultOptions { rsa_bits: 1024 });
        let manager = ComplianceManager::in_memory(vault.clone(), audit.clone()).unwrap();
        (manager, vault, audit)
    }

    #[test]
    fn test_consent_defaults_to_false_and_latest_wins() {
        let (manager, _vault, _audit) = manager();
        assert!(!manager.check_consent("u1", "marketing"));

        manager.record_consent("u1", "marketing", true, None).unwrap();
        assert!(manager.check_consent("u1", "marketing"));
        manager
            .record_consent(
                "u1",
                "marketing",
                false,
                Some(Details::new().with("channel", "email")),
            )
            .unwrap();
        assert!(!manager.check_consent("u1", "marketing"));

        let history = manager.consent_history("u1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1].details.get("channel").and_then(|v| v.as_text()),
            Some("email")
        );
    }

    #[test]
    fn test_payloads_are_sealed_with_records_key() {
        let (manager, vault, _audit) = manager();
        let id = manager.track_record("u1", "invoices", b"iban=DE00").unwrap();

        let record = manager.record(&id).unwrap();
        assert_eq!(record.key_id, vault.active_key_id("compliance-records"));
        assert_eq!(manager.record_payload(&id).unwrap().unwrap(), b"iban=DE00");
        assert_eq!(vault.outstanding(record.key_id.as_deref().unwrap()), 2);
    }

    #[test]
    fn test_reserved_categories_are_rejected() {
        let (manager, _vault, _audit) = manager();
        assert!(matches!(
            manager.track_record("u1", CONSENT_CATEGORY, b"x"),
            Err(ComplianceError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.record_consent("", "marketing", true, None),
            Err(ComplianceError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_pseudonym_is_stable_and_opaque() {
        let (manager, _vault, _audit) = manager();
        let a = manager.pseudonym("u1").unwrap();
        assert_eq!(a, manager.pseudonym("u1").unwrap());
        assert_ne!(a, manager.pseudonym("u2").unwrap());
        assert!(a.starts_with("anon-"));
        assert!(!a.contains("u1"));
    }

    #[test]
    fn test_cancelled_export_returns_error() {
        let (manager, _vault, _audit) = manager();
        manager.record_consent("u1", "marketing", true, None).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            manager.export_user_data_with("u1", &token),
            Err(ComplianceError::Cancelled)
        ));
    }
}
