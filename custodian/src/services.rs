use crate::error::{CustodianError, PublicError};
use access_control::{AccessControl, FilePolicyStore};
use audit_pipeline::{
    AuditEntry, AuditOutcome, AuditPipeline, AuditStore, MemoryAuditStore, PipelineOptions,
    SegmentAuditStore,
};
use compliance_manager::{ComplianceManager, ComplianceOptions, FileComplianceStore};
use custodian_core::config::CustodianConfig;
use custodian_core::utils::{digest::keyed_digest_bytes, Sealer};
use custodian_core::{CoreError, Details};
use key_vault::{FileKeyStore, KeyVault, VaultOptions};
use secrecy::ExposeSecret;
use std::path::Path;
use std::sync::Arc;

/// The four security services, built once and passed around explicitly.
#[derive(Clone)]
pub struct Custodian {
    audit: AuditPipeline,
    vault: KeyVault,
    access: AccessControl,
    compliance: ComplianceManager,
}

impl Custodian {
    /// Build every service from `config`. Stores without a configured
    /// location live in memory.
    pub fn init(config: &CustodianConfig) -> Result<Self, CustodianError> {
        config.check()?;
        let password = config
            .master_password
            .as_ref()
            .map(|p| p.expose_secret().as_bytes());

        let audit_store: Arc<dyn AuditStore> = match &config.audit.log_dir {
            Some(dir) => {
                let sealer = if config.audit.encrypt {
                    Some(Sealer::for_directory(dir, required(password)?, &config.kdf, "audit")?)
                } else {
                    None
                };
                Arc::new(SegmentAuditStore::open(
                    dir,
                    config.audit.segment_max_events,
                    sealer,
                )?)
            }
            None => Arc::new(MemoryAuditStore::new()),
        };
        let audit = AuditPipeline::new(audit_store, PipelineOptions::from(&config.audit))?;

        let vault_options = VaultOptions::from(&config.keys);
        let vault = match &config.keys.storage_dir {
            Some(dir) => {
                let sealer = Sealer::for_directory(dir, required(password)?, &config.kdf, "keys")?;
                let store = FileKeyStore::open(dir, sealer)?;
                KeyVault::new(Arc::new(store), audit.clone(), vault_options)?
            }
            None => KeyVault::in_memory(audit.clone(), vault_options),
        };

        let access = match &config.access.storage_path {
            Some(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let sealer = Sealer::for_directory(dir, required(password)?, &config.kdf, "access")?;
                AccessControl::new(Arc::new(FilePolicyStore::new(path, sealer)), audit.clone())?
            }
            None => AccessControl::in_memory(audit.clone()),
        };

        let compliance_options = match (&config.compliance.pseudonym_secret, password) {
            (Some(secret), _) => ComplianceOptions::new(
                &config.compliance.records_key,
                secret.expose_secret().as_bytes(),
            ),
            (None, Some(password)) => ComplianceOptions::new(
                &config.compliance.records_key,
                &keyed_digest_bytes(password, &["custodian", "pseudonym"])?,
            ),
            (None, None) => ComplianceOptions::with_random_secret(&config.compliance.records_key),
        };
        let compliance = match &config.compliance.storage_dir {
            Some(dir) => {
                let sealer =
                    Sealer::for_directory(dir, required(password)?, &config.kdf, "compliance")?;
                let store = FileComplianceStore::open(dir, sealer)?;
                ComplianceManager::new(Arc::new(store), vault.clone(), audit.clone(), compliance_options)?
            }
            None => ComplianceManager::new(
                Arc::new(compliance_manager::MemoryComplianceStore::new()),
                vault.clone(),
                audit.clone(),
                compliance_options,
            )?,
        };

        tracing::info!(
            service = %config.service_name,
            persistent_keys = config.keys.storage_dir.is_some(),
            persistent_audit = config.audit.log_dir.is_some(),
            encrypted_audit = config.audit.encrypt,
            "Custodian services initialized"
        );

        Ok(Self {
            audit,
            vault,
            access,
            compliance,
        })
    }

    /// Everything in memory. For tests and embedded use.
    pub fn in_memory() -> Result<Self, CustodianError> {
        let audit = AuditPipeline::in_memory();
        let vault = KeyVault::in_memory(audit.clone(), VaultOptions::default());
        let access = AccessControl::in_memory(audit.clone());
        let compliance = ComplianceManager::in_memory(vault.clone(), audit.clone())?;
        Ok(Self {
            audit,
            vault,
            access,
            compliance,
        })
    }

    pub fn audit(&self) -> &AuditPipeline {
        &self.audit
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn compliance(&self) -> &ComplianceManager {
        &self.compliance
    }

    /// Permission check for an interactive caller: `Err(NotPermitted)` on
    /// denial, with no hint whether the resource exists.
    pub fn authorize(
        &self,
        user_id: &str,
        resource_type: &str,
        action: &str,
        resource_id: Option<&str>,
    ) -> Result<(), PublicError> {
        if self
            .access
            .check_permission(user_id, resource_type, action, resource_id)
        {
            Ok(())
        } else {
            Err(PublicError::NotPermitted)
        }
    }

    /// Reduce `err` to what `user_id` may see, recording the full detail in
    /// the audit trail.
    pub fn present(&self, user_id: &str, err: &CustodianError) -> PublicError {
        let public = err.public();
        self.audit.record(
            AuditEntry::new(err.category(), "error_presented", user_id, AuditOutcome::Failure)
                .details(
                    Details::new()
                        .with("error", err.to_string())
                        .with("public_message", public.message()),
                ),
        );
        tracing::warn!(error = %err, public = public.message(), "Request failed");
        public
    }

    /// Flush the audit overflow queue, stop listener delivery and sync stores.
    pub fn shutdown(&self) {
        self.audit.shutdown();
        tracing::info!("Custodian services shut down");
    }
}

fn required(password: Option<&[u8]>) -> Result<&[u8], CustodianError> {
    password.ok_or_else(|| {
        CustodianError::Core(CoreError::ConfigError(anyhow::anyhow!(
            "master_password is required for persistent stores"
        )))
    })
}
