use crate::error::CoreError;
use config::{Config as Cfg, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use validator::Validate;

/// Process-wide configuration, read once at start-up.
///
/// Every storage location is optional: when a directory is absent the
/// corresponding service keeps its state in memory only.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CustodianConfig {
    #[serde(default = "default_service_name")]
    #[validate(length(min = 1))]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    #[validate(length(min = 1))]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Protects every store at rest. Required as soon as anything touches disk.
    #[serde(default)]
    pub master_password: Option<SecretString>,
    #[serde(default)]
    #[validate(nested)]
    pub kdf: KdfConfig,
    #[serde(default)]
    #[validate(nested)]
    pub keys: KeyStorageConfig,
    #[serde(default)]
    pub access: AccessStorageConfig,
    #[serde(default)]
    #[validate(nested)]
    pub audit: AuditStorageConfig,
    #[serde(default)]
    #[validate(nested)]
    pub compliance: ComplianceStorageConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Argon2id cost parameters used to stretch the master password.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct KdfConfig {
    #[serde(default = "default_kdf_memory_kib")]
    #[validate(range(min = 8))]
    pub memory_kib: u32,
    #[serde(default = "default_kdf_iterations")]
    #[validate(range(min = 1))]
    pub iterations: u32,
    #[serde(default = "default_kdf_parallelism")]
    #[validate(range(min = 1, max = 16))]
    pub parallelism: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct KeyStorageConfig {
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_rsa_bits")]
    #[validate(range(min = 1024, max = 8192))]
    pub rsa_bits: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessStorageConfig {
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuditStorageConfig {
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default = "default_segment_max_events")]
    #[validate(range(min = 1))]
    pub segment_max_events: usize,
    #[serde(default = "default_overflow_capacity")]
    #[validate(range(min = 1))]
    pub overflow_capacity: usize,
    #[serde(default = "default_query_batch_size")]
    #[validate(range(min = 1))]
    pub query_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ComplianceStorageConfig {
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_records_key")]
    #[validate(length(min = 1))]
    pub records_key: String,
    #[serde(default)]
    pub pseudonym_secret: Option<SecretString>,
}

fn default_service_name() -> String {
    "custodian".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_kdf_memory_kib() -> u32 {
    19 * 1024
}

fn default_kdf_iterations() -> u32 {
    2
}

fn default_kdf_parallelism() -> u32 {
    1
}

fn default_rsa_bits() -> usize {
    2048
}

fn default_segment_max_events() -> usize {
    10_000
}

fn default_overflow_capacity() -> usize {
    10_000
}

fn default_query_batch_size() -> usize {
    256
}

fn default_records_key() -> String {
    "compliance-records".to_string()
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: default_kdf_memory_kib(),
            iterations: default_kdf_iterations(),
            parallelism: default_kdf_parallelism(),
        }
    }
}

impl Default for KeyStorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            rsa_bits: default_rsa_bits(),
        }
    }
}

impl Default for AuditStorageConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            encrypt: false,
            segment_max_events: default_segment_max_events(),
            overflow_capacity: default_overflow_capacity(),
            query_batch_size: default_query_batch_size(),
        }
    }
}

impl Default for ComplianceStorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            records_key: default_records_key(),
            pseudonym_secret: None,
        }
    }
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            master_password: None,
            kdf: KdfConfig::default(),
            keys: KeyStorageConfig::default(),
            access: AccessStorageConfig::default(),
            audit: AuditStorageConfig::default(),
            compliance: ComplianceStorageConfig::default(),
        }
    }
}

impl CustodianConfig {
    /// Load from `.env`, an optional `custodian.*` file and `CUSTODIAN__*` variables.
    pub fn load() -> Result<Self, CoreError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("custodian").required(false))
            .add_source(
                Environment::with_prefix("CUSTODIAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CustodianConfig = config.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    /// Field validation plus the cross-field rules serde cannot express.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()?;

        if self.requires_master_password() && self.master_password.is_none() {
            return Err(CoreError::ConfigError(anyhow::anyhow!(
                "master_password is required when a storage directory or audit encryption is configured"
            )));
        }

        Ok(())
    }

    pub fn requires_master_password(&self) -> bool {
        self.keys.storage_dir.is_some()
            || self.access.storage_path.is_some()
            || self.audit.log_dir.is_some()
            || self.audit.encrypt
            || self.compliance.storage_dir.is_some()
    }
}
