//! compliance-manager: consent bookkeeping, data-subject rights and
//! retention enforcement.
//!
//! Consent details and tracked payloads are sealed with a `KeyVault` key
//! before they are stored. Erasure pseudonymises instead of deleting so the
//! audit trail and aggregate statistics survive it.

mod document;
pub mod error;
pub mod external;
mod manager;
pub mod models;
mod retention;
pub mod store;
mod usage;

pub use error::ComplianceError;
pub use external::ExternalDataHandler;
pub use manager::{ComplianceManager, ComplianceOptions};
pub use models::{
    ComplianceReport, ConsentCounts, ConsentRecord, Disposition, ErasureReport, ExportedRecord,
    MigrationReport, RetentionAction, RetentionConflict, RetentionPolicy, SweepReport,
    TrackedRecord, UserDataExport, AUDIT_CATEGORY, CONSENT_CATEGORY,
};
pub use store::{ComplianceStore, FileComplianceStore, MemoryComplianceStore};

/// Re-exported so callers can cancel exports and sweeps without a direct
/// tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
