//! Public compliance types. Stored forms live in `document`.

use audit_pipeline::AuditEvent;
use chrono::{DateTime, Utc};
use custodian_core::Details;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Data category of consent records.
pub const CONSENT_CATEGORY: &str = "consent";
/// Data category of audit events. Only `Delete` is supported for it.
pub const AUDIT_CATEGORY: &str = "audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Active,
    /// Pseudonymised by a retention policy.
    Anonymized,
    /// Pseudonymised by a right-to-erasure request.
    Erased,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Active => "active",
            Disposition::Anonymized => "anonymized",
            Disposition::Erased => "erased",
        }
    }
}

/// One consent statement. The latest record per user and type is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsentRecord {
    pub id: String,
    pub user_id: String,
    pub consent_type: String,
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
    pub details: Details,
    pub disposition: Disposition,
}

/// Metadata of a compliance-tracked record. The payload is never included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedRecord {
    pub id: String,
    pub user_id: String,
    pub data_category: String,
    pub created_at: DateTime<Utc>,
    pub legal_hold: bool,
    pub disposition: Disposition,
    /// Vault key id sealing the payload, if a payload is still held.
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    Delete,
    Anonymize,
}

impl RetentionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionAction::Delete => "delete",
            RetentionAction::Anonymize => "anonymize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    pub data_category: String,
    pub purpose: String,
    pub duration_seconds: u64,
    pub action: RetentionAction,
    pub created_at: DateTime<Utc>,
}

/// Policies for one category that prescribe different actions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionConflict {
    pub category: String,
    pub policy_ids: Vec<String>,
    pub actions: Vec<RetentionAction>,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub now: Option<DateTime<Utc>>,
    pub deleted: usize,
    pub anonymized: usize,
    pub audit_events_purged: usize,
    /// Records that were due but under legal hold.
    pub skipped_held: usize,
    pub conflicts: Vec<RetentionConflict>,
    /// Categories whose policy action cannot be applied to them.
    pub unsupported: Vec<String>,
    /// Set when the sweep stopped early; the next run resumes.
    pub cancelled: bool,
}

impl SweepReport {
    pub fn actions_taken(&self) -> usize {
        self.deleted + self.anonymized + self.audit_events_purged
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedRecord {
    pub record: TrackedRecord,
    pub payload: Option<Vec<u8>>,
}

/// Everything this core holds about one data subject.
#[derive(Debug, Clone, Serialize)]
pub struct UserDataExport {
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub consents: Vec<ConsentRecord>,
    pub records: Vec<ExportedRecord>,
    pub audit_events: Vec<AuditEvent>,
    /// handler name -> exported document
    pub external: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErasureReport {
    pub pseudonym: String,
    pub consents_erased: usize,
    pub records_erased: usize,
    /// Records kept intact because of a legal hold.
    pub records_held: usize,
    pub handler_failures: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentCounts {
    pub granted: u64,
    pub withdrawn: u64,
}

/// Aggregate statistics. Contains no user ids and survives erasure.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub consents_by_type: BTreeMap<String, ConsentCounts>,
    /// category -> disposition -> count
    pub records_by_category: BTreeMap<String, BTreeMap<String, u64>>,
    pub legal_holds: u64,
    pub erasures: u64,
    pub deleted_by_category: BTreeMap<String, u64>,
    pub anonymized_by_category: BTreeMap<String, u64>,
    pub policies: usize,
    pub policy_conflicts: Vec<RetentionConflict>,
}
