//! Backing stores for the audit trail.

mod memory;
mod segment;

pub use memory::MemoryAuditStore;
pub use segment::SegmentAuditStore;

use crate::models::AuditEvent;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Store failures. These never reach business callers of `log`; the
/// pipeline degrades to buffering instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Audit storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt audit segment: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl From<custodian_core::CoreError> for StoreError {
    fn from(err: custodian_core::CoreError) -> Self {
        match err {
            custodian_core::CoreError::Io(e) => StoreError::Io(e),
            custodian_core::CoreError::Serialization(e) => StoreError::Serialization(e),
            other => StoreError::Crypto(other.to_string()),
        }
    }
}

/// Append-only event storage.
///
/// Implementations must accept a retried `append` of events they already
/// hold (same sequence ids) without duplicating them.
pub trait AuditStore: Send + Sync {
    /// Durably append events, which arrive in ascending sequence order.
    fn append(&self, events: &[AuditEvent]) -> Result<(), StoreError>;

    /// Up to `limit` events with `sequence_id >= from`, ascending.
    fn read_from(&self, from: u64, limit: usize) -> Result<Vec<AuditEvent>, StoreError>;

    /// Highest persisted sequence id, 0 when empty.
    fn last_sequence(&self) -> Result<u64, StoreError>;

    /// Remove events older than `cutoff`; returns how many were removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn sync(&self) -> Result<(), StoreError>;
}
