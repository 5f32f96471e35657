use super::{AuditStore, StoreError};
use crate::models::AuditEvent;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory store for tests and ephemeral deployments.
///
/// `set_available(false)` simulates a storage outage.
pub struct MemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
    available: AtomicBool,
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, events: &[AuditEvent]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut stored = self.events.write();
        let last = stored.last().map(|e| e.sequence_id).unwrap_or(0);
        stored.extend(events.iter().filter(|e| e.sequence_id > last).cloned());
        Ok(())
    }

    fn read_from(&self, from: u64, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        self.check_available()?;
        let stored = self.events.read();
        let start = stored.partition_point(|e| e.sequence_id < from);
        Ok(stored[start..].iter().take(limit).cloned().collect())
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.events.read().last().map(|e| e.sequence_id).unwrap_or(0))
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut stored = self.events.write();
        let before = stored.len();
        stored.retain(|e| e.timestamp >= cutoff);
        Ok(before - stored.len())
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditCategory, AuditEntry, AuditOutcome};

    fn event(seq: u64) -> AuditEvent {
        AuditEntry::new(AuditCategory::System, "test", "system", AuditOutcome::Success)
            .into_event(seq)
    }

    #[test]
    fn test_read_from_is_ordered_and_bounded() {
        let store = MemoryAuditStore::new();
        store.append(&[event(1), event(2), event(3), event(4)]).unwrap();

        let page = store.read_from(2, 2).unwrap();
        let ids: Vec<u64> = page.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(store.last_sequence().unwrap(), 4);
    }

    #[test]
    fn test_retried_append_does_not_duplicate() {
        let store = MemoryAuditStore::new();
        store.append(&[event(1), event(2)]).unwrap();
        store.append(&[event(2), event(3)]).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_offline_store_rejects_everything() {
        let store = MemoryAuditStore::new();
        store.set_available(false);
        assert!(matches!(store.append(&[event(1)]), Err(StoreError::Unavailable(_))));
        assert!(store.read_from(0, 10).is_err());
        store.set_available(true);
        assert!(store.append(&[event(1)]).is_ok());
    }

    #[test]
    fn test_purge_before() {
        let store = MemoryAuditStore::new();
        store.append(&[event(1), event(2)]).unwrap();
        let removed = store.purge_before(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(removed, 2);
        assert!(store.is_empty());
    }
}
