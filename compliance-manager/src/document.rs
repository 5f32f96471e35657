use crate::models::{
    ConsentCounts, Disposition, RetentionAction, RetentionConflict, RetentionPolicy,
    TrackedRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const KEY_SEP: char = '\u{1f}';

fn consent_key(user_id: &str, consent_type: &str) -> String {
    format!("{}{}{}", user_id, KEY_SEP, consent_type)
}

/// A vault ciphertext plus the key id it was sealed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SealedBlob {
    pub key_id: String,
    /// base64 of the vault envelope
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredConsent {
    pub id: String,
    pub user_id: String,
    pub consent_type: String,
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
    pub details: Option<SealedBlob>,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub id: String,
    pub user_id: String,
    pub data_category: String,
    pub created_at: DateTime<Utc>,
    pub payload: Option<SealedBlob>,
    pub legal_hold: bool,
    pub disposition: Disposition,
}

impl StoredRecord {
    pub fn view(&self) -> TrackedRecord {
        TrackedRecord {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            data_category: self.data_category.clone(),
            created_at: self.created_at,
            legal_hold: self.legal_hold,
            disposition: self.disposition,
            key_id: self.payload.as_ref().map(|b| b.key_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ComplianceStats {
    pub erasures: u64,
    pub deleted: BTreeMap<String, u64>,
    pub anonymized: BTreeMap<String, u64>,
}

/// Where a sealed blob lives inside the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlobRef {
    Consent(String),
    Record(String),
}

/// The effective policy of one category after resolution.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedPolicy {
    pub policy_id: String,
    pub duration_seconds: u64,
    pub action: RetentionAction,
}

/// Everything the compliance manager persists, as one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ComplianceDocument {
    /// Append order is the authoritative consent order.
    pub consents: Vec<StoredConsent>,
    pub records: BTreeMap<String, StoredRecord>,
    pub policies: BTreeMap<String, RetentionPolicy>,
    pub stats: ComplianceStats,
    /// user + type -> granted flag of the latest active record
    #[serde(skip)]
    latest_consent: HashMap<String, bool>,
}

impl ComplianceDocument {
    pub fn reindexed(mut self) -> Self {
        self.reindex();
        self
    }

    pub fn reindex(&mut self) {
        self.latest_consent.clear();
        for consent in self
            .consents
            .iter()
            .filter(|c| c.disposition == Disposition::Active)
        {
            self.latest_consent.insert(
                consent_key(&consent.user_id, &consent.consent_type),
                consent.granted,
            );
        }
    }

    pub fn push_consent(&mut self, consent: StoredConsent) {
        self.latest_consent.insert(
            consent_key(&consent.user_id, &consent.consent_type),
            consent.granted,
        );
        self.consents.push(consent);
    }

    /// Latest granted flag; no record means no consent.
    pub fn consent_granted(&self, user_id: &str, consent_type: &str) -> bool {
        self.latest_consent
            .get(&consent_key(user_id, consent_type))
            .copied()
            .unwrap_or(false)
    }

    pub fn consent_mut(&mut self, id: &str) -> Option<&mut StoredConsent> {
        self.consents.iter_mut().find(|c| c.id == id)
    }

    pub fn remove_consent(&mut self, id: &str) -> Option<StoredConsent> {
        let idx = self.consents.iter().position(|c| c.id == id)?;
        let removed = self.consents.remove(idx);
        self.reindex();
        Some(removed)
    }

    pub fn blobs(&self) -> impl Iterator<Item = (BlobRef, &SealedBlob)> + '_ {
        let consents = self
            .consents
            .iter()
            .filter_map(|c| c.details.as_ref().map(|b| (BlobRef::Consent(c.id.clone()), b)));
        let records = self
            .records
            .values()
            .filter_map(|r| r.payload.as_ref().map(|b| (BlobRef::Record(r.id.clone()), b)));
        consents.chain(records)
    }

    pub fn blob_slot(&mut self, blob: &BlobRef) -> Option<&mut Option<SealedBlob>> {
        match blob {
            BlobRef::Consent(id) => self.consent_mut(id).map(|c| &mut c.details),
            BlobRef::Record(id) => self.records.get_mut(id).map(|r| &mut r.payload),
        }
    }

    pub fn sealed_under(&self, key_id: &str) -> usize {
        self.blobs().filter(|(_, b)| b.key_id == key_id).count()
    }

    /// One effective policy per category plus every conflict found.
    ///
    /// Policies of a category that agree on the action collapse to the
    /// shortest duration. Disagreeing categories are reported, not resolved.
    pub fn resolve_policies(&self) -> (BTreeMap<String, ResolvedPolicy>, Vec<RetentionConflict>) {
        let mut by_category: BTreeMap<&str, Vec<&RetentionPolicy>> = BTreeMap::new();
        for policy in self.policies.values() {
            by_category
                .entry(policy.data_category.as_str())
                .or_default()
                .push(policy);
        }

        let mut resolved = BTreeMap::new();
        let mut conflicts = Vec::new();
        for (category, policies) in by_category {
            let first_action = policies[0].action;
            if policies.iter().any(|p| p.action != first_action) {
                let mut actions: Vec<RetentionAction> = Vec::new();
                for p in &policies {
                    if !actions.contains(&p.action) {
                        actions.push(p.action);
                    }
                }
                conflicts.push(RetentionConflict {
                    category: category.to_string(),
                    policy_ids: policies.iter().map(|p| p.id.clone()).collect(),
                    actions,
                });
                continue;
            }

            if let Some(shortest) = policies.iter().min_by_key(|p| p.duration_seconds) {
                resolved.insert(
                    category.to_string(),
                    ResolvedPolicy {
                        policy_id: shortest.id.clone(),
                        duration_seconds: shortest.duration_seconds,
                        action: shortest.action,
                    },
                );
            }
        }
        (resolved, conflicts)
    }

    pub fn consent_counts(&self) -> BTreeMap<String, ConsentCounts> {
        let mut counts: BTreeMap<String, ConsentCounts> = BTreeMap::new();
        for consent in &self.consents {
            let entry = counts.entry(consent.consent_type.clone()).or_default();
            if consent.granted {
                entry.granted += 1;
            } else {
                entry.withdrawn += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consent(id: &str, user: &str, kind: &str, granted: bool) -> StoredConsent {
        StoredConsent {
            id: id.to_string(),
            user_id: user.to_string(),
            consent_type: kind.to_string(),
            granted,
            timestamp: Utc::now(),
            details: None,
            disposition: Disposition::Active,
        }
    }

    fn policy(id: &str, category: &str, secs: u64, action: RetentionAction) -> RetentionPolicy {
        RetentionPolicy {
            id: id.to_string(),
            data_category: category.to_string(),
            purpose: "test".to_string(),
            duration_seconds: secs,
            action,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_latest_consent_wins_and_survives_reload() {
        let mut doc = ComplianceDocument::default();
        doc.push_consent(consent("c1", "u1", "marketing", true));
        doc.push_consent(consent("c2", "u1", "marketing", false));
        assert!(!doc.consent_granted("u1", "marketing"));
        assert!(!doc.consent_granted("u1", "analytics"));

        let json = serde_json::to_string(&doc).unwrap();
        let loaded: ComplianceDocument = serde_json::from_str(&json).unwrap();
        assert!(!loaded.reindexed().consent_granted("u1", "marketing"));
    }

    #[test]
    fn test_removing_latest_falls_back_to_previous() {
        let mut doc = ComplianceDocument::default();
        doc.push_consent(consent("c1", "u1", "marketing", true));
        doc.push_consent(consent("c2", "u1", "marketing", false));
        doc.remove_consent("c2");
        assert!(doc.consent_granted("u1", "marketing"));
    }

    #[test]
    fn test_shortest_duration_wins_and_conflicts_are_reported() {
        let mut doc = ComplianceDocument::default();
        for p in [
            policy("p1", "invoices", 300, RetentionAction::Delete),
            policy("p2", "invoices", 100, RetentionAction::Delete),
            policy("p3", "tickets", 100, RetentionAction::Delete),
            policy("p4", "tickets", 100, RetentionAction::Anonymize),
        ] {
            doc.policies.insert(p.id.clone(), p);
        }

        let (resolved, conflicts) = doc.resolve_policies();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["invoices"].policy_id, "p2");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].category, "tickets");
        assert_eq!(conflicts[0].actions.len(), 2);
    }
}
