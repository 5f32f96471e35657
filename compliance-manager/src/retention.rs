use crate::document::{ComplianceDocument, ResolvedPolicy};
use crate::error::ComplianceError;
use crate::manager::{require, ComplianceManager};
use crate::models::{
    Disposition, RetentionAction, RetentionPolicy, SweepReport, AUDIT_CATEGORY, CONSENT_CATEGORY,
};
use audit_pipeline::{AuditCategory, AuditEntry, AuditOutcome, SYSTEM_USER};
use chrono::{DateTime, Duration, Utc};
use custodian_core::Details;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Something the sweep may act on.
#[derive(Debug, Clone)]
enum Due {
    Consent(String),
    Record(String),
}

impl Due {
    fn id(&self) -> &str {
        match self {
            Due::Consent(id) | Due::Record(id) => id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Due::Consent(_) => "consent",
            Due::Record(_) => "record",
        }
    }
}

/// Oldest timestamp that is still within `duration_seconds` of `now`.
fn cutoff_for(now: DateTime<Utc>, duration_seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(duration_seconds).ok()?;
    now.checked_sub_signed(Duration::try_seconds(seconds)?)
}

impl ComplianceManager {
    pub fn add_retention_policy(
        &self,
        data_category: &str,
        purpose: &str,
        duration_seconds: u64,
        action: RetentionAction,
    ) -> Result<String, ComplianceError> {
        require("data category", data_category)?;
        require("purpose", purpose)?;
        if duration_seconds == 0 {
            return Err(ComplianceError::InvalidInput(
                "retention duration must be positive".to_string(),
            ));
        }

        let policy = RetentionPolicy {
            id: Uuid::new_v4().to_string(),
            data_category: data_category.to_string(),
            purpose: purpose.to_string(),
            duration_seconds,
            action,
            created_at: Utc::now(),
        };
        let id = policy.id.clone();
        self.commit(|doc| {
            doc.policies.insert(policy.id.clone(), policy);
            Ok(())
        })?;

        self.audit(
            AuditEntry::new(
                AuditCategory::Compliance,
                "retention_policy_added",
                SYSTEM_USER,
                AuditOutcome::Success,
            )
            .details(
                Details::new()
                    .with("policy_id", id.as_str())
                    .with("data_category", data_category)
                    .with("purpose", purpose)
                    .with("duration_seconds", duration_seconds)
                    .with("action", action.as_str()),
            ),
        );
        Ok(id)
    }

    pub fn remove_retention_policy(&self, policy_id: &str) -> Result<(), ComplianceError> {
        self.commit(|doc| {
            doc.policies
                .remove(policy_id)
                .map(|_| ())
                .ok_or_else(|| ComplianceError::PolicyNotFound(policy_id.to_string()))
        })?;
        self.audit(
            AuditEntry::new(
                AuditCategory::Compliance,
                "retention_policy_removed",
                SYSTEM_USER,
                AuditOutcome::Success,
            )
            .detail("policy_id", policy_id),
        );
        Ok(())
    }

    pub fn retention_policies(&self) -> Vec<RetentionPolicy> {
        self.inner.snapshot.load().policies.values().cloned().collect()
    }

    /// The policy the sweep applies to `data_category`, if any.
    ///
    /// Fails with `RetentionPolicyConflict` when its policies disagree on
    /// the action.
    pub fn effective_policy(
        &self,
        data_category: &str,
    ) -> Result<Option<RetentionPolicy>, ComplianceError> {
        let doc = self.inner.snapshot.load();
        let (resolved, conflicts) = doc.resolve_policies();
        if let Some(conflict) = conflicts.iter().find(|c| c.category == data_category) {
            return Err(ComplianceError::RetentionPolicyConflict {
                category: conflict.category.clone(),
                actions: conflict
                    .actions
                    .iter()
                    .map(|a| a.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(resolved
            .get(data_category)
            .and_then(|r| doc.policies.get(&r.policy_id))
            .cloned())
    }

    pub fn enforce_retention(&self, now: DateTime<Utc>) -> Result<SweepReport, ComplianceError> {
        self.enforce_retention_with(now, &CancellationToken::new())
    }

    /// One retention sweep as of `now`.
    ///
    /// Each record is marked and persisted before the next one is touched,
    /// so a cancelled or crashed sweep resumes where it stopped and a repeat
    /// with the same `now` changes nothing.
    pub fn enforce_retention_with(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<SweepReport, ComplianceError> {
        let _sweep = self.inner.sweep.lock();
        let snapshot = self.inner.snapshot.load_full();
        let (resolved, conflicts) = snapshot.resolve_policies();

        let mut report = SweepReport {
            now: Some(now),
            ..SweepReport::default()
        };

        for conflict in &conflicts {
            let actions: Vec<&str> = conflict.actions.iter().map(|a| a.as_str()).collect();
            tracing::warn!(
                category = %conflict.category,
                actions = ?actions,
                "Conflicting retention policies; category skipped"
            );
            self.audit(
                AuditEntry::new(
                    AuditCategory::Compliance,
                    "retention_policy_conflict",
                    SYSTEM_USER,
                    AuditOutcome::Failure,
                )
                .details(
                    Details::new()
                        .with("data_category", conflict.category.as_str())
                        .with("actions", actions.join(", "))
                        .with("policies", conflict.policy_ids.len()),
                ),
            );
        }
        report.conflicts = conflicts;

        'categories: for (category, policy) in &resolved {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(cutoff) = cutoff_for(now, policy.duration_seconds) else {
                continue;
            };

            if category == AUDIT_CATEGORY {
                self.purge_audit(policy, cutoff, &mut report)?;
                continue;
            }

            let (due, held) = due_items(&snapshot, category, policy, cutoff);
            report.skipped_held += held;
            for item in due {
                if token.is_cancelled() {
                    report.cancelled = true;
                    break 'categories;
                }
                self.apply(&item, category, policy, &mut report)?;
            }
        }

        if report.cancelled {
            tracing::info!(
                deleted = report.deleted,
                anonymized = report.anonymized,
                "Retention sweep cancelled; next run resumes"
            );
        } else {
            tracing::info!(
                deleted = report.deleted,
                anonymized = report.anonymized,
                audit_purged = report.audit_events_purged,
                held = report.skipped_held,
                conflicts = report.conflicts.len(),
                "Retention sweep finished"
            );
        }
        Ok(report)
    }

    fn purge_audit(
        &self,
        policy: &ResolvedPolicy,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), ComplianceError> {
        if policy.action != RetentionAction::Delete {
            tracing::warn!(
                policy_id = %policy.policy_id,
                "Audit events can only be deleted; anonymize policy ignored"
            );
            report.unsupported.push(AUDIT_CATEGORY.to_string());
            return Ok(());
        }

        let purged = self
            .inner
            .audit
            .purge_before(cutoff)
            .map_err(|e| ComplianceError::Storage(e.to_string()))?;
        if purged == 0 {
            return Ok(());
        }

        self.commit(|doc| {
            *doc.stats.deleted.entry(AUDIT_CATEGORY.to_string()).or_default() += purged as u64;
            Ok(())
        })?;
        report.audit_events_purged += purged;
        metrics::counter!("retention_actions_total", "action" => "purge_audit")
            .increment(purged as u64);
        self.audit(
            AuditEntry::new(
                AuditCategory::Compliance,
                "audit_events_purged",
                SYSTEM_USER,
                AuditOutcome::Success,
            )
            .details(
                Details::new()
                    .with("purged", purged)
                    .with("cutoff", cutoff)
                    .with("policy_id", policy.policy_id.as_str()),
            ),
        );
        Ok(())
    }

    /// Apply the policy to one item against the latest document.
    fn apply(
        &self,
        item: &Due,
        category: &str,
        policy: &ResolvedPolicy,
        report: &mut SweepReport,
    ) -> Result<(), ComplianceError> {
        let applied = self.commit(|doc| {
            let released = match (item, policy.action) {
                (Due::Consent(id), RetentionAction::Delete) => {
                    doc.remove_consent(id).map(|c| c.details)
                }
                (Due::Consent(id), RetentionAction::Anonymize) => {
                    let pseudonym = match doc.consent_mut(id) {
                        Some(c) if c.disposition == Disposition::Active => {
                            self.pseudonym(&c.user_id)?
                        }
                        _ => return Ok(None),
                    };
                    let released = doc.consent_mut(id).and_then(|c| {
                        c.user_id = pseudonym;
                        c.disposition = Disposition::Anonymized;
                        c.details.take()
                    });
                    doc.reindex();
                    Some(released)
                }
                (Due::Record(id), action) => {
                    let Some(record) = doc.records.get_mut(id) else {
                        return Ok(None);
                    };
                    if record.legal_hold {
                        return Ok(None);
                    }
                    match action {
                        RetentionAction::Delete => doc.records.remove(id).map(|r| r.payload),
                        RetentionAction::Anonymize => {
                            if record.disposition != Disposition::Active {
                                return Ok(None);
                            }
                            record.user_id = self.pseudonym(&record.user_id)?;
                            record.disposition = Disposition::Anonymized;
                            Some(record.payload.take())
                        }
                    }
                }
            };

            if released.is_some() {
                let stats = match policy.action {
                    RetentionAction::Delete => &mut doc.stats.deleted,
                    RetentionAction::Anonymize => &mut doc.stats.anonymized,
                };
                *stats.entry(category.to_string()).or_default() += 1;
            }
            Ok(released)
        })?;

        // `None`: already handled by someone else since the snapshot was taken.
        let Some(blob) = applied else {
            return Ok(());
        };
        if let Some(blob) = blob.as_ref() {
            self.discard(blob);
        }
        self.record_action(item, category, policy, report);
        Ok(())
    }

    fn record_action(
        &self,
        item: &Due,
        category: &str,
        policy: &ResolvedPolicy,
        report: &mut SweepReport,
    ) {
        let action = match policy.action {
            RetentionAction::Delete => {
                report.deleted += 1;
                "retention_deleted"
            }
            RetentionAction::Anonymize => {
                report.anonymized += 1;
                "retention_anonymized"
            }
        };
        metrics::counter!("retention_actions_total", "action" => policy.action.as_str())
            .increment(1);
        self.audit(
            AuditEntry::new(AuditCategory::Compliance, action, SYSTEM_USER, AuditOutcome::Success)
                .details(
                    Details::new()
                        .with("record_id", item.id())
                        .with("record_kind", item.kind())
                        .with("data_category", category)
                        .with("policy_id", policy.policy_id.as_str()),
                ),
        );
    }
}

/// Items of `category` older than `cutoff` that the policy still has to act
/// on, plus how many were skipped for a legal hold.
fn due_items(
    doc: &ComplianceDocument,
    category: &str,
    policy: &ResolvedPolicy,
    cutoff: DateTime<Utc>,
) -> (Vec<Due>, usize) {
    let pending = |disposition: Disposition| {
        policy.action == RetentionAction::Delete || disposition == Disposition::Active
    };

    if category == CONSENT_CATEGORY {
        let due = doc
            .consents
            .iter()
            .filter(|c| c.timestamp < cutoff && pending(c.disposition))
            .map(|c| Due::Consent(c.id.clone()))
            .collect();
        return (due, 0);
    }

    let mut held = 0;
    let mut due = Vec::new();
    for record in doc.records.values() {
        if record.data_category != category || record.created_at >= cutoff {
            continue;
        }
        if !pending(record.disposition) {
            continue;
        }
        if record.legal_hold {
            held += 1;
            continue;
        }
        due.push(Due::Record(record.id.clone()));
    }
    (due, held)
}
