//! Audit event model and query/report types.

use chrono::{DateTime, Utc};
use custodian_core::{DetailValue, Details};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// User id recorded for events the core emits on its own behalf.
pub const SYSTEM_USER: &str = "system";

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    Authentication,
    Authorization,
    DataAccess,
    DataModification,
    KeyManagement,
    Compliance,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Authentication => "AUTHENTICATION",
            AuditCategory::Authorization => "AUTHORIZATION",
            AuditCategory::DataAccess => "DATA_ACCESS",
            AuditCategory::DataModification => "DATA_MODIFICATION",
            AuditCategory::KeyManagement => "KEY_MANAGEMENT",
            AuditCategory::Compliance => "COMPLIANCE",
            AuditCategory::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Denied => "denied",
        }
    }
}

/// An immutable, sequence-ordered audit record.
///
/// `sequence_id` is the authoritative order; `timestamp` is advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub action: String,
    pub user_id: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub details: Details,
}

impl AuditEvent {
    /// True when the event is about `user_id`, either as actor or in its details.
    pub fn mentions(&self, user_id: &str) -> bool {
        self.user_id == user_id || self.details.mentions(user_id)
    }
}

/// An event as submitted, before the pipeline assigns its sequence id.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub category: AuditCategory,
    pub action: String,
    pub user_id: String,
    pub outcome: AuditOutcome,
    pub source_ip: Option<String>,
    pub details: Details,
}

impl AuditEntry {
    pub fn new(
        category: AuditCategory,
        action: impl Into<String>,
        user_id: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            category,
            action: action.into(),
            user_id: user_id.into(),
            outcome,
            source_ip: None,
            details: Details::new(),
        }
    }

    /// Event emitted by the core itself.
    pub fn system(action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self::new(AuditCategory::System, action, SYSTEM_USER, outcome)
    }

    pub fn source_ip(mut self, source_ip: Option<&str>) -> Self {
        self.source_ip = source_ip.map(str::to_string);
        self
    }

    pub fn details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.details.insert(key, value);
        self
    }

    pub(crate) fn into_event(self, sequence_id: u64) -> AuditEvent {
        AuditEvent {
            sequence_id,
            timestamp: Utc::now(),
            category: self.category,
            action: self.action,
            user_id: self.user_id,
            outcome: self.outcome,
            source_ip: self.source_ip,
            details: self.details,
        }
    }
}

/// Query filter. Empty sets and `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub categories: BTreeSet<AuditCategory>,
    pub outcomes: BTreeSet<AuditOutcome>,
    pub user_id: Option<String>,
    /// Matches the actor or any text detail equal to this id.
    pub mentioning: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: AuditCategory) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcomes.insert(outcome);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn mentioning(mut self, user_id: impl Into<String>) -> Self {
        self.mentioning = Some(user_id.into());
        self
    }

    /// Inclusive lower and exclusive upper bound on the advisory timestamp.
    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if !self.categories.is_empty() && !self.categories.contains(&event.category) {
            return false;
        }
        if !self.outcomes.is_empty() && !self.outcomes.contains(&event.outcome) {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if &event.user_id != user_id {
                return false;
            }
        }
        if let Some(subject) = &self.mentioning {
            if !event.mentions(subject) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp >= to {
                return false;
            }
        }
        true
    }
}

/// Aggregation key for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Category,
    Outcome,
    UserId,
    Action,
    /// Calendar day (UTC) of the advisory timestamp.
    Day,
}

impl GroupBy {
    pub(crate) fn key(&self, event: &AuditEvent) -> String {
        match self {
            GroupBy::Category => event.category.as_str().to_string(),
            GroupBy::Outcome => event.outcome.as_str().to_string(),
            GroupBy::UserId => event.user_id.clone(),
            GroupBy::Action => event.action.clone(),
            GroupBy::Day => event.timestamp.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Aggregated counts over a filtered event sequence.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub total: u64,
    pub groups: BTreeMap<String, u64>,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Set when the store failed part-way; counts cover what was read.
    pub partial: bool,
}
