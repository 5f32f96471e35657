use crate::decision::Decision;
use crate::error::AccessError;
use crate::models::{Permission, Role};
use crate::policy::PolicyDocument;
use crate::store::{MemoryPolicyStore, PolicyStore};
use arc_swap::ArcSwap;
use audit_pipeline::{AuditCategory, AuditEntry, AuditOutcome, AuditPipeline, SYSTEM_USER};
use custodian_core::Details;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

struct AccessInner {
    snapshot: ArcSwap<PolicyDocument>,
    writer: Mutex<()>,
    store: Arc<dyn PolicyStore>,
    audit: AuditPipeline,
}

/// Permission evaluation over copy-on-write policy snapshots.
///
/// Checks read one published `PolicyDocument` without locking. Mutations
/// take the single writer lock, build the next version, persist it and
/// swap it in.
#[derive(Clone)]
pub struct AccessControl {
    inner: Arc<AccessInner>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn PolicyStore>, audit: AuditPipeline) -> Result<Self, AccessError> {
        let document = store.load()?.unwrap_or_default().reindexed();
        Ok(Self {
            inner: Arc::new(AccessInner {
                snapshot: ArcSwap::from_pointee(document),
                writer: Mutex::new(()),
                store,
                audit,
            }),
        })
    }

    pub fn in_memory(audit: AuditPipeline) -> Self {
        Self {
            inner: Arc::new(AccessInner {
                snapshot: ArcSwap::from_pointee(PolicyDocument::default()),
                writer: Mutex::new(()),
                store: Arc::new(MemoryPolicyStore::new()),
                audit,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Whether `user_id` may perform `action` on `resource_type`
    /// (optionally a specific instance). Never fails; malformed input denies.
    pub fn check_permission(
        &self,
        user_id: &str,
        resource_type: &str,
        action: &str,
        resource_id: Option<&str>,
    ) -> bool {
        self.explain(user_id, resource_type, action, resource_id)
            .allowed()
    }

    /// Like `check_permission`, returning the rule that decided.
    pub fn explain(
        &self,
        user_id: &str,
        resource_type: &str,
        action: &str,
        resource_id: Option<&str>,
    ) -> Decision {
        let snapshot = self.inner.snapshot.load();
        let well_formed = [user_id, resource_type, action]
            .iter()
            .all(|s| !s.trim().is_empty());
        let decision = if well_formed {
            snapshot.evaluate(user_id, resource_type, action, resource_id)
        } else {
            Decision::DefaultDeny
        };

        let allowed = decision.allowed();
        metrics::counter!(
            "authz_checks_total",
            "decision" => if allowed { "allow" } else { "deny" }
        )
        .increment(1);

        let details = Details::new()
            .with("resource_type", resource_type)
            .with("action", action)
            .with_opt("resource_id", resource_id)
            .with("decided_by", decision.as_str())
            .with_opt(
                "role",
                match &decision {
                    Decision::Role(name) => Some(name.as_str()),
                    _ => None,
                },
            )
            .with("policy_version", snapshot.version);
        self.inner.audit.record(
            AuditEntry::new(
                AuditCategory::Authorization,
                "check_permission",
                user_id,
                if allowed {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Denied
                },
            )
            .details(details),
        );

        if !allowed {
            tracing::debug!(user_id, resource_type, action, decided_by = decision.as_str(), "Permission denied");
        }
        decision
    }

    pub fn roles_of(&self, user_id: &str) -> Vec<String> {
        self.inner.snapshot.load().roles_of(user_id)
    }

    pub fn effective_permissions(&self, user_id: &str) -> BTreeSet<Permission> {
        self.inner.snapshot.load().effective_permissions(user_id)
    }

    pub fn role(&self, name: &str) -> Option<Role> {
        self.inner.snapshot.load().roles.get(name).cloned()
    }

    pub fn snapshot_version(&self) -> u64 {
        self.inner.snapshot.load().version
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn create_role(&self, name: &str) -> Result<(), AccessError> {
        require("role name", name)?;
        self.mutate("create_role", Details::new().with("role", name), |doc| {
            doc.create_role(name)
        })
        .map(|_| ())
    }

    /// Remove a role and every assignment of it.
    pub fn delete_role(&self, name: &str) -> Result<(), AccessError> {
        require("role name", name)?;
        self.mutate("delete_role", Details::new().with("role", name), |doc| {
            doc.delete_role(name)
        })
        .map(|_| ())
    }

    pub fn add_role_permission(&self, role: &str, permission: Permission) -> Result<bool, AccessError> {
        require("role name", role)?;
        require_permission(&permission)?;
        let details = permission_details(Details::new().with("role", role), &permission);
        self.mutate("add_role_permission", details, |doc| {
            doc.add_role_permission(role, &permission)
        })
    }

    pub fn remove_role_permission(
        &self,
        role: &str,
        permission: &Permission,
    ) -> Result<bool, AccessError> {
        require("role name", role)?;
        let details = permission_details(Details::new().with("role", role), permission);
        self.mutate("remove_role_permission", details, |doc| {
            doc.remove_role_permission(role, permission)
        })
    }

    pub fn assign_role_to_user(&self, user_id: &str, role: &str) -> Result<bool, AccessError> {
        require("user id", user_id)?;
        require("role name", role)?;
        let details = Details::new().with("subject", user_id).with("role", role);
        self.mutate("assign_role", details, |doc| doc.assign_role(user_id, role))
    }

    pub fn revoke_role_from_user(&self, user_id: &str, role: &str) -> Result<bool, AccessError> {
        require("user id", user_id)?;
        require("role name", role)?;
        let details = Details::new().with("subject", user_id).with("role", role);
        self.mutate("revoke_role", details, |doc| doc.revoke_role(user_id, role))
    }

    /// Allow (`allow = true`) or deny one user on one resource instance,
    /// replacing any earlier grant for the same instance and action.
    pub fn grant_resource_access(
        &self,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        permission: Permission,
        allow: bool,
    ) -> Result<bool, AccessError> {
        require("user id", user_id)?;
        require("resource type", resource_type)?;
        require("resource id", resource_id)?;
        require_permission(&permission)?;
        if permission.resource != resource_type {
            return Err(AccessError::InvalidInput(format!(
                "permission {} does not apply to resource type {}",
                permission, resource_type
            )));
        }

        let details = permission_details(
            Details::new()
                .with("subject", user_id)
                .with("resource_id", resource_id)
                .with("allow", allow),
            &permission,
        );
        self.mutate("grant_resource_access", details, |doc| {
            Ok(doc.grant(user_id, resource_type, resource_id, &permission, allow))
        })
    }

    pub fn revoke_resource_access(
        &self,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        permission: &Permission,
    ) -> Result<bool, AccessError> {
        require("user id", user_id)?;
        let details = permission_details(
            Details::new()
                .with("subject", user_id)
                .with("resource_id", resource_id),
            permission,
        );
        self.mutate("revoke_resource_access", details, |doc| {
            Ok(doc.revoke_grant(user_id, resource_type, resource_id, permission))
        })
    }

    /// Apply `change` to a copy of the current document and publish it.
    ///
    /// Unchanged documents are neither persisted nor re-versioned. Every
    /// attempt is audited, failures included.
    fn mutate<F>(&self, action: &str, details: Details, change: F) -> Result<bool, AccessError>
    where
        F: FnOnce(&mut PolicyDocument) -> Result<bool, AccessError>,
    {
        let _writer = self.inner.writer.lock();
        let mut next = PolicyDocument::clone(&self.inner.snapshot.load());

        let result = change(&mut next).and_then(|changed| {
            if changed {
                next.version += 1;
                self.inner.store.save(&next)?;
            }
            Ok(changed)
        });

        match &result {
            Ok(changed) => {
                if *changed {
                    let version = next.version;
                    self.inner.snapshot.store(Arc::new(next));
                    tracing::info!(action, version, "Access policy updated");
                }
                self.audit(action, AuditOutcome::Success, details.with("changed", *changed));
            }
            Err(e) => {
                tracing::warn!(action, error = %e, "Access policy mutation rejected");
                self.audit(action, AuditOutcome::Failure, details.with("error", e.to_string()));
            }
        }
        result
    }

    fn audit(&self, action: &str, outcome: AuditOutcome, details: Details) {
        self.inner.audit.record(
            AuditEntry::new(AuditCategory::Authorization, action, SYSTEM_USER, outcome)
                .details(details),
        );
    }
}

fn require(what: &str, value: &str) -> Result<(), AccessError> {
    if value.trim().is_empty() {
        return Err(AccessError::InvalidInput(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn require_permission(permission: &Permission) -> Result<(), AccessError> {
    if !permission.is_well_formed() {
        return Err(AccessError::InvalidInput(format!(
            "malformed permission {}",
            permission
        )));
    }
    Ok(())
}

fn permission_details(details: Details, permission: &Permission) -> Details {
    details
        .with("permission_resource", &permission.resource)
        .with("permission_action", &permission.action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_pipeline::AuditFilter;

    #[test]
    fn test_checks_are_audited_with_denied_outcome() {
        let audit = AuditPipeline::in_memory();
        let access = AccessControl::in_memory(audit.clone());

        assert!(!access.check_permission("u1", "doc", "edit", Some("d1")));

        let denied: Vec<_> = audit
            .query_events(AuditFilter::new().outcome(AuditOutcome::Denied))
            .collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].user_id, "u1");
        assert_eq!(
            denied[0].details.get("decided_by").and_then(|v| v.as_text()),
            Some("default_deny")
        );
    }

    #[test]
    fn test_unknown_role_on_assign_is_an_error() {
        let access = AccessControl::in_memory(AuditPipeline::in_memory());
        assert!(matches!(
            access.assign_role_to_user("u1", "ghost"),
            Err(AccessError::RoleNotFound(_))
        ));
        assert!(matches!(
            access.create_role(" "),
            Err(AccessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_noop_mutation_keeps_version() {
        let access = AccessControl::in_memory(AuditPipeline::in_memory());
        access.create_role("editor").unwrap();
        let v = access.snapshot_version();

        assert!(access
            .add_role_permission("editor", Permission::new("doc", "edit"))
            .unwrap());
        assert!(!access
            .add_role_permission("editor", Permission::new("doc", "edit"))
            .unwrap());
        assert_eq!(access.snapshot_version(), v + 1);
    }

    #[test]
    fn test_grant_permission_must_match_resource_type() {
        let access = AccessControl::in_memory(AuditPipeline::in_memory());
        assert!(matches!(
            access.grant_resource_access("u1", "doc", "d1", Permission::new("invoice", "view"), true),
            Err(AccessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_blank_subject_is_denied_not_raised() {
        let access = AccessControl::in_memory(AuditPipeline::in_memory());
        assert_eq!(access.explain("", "doc", "edit", None), Decision::DefaultDeny);
    }
}
