use crate::decision::Decision;
use crate::error::AccessError;
use crate::models::{Permission, ResourceGrant, Role};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const KEY_SEP: char = '\u{1f}';

fn grant_key(user_id: &str, resource_type: &str, resource_id: &str, action: &str) -> String {
    let mut key = String::with_capacity(
        user_id.len() + resource_type.len() + resource_id.len() + action.len() + 3,
    );
    for (i, part) in [user_id, resource_type, resource_id, action].iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.push_str(part);
    }
    key
}

/// One immutable version of the role table, assignments and grants.
///
/// Never mutated once published; writers clone, modify and swap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u64,
    pub roles: BTreeMap<String, Role>,
    /// user id -> role names
    pub assignments: BTreeMap<String, BTreeSet<String>>,
    pub grants: Vec<ResourceGrant>,
    #[serde(skip)]
    grant_index: HashMap<String, usize>,
}

impl PolicyDocument {
    /// Rebuild lookup state after deserialization.
    pub(crate) fn reindexed(mut self) -> Self {
        self.reindex();
        self
    }

    fn reindex(&mut self) {
        self.grant_index = self
            .grants
            .iter()
            .enumerate()
            .map(|(idx, g)| {
                (
                    grant_key(&g.user_id, &g.resource_type, &g.resource_id, &g.permission.action),
                    idx,
                )
            })
            .collect();
    }

    pub fn evaluate(
        &self,
        user_id: &str,
        resource_type: &str,
        action: &str,
        resource_id: Option<&str>,
    ) -> Decision {
        if let Some(resource_id) = resource_id {
            let key = grant_key(user_id, resource_type, resource_id, action);
            if let Some(grant) = self.grant_index.get(&key).and_then(|idx| self.grants.get(*idx)) {
                return if grant.allow {
                    Decision::ExplicitAllow
                } else {
                    Decision::ExplicitDeny
                };
            }
        }

        let wanted = Permission::new(resource_type, action);
        if let Some(role_names) = self.assignments.get(user_id) {
            for name in role_names {
                if let Some(role) = self.roles.get(name) {
                    if role.permissions.contains(&wanted) {
                        return Decision::Role(name.clone());
                    }
                }
            }
        }

        Decision::DefaultDeny
    }

    pub fn roles_of(&self, user_id: &str) -> Vec<String> {
        self.assignments
            .get(user_id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn effective_permissions(&self, user_id: &str) -> BTreeSet<Permission> {
        self.assignments
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|name| self.roles.get(name))
            .flat_map(|role| role.permissions.iter().cloned())
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutations. Each returns whether the document changed.
    // ------------------------------------------------------------------

    pub(crate) fn create_role(&mut self, name: &str) -> Result<bool, AccessError> {
        if self.roles.contains_key(name) {
            return Err(AccessError::RoleExists(name.to_string()));
        }
        self.roles.insert(name.to_string(), Role::new(name));
        Ok(true)
    }

    pub(crate) fn delete_role(&mut self, name: &str) -> Result<bool, AccessError> {
        if self.roles.remove(name).is_none() {
            return Err(AccessError::RoleNotFound(name.to_string()));
        }
        for roles in self.assignments.values_mut() {
            roles.remove(name);
        }
        self.assignments.retain(|_, roles| !roles.is_empty());
        Ok(true)
    }

    pub(crate) fn add_role_permission(
        &mut self,
        role: &str,
        permission: &Permission,
    ) -> Result<bool, AccessError> {
        let role = self.role_mut(role)?;
        Ok(role.permissions.insert(permission.clone()))
    }

    pub(crate) fn remove_role_permission(
        &mut self,
        role: &str,
        permission: &Permission,
    ) -> Result<bool, AccessError> {
        let role = self.role_mut(role)?;
        Ok(role.permissions.remove(permission))
    }

    pub(crate) fn assign_role(&mut self, user_id: &str, role: &str) -> Result<bool, AccessError> {
        if !self.roles.contains_key(role) {
            return Err(AccessError::RoleNotFound(role.to_string()));
        }
        Ok(self
            .assignments
            .entry(user_id.to_string())
            .or_default()
            .insert(role.to_string()))
    }

    pub(crate) fn revoke_role(&mut self, user_id: &str, role: &str) -> Result<bool, AccessError> {
        if !self.roles.contains_key(role) {
            return Err(AccessError::RoleNotFound(role.to_string()));
        }
        let Some(roles) = self.assignments.get_mut(user_id) else {
            return Ok(false);
        };
        let removed = roles.remove(role);
        if roles.is_empty() {
            self.assignments.remove(user_id);
        }
        Ok(removed)
    }

    /// Insert or replace the grant for this user, instance and action.
    pub(crate) fn grant(
        &mut self,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        permission: &Permission,
        allow: bool,
    ) -> bool {
        let key = grant_key(user_id, resource_type, resource_id, &permission.action);
        if let Some(idx) = self.grant_index.get(&key) {
            if let Some(existing) = self.grants.get_mut(*idx) {
                if existing.allow == allow {
                    return false;
                }
                existing.allow = allow;
                existing.granted_at = Utc::now();
                return true;
            }
        }

        self.grants.push(ResourceGrant {
            user_id: user_id.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            permission: permission.clone(),
            allow,
            granted_at: Utc::now(),
        });
        self.grant_index.insert(key, self.grants.len() - 1);
        true
    }

    pub(crate) fn revoke_grant(
        &mut self,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        permission: &Permission,
    ) -> bool {
        let key = grant_key(user_id, resource_type, resource_id, &permission.action);
        match self.grant_index.get(&key).copied() {
            Some(idx) => {
                self.grants.remove(idx);
                self.reindex();
                true
            }
            None => false,
        }
    }

    fn role_mut(&mut self, name: &str) -> Result<&mut Role, AccessError> {
        self.roles
            .get_mut(name)
            .ok_or_else(|| AccessError::RoleNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_editor() -> PolicyDocument {
        let mut doc = PolicyDocument::default();
        doc.create_role("editor").unwrap();
        doc.add_role_permission("editor", &Permission::new("doc", "edit"))
            .unwrap();
        doc.assign_role("u1", "editor").unwrap();
        doc
    }

    #[test]
    fn test_role_union_allows() {
        let doc = doc_with_editor();
        assert_eq!(
            doc.evaluate("u1", "doc", "edit", None),
            Decision::Role("editor".to_string())
        );
        assert_eq!(doc.evaluate("u1", "doc", "delete", None), Decision::DefaultDeny);
        assert_eq!(doc.evaluate("u2", "doc", "edit", None), Decision::DefaultDeny);
    }

    #[test]
    fn test_explicit_deny_beats_role() {
        let mut doc = doc_with_editor();
        doc.grant("u1", "doc", "d42", &Permission::new("doc", "edit"), false);

        assert_eq!(doc.evaluate("u1", "doc", "edit", Some("d42")), Decision::ExplicitDeny);
        // Other instances still follow the role.
        assert!(doc.evaluate("u1", "doc", "edit", Some("d43")).allowed());
    }

    #[test]
    fn test_explicit_allow_without_role() {
        let mut doc = PolicyDocument::default();
        doc.grant("u9", "doc", "d1", &Permission::new("doc", "view"), true);
        assert_eq!(doc.evaluate("u9", "doc", "view", Some("d1")), Decision::ExplicitAllow);
        assert_eq!(doc.evaluate("u9", "doc", "view", None), Decision::DefaultDeny);
    }

    #[test]
    fn test_regrant_replaces_and_revoke_reindexes() {
        let mut doc = PolicyDocument::default();
        let view = Permission::new("doc", "view");
        assert!(doc.grant("u1", "doc", "d1", &view, true));
        assert!(doc.grant("u2", "doc", "d1", &view, true));
        assert!(!doc.grant("u1", "doc", "d1", &view, true));
        assert!(doc.grant("u1", "doc", "d1", &view, false));
        assert_eq!(doc.grants.len(), 2);

        assert!(doc.revoke_grant("u1", "doc", "d1", &view));
        assert!(!doc.revoke_grant("u1", "doc", "d1", &view));
        assert_eq!(doc.evaluate("u2", "doc", "view", Some("d1")), Decision::ExplicitAllow);
    }

    #[test]
    fn test_delete_role_drops_assignments() {
        let mut doc = doc_with_editor();
        doc.delete_role("editor").unwrap();
        assert!(doc.roles_of("u1").is_empty());
        assert!(matches!(doc.delete_role("editor"), Err(AccessError::RoleNotFound(_))));
    }

    #[test]
    fn test_serialized_document_reindexes_on_load() {
        let mut doc = PolicyDocument::default();
        doc.grant("u1", "doc", "d1", &Permission::new("doc", "view"), false);

        let json = serde_json::to_string(&doc).unwrap();
        let loaded: PolicyDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(
            loaded.reindexed().evaluate("u1", "doc", "view", Some("d1")),
            Decision::ExplicitDeny
        );
    }

    #[test]
    fn test_effective_permissions_is_union() {
        let mut doc = doc_with_editor();
        doc.create_role("viewer").unwrap();
        doc.add_role_permission("viewer", &Permission::new("doc", "view"))
            .unwrap();
        doc.add_role_permission("viewer", &Permission::new("doc", "edit"))
            .unwrap();
        doc.assign_role("u1", "viewer").unwrap();

        let perms = doc.effective_permissions("u1");
        assert_eq!(perms.len(), 2);
        assert_eq!(doc.roles_of("u1"), vec!["editor", "viewer"]);
    }
}
