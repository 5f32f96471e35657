use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Capability to perform `action` on resources of type `resource`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        !self.resource.trim().is_empty() && !self.action.trim().is_empty()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: BTreeSet<Permission>,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            permissions: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }
}

/// Allow or deny override for one resource instance, independent of roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub user_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub permission: Permission,
    pub allow: bool,
    pub granted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_structural_equality() {
        assert_eq!(Permission::new("doc", "edit"), Permission::new("doc", "edit"));
        assert_ne!(Permission::new("doc", "edit"), Permission::new("doc", "view"));
        assert_eq!(Permission::new("doc", "edit").to_string(), "doc:edit");
    }

    #[test]
    fn test_blank_permission_is_malformed() {
        assert!(!Permission::new("doc", " ").is_well_formed());
        assert!(!Permission::new("", "edit").is_well_formed());
        assert!(Permission::new("doc", "edit").is_well_formed());
    }
}
