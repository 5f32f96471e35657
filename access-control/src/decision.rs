use serde::Serialize;

/// Outcome of one permission check, with the rule that decided it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decided_by", content = "role", rename_all = "snake_case")]
pub enum Decision {
    ExplicitDeny,
    ExplicitAllow,
    Role(String),
    DefaultDeny,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        matches!(self, Decision::ExplicitAllow | Decision::Role(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::ExplicitDeny => "explicit_deny",
            Decision::ExplicitAllow => "explicit_allow",
            Decision::Role(_) => "role",
            Decision::DefaultDeny => "default_deny",
        }
    }
}
