use access_control::AccessError;
use audit_pipeline::{AuditCategory, StoreError};
use compliance_manager::ComplianceError;
use custodian_core::CoreError;
use key_vault::VaultError;
use std::fmt;
use thiserror::Error;

/// Any failure of the services. Full detail; never shown to end users.
#[derive(Error, Debug)]
pub enum CustodianError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Audit storage error: {0}")]
    Audit(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Compliance(#[from] ComplianceError),
}

impl CustodianError {
    /// Audit category the detailed error is recorded under.
    pub(crate) fn category(&self) -> AuditCategory {
        match self {
            CustodianError::Core(_) | CustodianError::Audit(_) => AuditCategory::System,
            CustodianError::Vault(_) => AuditCategory::KeyManagement,
            CustodianError::Access(_) => AuditCategory::Authorization,
            CustodianError::Compliance(ComplianceError::Vault(_)) => AuditCategory::KeyManagement,
            CustodianError::Compliance(_) => AuditCategory::Compliance,
        }
    }

    pub(crate) fn public(&self) -> PublicError {
        match self {
            CustodianError::Vault(VaultError::InvalidInput(_))
            | CustodianError::Access(AccessError::InvalidInput(_))
            | CustodianError::Access(AccessError::RoleNotFound(_))
            | CustodianError::Access(AccessError::RoleExists(_))
            | CustodianError::Compliance(ComplianceError::InvalidInput(_))
            | CustodianError::Compliance(ComplianceError::PolicyNotFound(_))
            | CustodianError::Compliance(ComplianceError::RecordNotFound(_))
            | CustodianError::Compliance(ComplianceError::RetentionPolicyConflict { .. }) => {
                PublicError::InvalidRequest
            }
            _ => PublicError::UnableToProcess,
        }
    }
}

/// What an end user is allowed to learn about a failure.
///
/// Denials never reveal whether the resource exists, and crypto or storage
/// failures never reveal which key or file was involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicError {
    NotPermitted,
    UnableToProcess,
    InvalidRequest,
}

impl PublicError {
    pub fn message(&self) -> &'static str {
        match self {
            PublicError::NotPermitted => "not permitted",
            PublicError::UnableToProcess => "unable to process data",
            PublicError::InvalidRequest => "invalid request",
        }
    }
}

impl fmt::Display for PublicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for PublicError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_failures_are_generic() {
        let err = CustodianError::from(VaultError::KeyRetired("k-123".to_string()));
        assert_eq!(err.public(), PublicError::UnableToProcess);
        assert_eq!(err.public().to_string(), "unable to process data");
        assert_eq!(err.category(), AuditCategory::KeyManagement);
    }

    #[test]
    fn test_malformed_input_is_invalid_request() {
        let err = CustodianError::from(AccessError::RoleNotFound("ghost".to_string()));
        assert_eq!(err.public(), PublicError::InvalidRequest);
        assert!(!err.public().to_string().contains("ghost"));
    }

    #[test]
    fn test_sealed_compliance_failure_is_key_management() {
        let err = CustodianError::from(ComplianceError::Vault(VaultError::Crypto(
            "tag mismatch".to_string(),
        )));
        assert_eq!(err.category(), AuditCategory::KeyManagement);
        assert_eq!(err.public(), PublicError::UnableToProcess);
    }
}
