use custodian_core::CoreError;
use thiserror::Error;

/// Raised only for malformed input or storage failure; a denied check is
/// a `false` result, never an error.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Role already exists: {0}")]
    RoleExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Policy storage error: {0}")]
    Storage(String),
}

impl From<CoreError> for AccessError {
    fn from(err: CoreError) -> Self {
        AccessError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for AccessError {
    fn from(err: std::io::Error) -> Self {
        AccessError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AccessError {
    fn from(err: serde_json::Error) -> Self {
        AccessError::Storage(err.to_string())
    }
}
