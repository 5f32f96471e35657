use custodian_core::CoreError;
use key_vault::VaultError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComplianceError {
    #[error("Retention policies for {category} disagree ({actions}); category skipped")]
    RetentionPolicyConflict { category: String, actions: String },

    #[error("Retention policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External handler {handler} failed: {message}")]
    External { handler: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Compliance storage error: {0}")]
    Storage(String),
}

impl From<CoreError> for ComplianceError {
    fn from(err: CoreError) -> Self {
        ComplianceError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ComplianceError {
    fn from(err: std::io::Error) -> Self {
        ComplianceError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ComplianceError {
    fn from(err: serde_json::Error) -> Self {
        ComplianceError::Storage(err.to_string())
    }
}

impl From<base64::DecodeError> for ComplianceError {
    fn from(err: base64::DecodeError) -> Self {
        ComplianceError::Storage(format!("corrupt sealed blob: {}", err))
    }
}
