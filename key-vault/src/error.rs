use crate::models::KeyKind;
use custodian_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key {0} is retired and its material destroyed")]
    KeyRetired(String),

    #[error("Key {key_id} still protects {outstanding} item(s); re-encrypt before retiring")]
    KeyInUse { key_id: String, outstanding: usize },

    #[error("An active key named {0} already exists; rotate it instead")]
    KeyExists(String),

    #[error("Key {0} is the active key; rotate before retiring")]
    KeyActive(String),

    #[error("Key {name} is not a {expected:?} key")]
    WrongKeyKind { name: String, expected: KeyKind },

    #[error("Malformed envelope: {0}")]
    MalformedCiphertext(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key storage error: {0}")]
    Storage(String),
}

impl From<CoreError> for VaultError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Crypto(msg) => VaultError::Crypto(msg),
            other => VaultError::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<rsa::Error> for VaultError {
    fn from(err: rsa::Error) -> Self {
        VaultError::Crypto(err.to_string())
    }
}
