//! key-vault: generates, stores, rotates and retires keys.
//!
//! Callers name keys; they never see key material. Every ciphertext and
//! signature is an envelope naming the key id and algorithm that produced
//! it, so data sealed before a rotation stays readable until the old key
//! is retired.

mod envelope;
pub mod error;
mod material;
pub mod models;
pub mod store;
mod usage;
mod vault;

pub use envelope::{Algorithm, Envelope};
pub use error::VaultError;
pub use models::{KeyInfo, KeyKind, KeyStatus};
pub use store::{FileKeyStore, KeyStore, MemoryKeyStore, StoredKey};
pub use usage::UsageReporter;
pub use vault::{KeyVault, VaultOptions};
