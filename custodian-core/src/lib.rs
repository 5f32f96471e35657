//! custodian-core: Shared infrastructure for the custodian security services.
pub mod config;
pub mod details;
pub mod error;
pub mod observability;
pub mod utils;

pub use details::{DetailValue, Details};
pub use error::CoreError;

pub use chrono;
pub use secrecy;
pub use serde;
pub use serde_json;
pub use tracing;
