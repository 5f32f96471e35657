//! custodian: explicit construction and teardown of the security services.
//!
//! Nothing here is global. A host builds one `Custodian` from configuration,
//! passes it (or the individual services) to its request handlers and calls
//! `shutdown` on the way out.

pub mod error;
mod services;

pub use error::{CustodianError, PublicError};
pub use services::Custodian;

pub use access_control;
pub use audit_pipeline;
pub use compliance_manager;
pub use custodian_core;
pub use key_vault;
