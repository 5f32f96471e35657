//! access-control: may subject S perform action A on resource R (instance I)?
//!
//! Evaluation order, first match wins:
//! 1. an explicit deny grant for the resource instance,
//! 2. an explicit allow grant for the resource instance,
//! 3. the union of permissions of every role the user holds,
//! 4. otherwise deny.

mod decision;
pub mod error;
pub mod models;
mod policy;
mod service;
pub mod store;

pub use decision::Decision;
pub use error::AccessError;
pub use models::{Permission, ResourceGrant, Role};
pub use policy::PolicyDocument;
pub use service::AccessControl;
pub use store::{FilePolicyStore, MemoryPolicyStore, PolicyStore};
