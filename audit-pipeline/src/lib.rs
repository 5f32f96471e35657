//! audit-pipeline: durable, ordered, queryable record of every security decision.
//!
//! `AuditPipeline::log` never fails from the caller's point of view. When the
//! backing store is unavailable events go to a bounded overflow queue and are
//! flushed, in sequence order, once the store recovers.

mod listener;
pub mod models;
mod pipeline;
mod query;
pub mod store;

pub use listener::ListenerId;
pub use models::{
    AuditCategory, AuditEntry, AuditEvent, AuditFilter, AuditOutcome, AuditReport, GroupBy,
    SYSTEM_USER,
};
pub use pipeline::{AuditPipeline, PipelineOptions, PipelineStatus};
pub use query::EventStream;
pub use store::{AuditStore, MemoryAuditStore, SegmentAuditStore, StoreError};
