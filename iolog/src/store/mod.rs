//! Audit record storage trait and backend implementations
//!
//! The `AuditStore` trait is the only thing the interceptors know about
//! persistence. Failures returned from it are caught by
//! [`AuditRecorder::persist`](crate::recorder::AuditRecorder::persist).
//!
//! # Available Backends
//!
//! - **In-memory** (always available): process-local, optionally bounded
//! - **PostgreSQL** (`database` feature): `io_log_entries` table via sqlx

use async_trait::async_trait;

use crate::error::Result;
use crate::recorder::AuditLogEntry;

mod memory;

#[cfg(feature = "database")]
pub mod pg;

pub use memory::InMemoryAuditStore;

/// Trait for audit record persistence backends
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a record, returning the id assigned to it
    ///
    /// The `id` field of `entry` is ignored.
    async fn save(&self, entry: &AuditLogEntry) -> Result<i64>;

    /// All records of one trace, ordered by timestamp
    async fn find_by_trace_id(&self, trace_id: &str) -> Result<Vec<AuditLogEntry>>;
}
