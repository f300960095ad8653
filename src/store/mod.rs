//! Request store capability.
//!
//! A key-value store keyed by request id with unconditional puts, consistent
//! reads, and conditional updates. Postgres implements it in [`crate::db`];
//! [`MemoryStore`] implements it in-process.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Request, RequestId, Status, StatusChangedEvent};

/// Result of a conditional event application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// History appended, `notified_at` and `last_event_id` updated.
    Applied,
    /// The condition failed: either this event was the last one applied, or
    /// the request does not exist. The store does not say which; both are
    /// safe to acknowledge.
    AlreadyApplied,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Unconditional insert. The caller guarantees the id is fresh.
    async fn create(&self, request: &Request) -> Result<()>;

    /// Strongly consistent read. `None` when the id is unknown.
    async fn read_consistent(&self, id: RequestId) -> Result<Option<Request>>;

    /// Overwrite `status` and `status_updated_at` if the record exists,
    /// otherwise fail with [`crate::error::Error::NotFound`]. History is untouched.
    async fn update_status(&self, id: RequestId, status: Status, at: DateTime<Utc>) -> Result<()>;

    /// Set `notified_at`, `last_event_id` and append one history entry, only
    /// if the record exists and its `last_event_id` is absent or differs
    /// from the event's id.
    async fn apply_event_idempotent(
        &self,
        event: &StatusChangedEvent,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<()>;
}
