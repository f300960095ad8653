//! In-process request store.
//!
//! Same conditional semantics as the Postgres store, behind a single
//! `RwLock`. Availability can be toggled to simulate an unreachable store.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ApplyOutcome, RequestStore};
use crate::error::{Error, Result};
use crate::model::{Request, RequestId, Status, StatusChangedEvent};

pub struct MemoryStore {
    items: RwLock<HashMap<RequestId, Request>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// When unavailable, every operation fails with a persistence error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored requests.
    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Persistence("store unavailable".to_string()))
        }
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Persistence("store lock poisoned".to_string())
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, request: &Request) -> Result<()> {
        self.ensure_available()?;
        self.items
            .write()
            .map_err(poisoned)?
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn read_consistent(&self, id: RequestId) -> Result<Option<Request>> {
        self.ensure_available()?;
        Ok(self.items.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn update_status(&self, id: RequestId, status: Status, at: DateTime<Utc>) -> Result<()> {
        self.ensure_available()?;
        let mut items = self.items.write().map_err(poisoned)?;
        let item = items
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        item.status = status;
        item.status_updated_at = Some(at);
        Ok(())
    }

    async fn apply_event_idempotent(
        &self,
        event: &StatusChangedEvent,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        self.ensure_available()?;
        let mut items = self.items.write().map_err(poisoned)?;

        let Some(item) = items.get_mut(&event.request_id) else {
            return Ok(ApplyOutcome::AlreadyApplied);
        };
        if item.last_event_id == Some(event.event_id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        item.notified_at = Some(applied_at);
        item.last_event_id = Some(event.event_id);
        item.status_history.push(event.history_entry(applied_at));
        Ok(ApplyOutcome::Applied)
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }
}
