//! Request store operations on the `requests` table.
//!
//! Conditional writes are single `UPDATE ... WHERE` statements; zero rows
//! affected is the conditional-check failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{EventId, HistoryEntry, Request, RequestId, Status, StatusChangedEvent};
use crate::store::{ApplyOutcome, RequestStore};
use crate::telemetry::metrics;

#[async_trait]
impl RequestStore for super::Db {
    async fn create(&self, request: &Request) -> Result<()> {
        sqlx::query(
            "INSERT INTO requests (id, title, status, created_at, requester_token, status_updated_at, notified_at, last_event_id, status_history)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(request.id.0)
        .bind(&request.title)
        .bind(request.status.as_str())
        .bind(request.created_at)
        .bind(&request.requester_token)
        .bind(request.status_updated_at)
        .bind(request.notified_at)
        .bind(request.last_event_id.map(|e| e.0))
        .bind(Json(&request.status_history))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn read_consistent(&self, id: RequestId) -> Result<Option<Request>> {
        let row: Option<RequestRow> = sqlx::query_as(
            "SELECT id, title, status, created_at, requester_token, status_updated_at, notified_at, last_event_id, status_history
             FROM requests WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.map(RequestRow::try_into_request).transpose()
    }

    async fn update_status(&self, id: RequestId, status: Status, at: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE requests SET status = $1, status_updated_at = $2 WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn apply_event_idempotent(
        &self,
        event: &StatusChangedEvent,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let entry = event.history_entry(applied_at);
        let rows_affected = sqlx::query(
            "UPDATE requests
             SET notified_at = $3,
                 last_event_id = $2,
                 status_history = status_history || jsonb_build_array($4::jsonb)
             WHERE id = $1 AND (last_event_id IS NULL OR last_event_id <> $2)",
        )
        .bind(event.request_id.0)
        .bind(event.event_id.0)
        .bind(applied_at)
        .bind(Json(&entry))
        .execute(self.pool())
        .await?
        .rows_affected();

        let outcome = if rows_affected == 0 {
            ApplyOutcome::AlreadyApplied
        } else {
            ApplyOutcome::Applied
        };
        metrics::store_conditional_writes().add(
            1,
            &[
                KeyValue::new("operation", "apply_event"),
                KeyValue::new("applied", rows_affected > 0),
            ],
        );
        Ok(outcome)
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    title: String,
    status: String,
    created_at: DateTime<Utc>,
    requester_token: Option<String>,
    status_updated_at: Option<DateTime<Utc>>,
    notified_at: Option<DateTime<Utc>>,
    last_event_id: Option<Uuid>,
    status_history: Json<Vec<HistoryEntry>>,
}

impl RequestRow {
    fn try_into_request(self) -> Result<Request> {
        let status = self
            .status
            .parse()
            .map_err(|_| Error::Persistence(format!("corrupt status for {}: {}", self.id, self.status)))?;
        Ok(Request {
            id: RequestId(self.id),
            title: self.title,
            status,
            created_at: self.created_at,
            requester_token: self.requester_token,
            status_updated_at: self.status_updated_at,
            notified_at: self.notified_at,
            last_event_id: self.last_event_id.map(EventId),
            status_history: self.status_history.0,
        })
    }
}
