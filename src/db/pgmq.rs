//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.delete. [`PgmqQueue`] binds a queue name and implements
//! [`EventQueue`] on top of them.

use async_trait::async_trait;
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::queue::{AckHandle, Delivery, EventQueue, ReceiveOptions};
use crate::telemetry::metrics;

/// How often `read_with_poll` re-checks the queue inside the long-poll window.
const POLL_INTERVAL_MS: i32 = 250;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: String,
}

fn record_op(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record_op(queue_name, "create");
        Ok(())
    }

    /// Send a JSON message body to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        body: &str,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2::jsonb, $3)")
            .bind(queue_name)
            .bind(body)
            .bind(delay_seconds)
            .fetch_one(self.pool())
            .await?;
        record_op(queue_name, "send");
        Ok(row.0)
    }

    /// Long-poll read of up to `qty` messages, each hidden for `vt_seconds`.
    /// Returns an empty vec if nothing arrived within `max_poll_seconds`.
    pub async fn read_with_poll(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
        max_poll_seconds: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                String,
            ),
        >(
            "SELECT msg_id, read_ct, enqueued_at, vt, message::text
             FROM pgmq.read_with_poll($1, $2, $3, $4, $5)",
        )
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(qty)
        .bind(max_poll_seconds)
        .bind(POLL_INTERVAL_MS)
        .fetch_all(self.pool())
        .await?;

        record_op(
            queue_name,
            if rows.is_empty() { "read_empty" } else { "read" },
        );

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
                msg_id,
                read_ct,
                enqueued_at,
                vt,
                message,
            })
            .collect())
    }

    /// Delete a message permanently. Deleting an unknown id is not an error.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record_op(queue_name, "delete");
        Ok(())
    }

    /// An [`EventQueue`] over the named pgmq queue, sharing this pool.
    pub fn queue(&self, queue_name: impl Into<String>) -> PgmqQueue {
        PgmqQueue {
            db: self.clone(),
            queue_name: queue_name.into(),
        }
    }
}

/// A pgmq queue bound to a name.
#[derive(Clone)]
pub struct PgmqQueue {
    db: super::Db,
    queue_name: String,
}

impl PgmqQueue {
    pub fn name(&self) -> &str {
        &self.queue_name
    }
}

/// Queue failures surface as [`Error::Queue`] whatever the underlying cause.
fn queue_error(e: Error) -> Error {
    match e {
        Error::Queue(_) => e,
        other => Error::Queue(other.to_string()),
    }
}

#[async_trait]
impl EventQueue for PgmqQueue {
    async fn send(&self, body: &str) -> Result<i64> {
        self.db
            .send_to_queue(&self.queue_name, body, 0)
            .await
            .map_err(queue_error)
    }

    async fn receive_batch(&self, opts: ReceiveOptions) -> Result<Vec<Delivery>> {
        let messages = self
            .db
            .read_with_poll(
                &self.queue_name,
                opts.visibility_timeout,
                opts.max_messages,
                opts.wait_seconds,
            )
            .await
            .map_err(queue_error)?;
        Ok(messages
            .into_iter()
            .map(|m| Delivery {
                handle: AckHandle(m.msg_id),
                body: m.message,
                receive_count: m.read_ct,
            })
            .collect())
    }

    async fn delete(&self, handle: AckHandle) -> Result<()> {
        self.db
            .delete_message(&self.queue_name, handle.0)
            .await
            .map_err(queue_error)
    }
}
