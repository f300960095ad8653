//! Event queue capability.
//!
//! At-least-once delivery: long-poll batched receive, per-message visibility
//! timeout, delete-based acknowledgment. No ordering, no dedup. pgmq
//! implements it in [`crate::db`]; [`MemoryQueue`] implements it in-process.

pub mod memory;

pub use memory::MemoryQueue;

use async_trait::async_trait;

use crate::error::Result;

/// Opaque acknowledgment handle for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckHandle(pub i64);

impl std::fmt::Display for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A received, not yet acknowledged message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: AckHandle,
    pub body: String,
    /// How many times this message has been handed out, this delivery included.
    pub receive_count: i32,
}

/// Parameters of one receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: i32,
    /// Long-poll window. An empty batch after this long is not an error.
    pub wait_seconds: i32,
    /// After this long an unacknowledged delivery becomes receivable again.
    pub visibility_timeout: i32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_seconds: 10,
            visibility_timeout: 30,
        }
    }
}

#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Enqueue a message body. Returns the queue's message id.
    async fn send(&self, body: &str) -> Result<i64>;

    /// Wait up to `opts.wait_seconds` for at least one visible message and
    /// return at most `opts.max_messages` of them, each hidden for
    /// `opts.visibility_timeout` seconds.
    async fn receive_batch(&self, opts: ReceiveOptions) -> Result<Vec<Delivery>>;

    /// Acknowledge a delivery, removing the message for good.
    async fn delete(&self, handle: AckHandle) -> Result<()>;
}
