//! Integration tests for the status-change worker (asynchronous path).
//!
//! Run on a paused tokio clock so visibility timeouts elapse instantly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqtrack::engine::{Disposition, Engine, EngineConfig, Worker, WorkerConfig};
use reqtrack::error::Result;
use reqtrack::model::{Request, RequestId, Status, StatusChangedEvent};
use reqtrack::queue::{AckHandle, Delivery, EventQueue, MemoryQueue, ReceiveOptions};
use reqtrack::store::{ApplyOutcome, MemoryStore, RequestStore};
use secrecy::SecretString;
use tokio::sync::Notify;

const ADMIN: &str = "test-admin-token";
const VISIBILITY_TIMEOUT: i32 = 30;

struct Harness {
    engine: Engine,
    worker: Worker,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let engine = Engine::new(
        store.clone(),
        queue.clone(),
        EngineConfig {
            admin_token: SecretString::from(ADMIN.to_string()),
            public_base_url: "http://track.test".to_string(),
        },
    );
    let worker = Worker::new(store.clone(), queue.clone(), worker_config());
    Harness {
        engine,
        worker,
        store,
        queue,
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        receive: ReceiveOptions {
            max_messages: 10,
            wait_seconds: 1,
            visibility_timeout: VISIBILITY_TIMEOUT,
        },
        receive_error_backoff: Duration::from_secs(1),
    }
}

impl Harness {
    async fn created(&self, title: &str) -> Request {
        self.engine.create_request(title).await.unwrap().request
    }

    async fn transition(&self, id: RequestId, status: Status) -> StatusChangedEvent {
        self.engine
            .transition_status(&id.to_string(), status.as_str(), Some(ADMIN))
            .await
            .unwrap()
    }

    async fn stored(&self, id: RequestId) -> Request {
        self.store.read_consistent(id).await.unwrap().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Round trip
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn round_trip_create_transition_apply() {
    let h = harness();
    let created = h.engine.create_request("t1").await.unwrap();
    let id = created.request.id;
    let token = created.request.requester_token.clone().unwrap();
    assert_eq!(created.request.status, Status::Pending);

    let event = h.transition(id, Status::InProgress).await;

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.received, 1);
    assert_eq!(report.applied, 1);

    let read = h.engine.read_request(&id.to_string(), Some(&token)).await.unwrap();
    assert_eq!(read.status, Status::InProgress);
    assert_eq!(read.status_history.len(), 1);
    assert_eq!(read.status_history[0].event_id, event.event_id);
    assert_eq!(read.status_history[0].new_status, Status::InProgress);
    assert_eq!(read.status_history[0].changed_at, event.changed_at);
    assert_eq!(read.last_event_id, Some(event.event_id));
    assert!(read.notified_at.is_some());
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn worker_never_changes_status() {
    let h = harness();
    let request = h.created("t1").await;
    h.transition(request.id, Status::Done).await;
    // Status moves on before the worker sees the DONE event.
    h.transition(request.id, Status::Rejected).await;

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.applied, 2);

    let stored = h.stored(request.id).await;
    assert_eq!(stored.status, Status::Rejected);
    assert_eq!(stored.status_history.len(), 2);
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn duplicate_deliveries_append_history_once() {
    let h = harness();
    let request = h.created("t1").await;
    let event = h.transition(request.id, Status::Done).await;

    // Four more copies of the same event, as a redelivering queue would produce.
    let body = event.to_body().unwrap();
    for _ in 0..4 {
        h.queue.send(&body).await.unwrap();
    }

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.received, 5);
    assert_eq!(report.applied, 1);
    assert_eq!(report.duplicates, 4);
    assert_eq!(report.ack_failures, 0);

    let stored = h.stored(request.id).await;
    assert_eq!(stored.status_history.len(), 1);
    assert_eq!(stored.last_event_id, Some(event.event_id));
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn replaying_the_last_event_does_not_move_notified_at() {
    let h = harness();
    let request = h.created("t1").await;
    let event = h.transition(request.id, Status::Done).await;
    h.worker.run_once().await.unwrap();
    let first = h.stored(request.id).await;

    let handled = h
        .worker
        .process_delivery(&Delivery {
            handle: AckHandle(999),
            body: event.to_body().unwrap(),
            receive_count: 2,
        })
        .await;
    assert_eq!(handled.disposition, Disposition::Duplicate);
    assert!(handled.acked);

    let second = h.stored(request.id).await;
    assert_eq!(second.notified_at, first.notified_at);
    assert_eq!(second.status_history, first.status_history);
}

/// Dedup only compares against the last applied event. A late redelivery of
/// an older event after a newer one has been applied is appended again.
#[tokio::test(start_paused = true)]
async fn dedup_only_guards_against_the_last_applied_event() {
    let h = harness();
    let request = h.created("t1").await;
    let first = h.transition(request.id, Status::InProgress).await;
    let second = h.transition(request.id, Status::Done).await;
    h.worker.run_once().await.unwrap();

    h.queue.send(&first.to_body().unwrap()).await.unwrap();
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.applied, 1);

    let history: Vec<_> = h
        .stored(request.id)
        .await
        .status_history
        .into_iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(history, vec![first.event_id, second.event_id, first.event_id]);
}

#[tokio::test(start_paused = true)]
async fn event_for_missing_request_is_acknowledged() {
    let h = harness();
    let orphan = StatusChangedEvent::new(RequestId::new(), Status::Done, chrono::Utc::now());
    h.queue.send(&orphan.to_body().unwrap()).await.unwrap();

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert!(h.queue.is_empty());
    assert!(h.store.is_empty());
}

// ---------------------------------------------------------------------------
// Malformed messages
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn malformed_messages_are_deleted_and_never_retried() {
    let h = harness();
    let request = h.created("t1").await;
    let event = h.transition(request.id, Status::Done).await;

    for body in [
        "not json".to_string(),
        r#"{"eventId": "x"}"#.to_string(),
        serde_json::json!({
            "eventId": event.event_id,
            "requestId": event.request_id,
            "newStatus": "ARCHIVED",
            "changedAt": event.changed_at,
        })
        .to_string(),
    ] {
        h.queue.send(&body).await.unwrap();
    }

    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.received, 4);
    assert_eq!(report.applied, 1);
    assert_eq!(report.discarded, 3);
    assert!(h.queue.is_empty());

    tokio::time::advance(Duration::from_secs(VISIBILITY_TIMEOUT as u64 * 2)).await;
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.received, 0);
    assert_eq!(h.stored(request.id).await.status_history.len(), 1);
}

// ---------------------------------------------------------------------------
// Failure and redelivery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_store_failure_is_retried_by_redelivery() {
    let h = harness();
    let request = h.created("t1").await;
    let event = h.transition(request.id, Status::InProgress).await;

    h.store.set_available(false);
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.retained, 1);
    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.queue.in_flight(), 1);

    // Recovered, but the message is still hidden.
    h.store.set_available(true);
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.received, 0);

    tokio::time::advance(Duration::from_secs(VISIBILITY_TIMEOUT as u64)).await;
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.received, 1);
    assert_eq!(report.applied, 1);

    let stored = h.stored(request.id).await;
    assert_eq!(stored.status_history.len(), 1);
    assert_eq!(stored.status_history[0].event_id, event.event_id);
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_delete_is_non_fatal_and_redelivery_is_harmless() {
    let h = harness();
    let request = h.created("t1").await;
    h.transition(request.id, Status::Done).await;

    h.queue.fail_deletes(true);
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.ack_failures, 1);
    assert_eq!(h.queue.len(), 1);

    h.queue.fail_deletes(false);
    tokio::time::advance(Duration::from_secs(VISIBILITY_TIMEOUT as u64)).await;
    let report = h.worker.run_once().await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.ack_failures, 0);

    assert_eq!(h.stored(request.id).await.status_history.len(), 1);
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn receive_failure_is_reported_by_run_once() {
    let h = harness();
    h.queue.set_available(false);
    assert!(h.worker.run_once().await.unwrap_err().is_persistence());
}

// ---------------------------------------------------------------------------
// Concurrency and shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_workers_apply_each_event_once() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..6 {
        let request = h.created(&format!("t{i}")).await;
        h.transition(request.id, Status::InProgress).await;
        ids.push(request.id);
    }

    let other = h.worker.clone();
    let (a, b) = tokio::join!(h.worker.run_once(), other.run_once());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.applied + b.applied, 6);
    assert_eq!(a.received + b.received, 6);

    for id in ids {
        assert_eq!(h.stored(id).await.status_history.len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn run_applies_events_until_shutdown() {
    let h = harness();
    let request = h.created("t1").await;

    let worker = h.worker.clone();
    let task = tokio::spawn(async move { worker.run().await });

    h.transition(request.id, Status::InProgress).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.transition(request.id, Status::Done).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    h.worker.shutdown();
    task.await.unwrap();

    let stored = h.stored(request.id).await;
    assert_eq!(stored.status_history.len(), 2);
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_keeps_going_after_receive_failures() {
    let h = harness();
    let request = h.created("t1").await;
    h.transition(request.id, Status::Done).await;
    h.queue.set_available(false);

    let worker = h.worker.clone();
    let task = tokio::spawn(async move { worker.run().await });

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.queue.set_available(true);
    tokio::time::sleep(Duration::from_secs(5)).await;

    h.worker.shutdown();
    task.await.unwrap();
    assert_eq!(h.stored(request.id).await.status_history.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_returns_immediately_when_already_shut_down() {
    let h = harness();
    h.worker.shutdown();
    h.worker.run().await;
}

/// Blocks the first `apply_event_idempotent` call until released.
struct GatedStore {
    inner: Arc<MemoryStore>,
    gate_armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl RequestStore for GatedStore {
    async fn create(&self, request: &Request) -> Result<()> {
        self.inner.create(request).await
    }

    async fn read_consistent(&self, id: RequestId) -> Result<Option<Request>> {
        self.inner.read_consistent(id).await
    }

    async fn update_status(
        &self,
        id: RequestId,
        status: Status,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.update_status(id, status, at).await
    }

    async fn apply_event_idempotent(
        &self,
        event: &StatusChangedEvent,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        if self.gate_armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.apply_event_idempotent(event, applied_at).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

/// Counts receive calls.
struct CountingQueue {
    inner: Arc<MemoryQueue>,
    receives: AtomicUsize,
}

#[async_trait]
impl EventQueue for CountingQueue {
    async fn send(&self, body: &str) -> Result<i64> {
        self.inner.send(body).await
    }

    async fn receive_batch(&self, opts: ReceiveOptions) -> Result<Vec<Delivery>> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        self.inner.receive_batch(opts).await
    }

    async fn delete(&self, handle: AckHandle) -> Result<()> {
        self.inner.delete(handle).await
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_batch_drains_the_batch_and_stops_receiving() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..3 {
        let request = h.created(&format!("t{i}")).await;
        h.transition(request.id, Status::Done).await;
        ids.push(request.id);
    }

    let store = Arc::new(GatedStore {
        inner: h.store.clone(),
        gate_armed: AtomicBool::new(true),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let queue = Arc::new(CountingQueue {
        inner: h.queue.clone(),
        receives: AtomicUsize::new(0),
    });
    let worker = Worker::new(store.clone(), queue.clone(), worker_config());

    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    // The worker is now holding the whole batch, stuck on the first apply.
    store.entered.notified().await;
    worker.shutdown();
    store.release.notify_one();
    task.await.unwrap();

    for id in ids {
        assert_eq!(h.stored(id).await.status_history.len(), 1);
    }
    assert!(h.queue.is_empty());
    assert_eq!(queue.receives.load(Ordering::SeqCst), 1);
}
