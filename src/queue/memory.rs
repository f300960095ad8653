//! In-process event queue with visibility timeouts.
//!
//! Deadlines live on the tokio clock, so tests can run it under a paused
//! runtime. Receivers sleep until a send, the next visibility expiry, or the
//! end of the long-poll window, whichever comes first.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{AckHandle, Delivery, EventQueue, ReceiveOptions};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Slot {
    id: i64,
    body: String,
    visible_at: Instant,
    receive_count: i32,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    slots: Vec<Slot>,
}

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    arrivals: Notify,
    available: AtomicBool,
    deletes_fail: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            arrivals: Notify::new(),
            available: AtomicBool::new(true),
            deletes_fail: AtomicBool::new(false),
        }
    }

    /// When unavailable, send and receive fail with a queue error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every delete fail while leaving send and receive working.
    pub fn fail_deletes(&self, fail: bool) {
        self.deletes_fail.store(fail, Ordering::SeqCst);
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by a visibility timeout.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .map(|inner| inner.slots.iter().filter(|s| s.visible_at > now).count())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Queue("queue unavailable".to_string()))
        }
    }

    /// Take up to `opts.max_messages` visible messages and hide them.
    /// Also returns the earliest future visibility deadline, if any.
    fn take_visible(
        &self,
        opts: ReceiveOptions,
        now: Instant,
    ) -> Result<(Vec<Delivery>, Option<Instant>)> {
        let mut inner = self.inner.lock().map_err(poisoned)?;
        let hide_until = now + secs(opts.visibility_timeout);
        let max = usize::try_from(opts.max_messages).unwrap_or(0);

        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for slot in inner.slots.iter_mut() {
            if slot.visible_at <= now && batch.len() < max {
                slot.visible_at = hide_until;
                slot.receive_count += 1;
                batch.push(Delivery {
                    handle: AckHandle(slot.id),
                    body: slot.body.clone(),
                    receive_count: slot.receive_count,
                });
            } else if slot.visible_at > now {
                next_visible =
                    Some(next_visible.map_or(slot.visible_at, |t| t.min(slot.visible_at)));
            }
        }
        Ok((batch, next_visible))
    }
}

fn secs(n: i32) -> Duration {
    Duration::from_secs(u64::try_from(n).unwrap_or(0))
}

fn poisoned<T>(_: T) -> Error {
    Error::Queue("queue lock poisoned".to_string())
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn send(&self, body: &str) -> Result<i64> {
        self.ensure_available()?;
        let id = {
            let mut inner = self.inner.lock().map_err(poisoned)?;
            inner.next_id += 1;
            let id = inner.next_id;
            inner.slots.push(Slot {
                id,
                body: body.to_string(),
                visible_at: Instant::now(),
                receive_count: 0,
            });
            id
        };
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn receive_batch(&self, opts: ReceiveOptions) -> Result<Vec<Delivery>> {
        self.ensure_available()?;
        let deadline = Instant::now() + secs(opts.wait_seconds);

        loop {
            // Register interest before looking, so a send in between is not missed.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (batch, next_visible) = self.take_visible(opts, now)?;
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, handle: AckHandle) -> Result<()> {
        if self.deletes_fail.load(Ordering::SeqCst) {
            return Err(Error::Queue(format!("delete failed for {handle}")));
        }
        let mut inner = self.inner.lock().map_err(poisoned)?;
        // Deleting an already-deleted message is a no-op, as with pgmq.
        inner.slots.retain(|slot| slot.id != handle.0);
        Ok(())
    }
}
