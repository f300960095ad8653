//! Request engine. The public API for creating, reading and transitioning
//! requests.
//!
//! Handlers are stateless; all coordination is left to the store's
//! conditional writes. The engine never retries.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use opentelemetry::KeyValue;
use secrecy::SecretString;
use tracing::{error, info, warn};

use crate::config::secrets::secret_matches;
use crate::error::{Error, Result};
use crate::model::{Request, RequestId, Status, StatusChangedEvent};
use crate::queue::EventQueue;
use crate::store::RequestStore;
use crate::telemetry::metrics;

/// Settings the engine needs beyond its store and queue.
#[derive(Debug)]
pub struct EngineConfig {
    pub admin_token: SecretString,
    /// Base of tracking URLs, without a trailing slash.
    pub public_base_url: String,
}

/// A freshly created request and its capability URL.
#[derive(Debug, Clone)]
pub struct Created {
    pub request: Request,
    /// The only credential for reading the request back.
    pub tracking_url: String,
}

/// The request engine.
pub struct Engine {
    store: Arc<dyn RequestStore>,
    queue: Arc<dyn EventQueue>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RequestStore>,
        queue: Arc<dyn EventQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Create a `PENDING` request. Rejects an empty title; whitespace is a
    /// title like any other.
    pub async fn create_request(&self, title: &str) -> Result<Created> {
        if title.is_empty() {
            return Err(Error::Validation("title required".to_string()));
        }

        let request = Request::new(title);
        self.store.create(&request).await?;
        metrics::requests_created().add(1, &[]);

        let tracking_url = self.tracking_url(&request);
        info!(request_id = %request.id, "request created");
        Ok(Created {
            request,
            tracking_url,
        })
    }

    /// `{base}/requests/{id}?t={token}`
    pub fn tracking_url(&self, request: &Request) -> String {
        format!(
            "{}/requests/{}?t={}",
            self.config.public_base_url,
            request.id,
            request.requester_token.as_deref().unwrap_or_default()
        )
    }

    /// Read a request, gated on its requester token.
    ///
    /// A missing token is a validation error and never reaches the store.
    pub async fn read_request(&self, id: &str, token: Option<&str>) -> Result<Request> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Validation("token required".to_string()))?;
        let id: RequestId = id.parse()?;

        let request = self
            .store
            .read_consistent(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let Some(stored) = request.requester_token.as_deref() else {
            error!(request_id = %id, "stored request has no requester token");
            return Err(Error::Persistence(format!("corrupt item: {id}")));
        };
        if stored != token {
            return Err(Error::Forbidden);
        }
        Ok(request)
    }

    /// Check an admin credential. Missing and wrong are both unauthorized.
    pub fn authorize_admin(&self, credential: Option<&str>) -> Result<()> {
        if credential.is_some_and(|c| secret_matches(&self.config.admin_token, c)) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }

    /// Admin-gated status change.
    ///
    /// Any of the four statuses may follow any other; no ordering is enforced.
    /// On success the returned event has already been enqueued. If the
    /// enqueue fails the caller gets an error, but the stored status has
    /// already changed and is not rolled back: status runs ahead of history
    /// until another event for the request is applied.
    pub async fn transition_status(
        &self,
        id: &str,
        new_status: &str,
        admin_credential: Option<&str>,
    ) -> Result<StatusChangedEvent> {
        self.authorize_admin(admin_credential)?;
        let status: Status = new_status.parse()?;
        let id: RequestId = id.parse()?;

        let started = Instant::now();
        let changed_at = Utc::now();

        if let Err(e) = self.store.update_status(id, status, changed_at).await {
            let result = if matches!(e, Error::NotFound(_)) {
                "not_found"
            } else {
                "error"
            };
            record_transition(status, result);
            return Err(e);
        }

        let event = StatusChangedEvent::new(id, status, changed_at);
        let body = event.to_body()?;
        if let Err(e) = self.queue.send(&body).await {
            warn!(
                request_id = %id,
                event_id = %event.event_id,
                status = %status,
                error = %e,
                "status updated but event enqueue failed"
            );
            record_transition(status, "enqueue_failed");
            return Err(e);
        }

        record_transition(status, "ok");
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "status.transition")],
        );
        info!(
            request_id = %id,
            event_id = %event.event_id,
            status = %status,
            "status changed"
        );
        Ok(event)
    }
}

fn record_transition(status: Status, result: &'static str) {
    metrics::status_transitions().add(
        1,
        &[
            KeyValue::new("status", status.as_str()),
            KeyValue::new("result", result),
        ],
    );
}
