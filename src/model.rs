//! Core data model.
//!
//! A request is a user-submitted unit of work with a lifecycle status. Status
//! changes are published as [`StatusChangedEvent`] facts and folded back into
//! the request's history by the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for request IDs. Generated at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = Error;

    /// Anything that is not a UUID can never have been issued by `create`,
    /// so it parses as not-found rather than as a validation failure.
    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::NotFound(s.to_string()))
    }
}

/// Newtype for event IDs. Unique per emission, even when the status repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a request.
///
/// There is no transition table: any status may follow any other, including
/// `Done -> Pending`. Ordering rules are a product decision that has not been
/// made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Rejected,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::InProgress,
        Status::Done,
        Status::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::InProgress => "IN_PROGRESS",
            Status::Done => "DONE",
            Status::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Status::Pending),
            "IN_PROGRESS" => Ok(Status::InProgress),
            "DONE" => Ok(Status::Done),
            "REJECTED" => Ok(Status::Rejected),
            other => Err(Error::Validation(format!("invalid status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A tracked request, as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,

    /// Free text, never empty.
    pub title: String,

    /// Current status. Only the admin transition path writes it.
    pub status: Status,

    /// Fixed at creation.
    pub created_at: DateTime<Utc>,

    /// Capability secret gating reads. Set once at creation.
    /// `None` only for a corrupt stored record.
    pub requester_token: Option<String>,

    /// Set by the admin transition path.
    pub status_updated_at: Option<DateTime<Utc>>,

    /// Set by the worker when it applies an event.
    pub notified_at: Option<DateTime<Utc>>,

    /// Last event the worker applied. Used for deduplication.
    pub last_event_id: Option<EventId>,

    /// Append-only, in worker-processing order.
    pub status_history: Vec<HistoryEntry>,
}

impl Request {
    /// A fresh `PENDING` request with newly generated id and requester token.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            title: title.into(),
            status: Status::Pending,
            created_at: Utc::now(),
            requester_token: Some(Uuid::new_v4().to_string()),
            status_updated_at: None,
            notified_at: None,
            last_event_id: None,
            status_history: Vec::new(),
        }
    }
}

/// One applied status change, recorded by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event_id: EventId,
    pub new_status: Status,
    pub changed_at: DateTime<Utc>,
    pub handled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StatusChangedEvent
// ---------------------------------------------------------------------------

/// Immutable fact describing one status transition. Exists only as a queue
/// message; delivered at least once.
///
/// Wire format: `{eventId, requestId, newStatus, changedAt}`. Unknown fields
/// are ignored; a missing or mistyped required field fails to parse.
///
/// Parsing is typed, not just string-shaped: both ids must be UUIDs,
/// `newStatus` one of the four [`Status`] values and `changedAt` an RFC 3339
/// timestamp. A body failing any of these is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangedEvent {
    pub event_id: EventId,
    pub request_id: RequestId,
    pub new_status: Status,
    pub changed_at: DateTime<Utc>,
}

impl StatusChangedEvent {
    /// A new event with a fresh event id.
    pub fn new(request_id: RequestId, new_status: Status, changed_at: DateTime<Utc>) -> Self {
        Self {
            event_id: EventId::new(),
            request_id,
            new_status,
            changed_at,
        }
    }

    /// Parse a queue message body.
    pub fn from_body(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    /// Serialize to a queue message body.
    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The history entry recorded when this event is applied at `handled_at`.
    pub fn history_entry(&self, handled_at: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            event_id: self.event_id,
            new_status: self.new_status,
            changed_at: self.changed_at,
            handled_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_parses_only_the_four_values() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!(matches!(
            "done".parse::<Status>(),
            Err(Error::Validation(_))
        ));
        assert!("".parse::<Status>().is_err());
    }

    #[test]
    fn non_uuid_request_id_is_not_found() {
        assert!(matches!(
            "not-a-uuid".parse::<RequestId>(),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn event_wire_format_uses_camel_case_strings() {
        let event = StatusChangedEvent::new(RequestId::new(), Status::InProgress, Utc::now());
        let value: serde_json::Value = serde_json::from_str(&event.to_body().unwrap()).unwrap();

        assert_eq!(value["newStatus"], "IN_PROGRESS");
        assert_eq!(value["eventId"], event.event_id.0.to_string());
        assert_eq!(value["requestId"], event.request_id.0.to_string());
        assert!(value["changedAt"].is_string());
    }

    #[test]
    fn event_tolerates_unknown_fields() {
        let body = json!({
            "eventId": Uuid::new_v4(),
            "requestId": Uuid::new_v4(),
            "newStatus": "DONE",
            "changedAt": "2026-01-02T03:04:05Z",
            "traceparent": "00-abc",
        })
        .to_string();

        let event = StatusChangedEvent::from_body(&body).unwrap();
        assert_eq!(event.new_status, Status::Done);
    }

    #[test]
    fn event_rejects_missing_or_mistyped_fields() {
        let missing = json!({
            "eventId": Uuid::new_v4(),
            "newStatus": "DONE",
            "changedAt": "2026-01-02T03:04:05Z",
        });
        let mistyped = json!({
            "eventId": Uuid::new_v4(),
            "requestId": Uuid::new_v4(),
            "newStatus": 3,
            "changedAt": "2026-01-02T03:04:05Z",
        });

        let not_a_uuid = json!({
            "eventId": "evt-1",
            "requestId": Uuid::new_v4(),
            "newStatus": "DONE",
            "changedAt": "2026-01-02T03:04:05Z",
        });
        let bad_timestamp = json!({
            "eventId": Uuid::new_v4(),
            "requestId": Uuid::new_v4(),
            "newStatus": "DONE",
            "changedAt": "yesterday",
        });

        for body in [
            missing.to_string(),
            mistyped.to_string(),
            not_a_uuid.to_string(),
            bad_timestamp.to_string(),
            "not json".to_string(),
        ] {
            assert!(matches!(
                StatusChangedEvent::from_body(&body),
                Err(Error::MessageFormat(_))
            ));
        }
    }
}
