//! Core domain types: ids, events, webhooks, delivery modes, dispatches, retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a webhook (destination).
pub type WebhookId = Uuid;

/// Opaque identifier for a webhook event.
pub type WebhookEventId = Uuid;

/// Identifier for a constructed dispatch (chunk of events sent as one POST).
///
/// Events carry no natural dispatch identity of their own, so dispatches are
/// assigned one at construction time and keyed by it in retry bookkeeping,
/// standing in for the "identity of the containing chunk" equality the spec
/// describes.
pub type DispatchId = u64;

static NEXT_DISPATCH_ID: AtomicU64 = AtomicU64::new(1);

fn next_dispatch_id() -> DispatchId {
    NEXT_DISPATCH_ID.fetch_add(1, Ordering::Relaxed)
}

/// Unique key for a webhook event: (webhook id, event id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookEventKey {
    pub webhook_id: WebhookId,
    pub event_id: WebhookEventId,
}

impl WebhookEventKey {
    pub fn new(webhook_id: WebhookId, event_id: WebhookEventId) -> Self {
        Self { webhook_id, event_id }
    }
}

/// Lifecycle status of a webhook event.
///
/// Permitted transitions: `New -> Delivering`, `Delivering -> Delivered`,
/// `Delivering -> Failed`. No other transition is valid; statuses never
/// regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventStatus {
    New,
    Delivering,
    Delivered,
    Failed,
}

impl WebhookEventStatus {
    /// Whether `self -> next` is a permitted transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Delivering) | (Self::Delivering, Self::Delivered) | (Self::Delivering, Self::Failed)
        )
    }
}

/// A single webhook event: its key, status, payload, and headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub key: WebhookEventKey,
    pub status: WebhookEventStatus,
    pub payload: String,
    pub headers: Vec<(String, String)>,
}

impl WebhookEvent {
    pub fn webhook_id(&self) -> WebhookId {
        self.key.webhook_id
    }

    /// Case-insensitive lookup of a header value (used to find Content-Type
    /// when grouping for batching).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Persisted webhook status. Only the engine transitions a webhook
/// `Enabled -> Retrying -> (Enabled | Unavailable)`. Disabled webhooks are
/// ignored by ingestion entirely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WebhookStatus {
    Enabled,
    Disabled,
    Retrying { since: DateTime<Utc> },
    Unavailable { since: DateTime<Utc> },
}

impl WebhookStatus {
    /// Whether events may currently be dispatched to a webhook in this status.
    pub fn is_available(self) -> bool {
        matches!(self, Self::Enabled | Self::Retrying { .. })
    }
}

/// Delivery guarantee for a webhook: whether a failed attempt retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookSemantics {
    AtMostOnce,
    AtLeastOnce,
}

/// Whether events for a webhook are delivered one at a time or grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookBatching {
    Single,
    Batched,
}

/// Cross product of [`WebhookBatching`] and [`WebhookSemantics`] — the four
/// effective delivery modes a webhook can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDeliveryMode {
    pub batching: WebhookBatching,
    pub semantics: WebhookSemantics,
}

impl WebhookDeliveryMode {
    pub const fn at_most_once_single() -> Self {
        Self { batching: WebhookBatching::Single, semantics: WebhookSemantics::AtMostOnce }
    }

    pub const fn at_least_once_single() -> Self {
        Self { batching: WebhookBatching::Single, semantics: WebhookSemantics::AtLeastOnce }
    }

    pub const fn at_most_once_batched() -> Self {
        Self { batching: WebhookBatching::Batched, semantics: WebhookSemantics::AtMostOnce }
    }

    pub const fn at_least_once_batched() -> Self {
        Self { batching: WebhookBatching::Batched, semantics: WebhookSemantics::AtLeastOnce }
    }
}

/// A webhook destination: where to POST, and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub url: String,
    pub label: String,
    pub status: WebhookStatus,
    pub mode: WebhookDeliveryMode,
}

/// A non-empty chunk of events bound for one webhook, to be sent as a single
/// HTTP POST. Dispatches are value objects; `size == events.len()`.
#[derive(Debug, Clone)]
pub struct WebhookDispatch {
    pub id: DispatchId,
    pub webhook_id: WebhookId,
    pub url: String,
    pub semantics: WebhookSemantics,
    pub events: Vec<WebhookEvent>,
}

impl WebhookDispatch {
    /// Build a dispatch from a webhook and a non-empty chunk of events.
    ///
    /// # Panics
    /// Panics if `events` is empty — a dispatch with no events is not a
    /// meaningful value and callers are expected to check before building one.
    pub fn new(webhook: &Webhook, events: Vec<WebhookEvent>) -> Self {
        assert!(!events.is_empty(), "a dispatch must contain at least one event");
        Self {
            id: next_dispatch_id(),
            webhook_id: webhook.id,
            url: webhook.url.clone(),
            semantics: webhook.mode.semantics,
            events,
        }
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn keys(&self) -> Vec<WebhookEventKey> {
        self.events.iter().map(|e| e.key).collect()
    }

    /// Deterministic body for the chunk: newline-join of event payloads.
    pub fn body(&self) -> String {
        self.events.iter().map(|e| e.payload.as_str()).collect::<Vec<_>>().join("\n")
    }

    /// Headers for the dispatch: the last event's headers (documented
    /// trade-off, SPEC_FULL §6/§9).
    pub fn headers(&self) -> &[(String, String)] {
        self.events.last().map(|e| e.headers.as_slice()).unwrap_or(&[])
    }
}

/// A scheduled retry attempt for a dispatch.
///
/// The first attempt has no backoff. Each call to [`Retry::next`] sets
/// `backoff = base * factor^attempt` and increments `attempt`.
#[derive(Debug, Clone)]
pub struct Retry {
    pub dispatch: WebhookDispatch,
    pub backoff: Option<Duration>,
    pub base: Duration,
    pub factor: u32,
    pub attempt: u32,
}

impl Retry {
    /// The first retry for a freshly-failed dispatch: no backoff, attempt 0.
    pub fn first(dispatch: WebhookDispatch, base: Duration, factor: u32) -> Self {
        Self { dispatch, backoff: None, base, factor, attempt: 0 }
    }

    /// Compute the next retry: `backoff = base * factor^attempt`, attempt + 1.
    pub fn next(&self) -> Self {
        let backoff = self.base * self.factor.pow(self.attempt);
        Self {
            dispatch: self.dispatch.clone(),
            backoff: Some(backoff),
            base: self.base,
            factor: self.factor,
            attempt: self.attempt + 1,
        }
    }
}
