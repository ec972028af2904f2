//! Error taxonomy for the dispatch engine.
//!
//! Errors raised inside long-running tasks never tear the engine down — they
//! are forwarded to the [error hub](crate::error_hub::ErrorHub) instead. This
//! type is what travels over that hub, plus the `Result` alias used by the
//! repository and HTTP client trait boundaries.

use thiserror::Error;

use crate::types::{WebhookEventKey, WebhookId};

/// Result type for dispatch engine operations.
pub type Result<T> = std::result::Result<T, WebhookError>;

/// Errors surfaced by the dispatch engine, either returned from a fallible
/// trait method or posted to the [`ErrorHub`](crate::error_hub::ErrorHub).
#[derive(Debug, Error, Clone)]
pub enum WebhookError {
    /// An event referenced a webhook id that does not exist in the repo.
    #[error("webhook {0} not found")]
    MissingWebhook(WebhookId),

    /// A repository lookup by event key found nothing.
    #[error("event {0:?} not found")]
    MissingEvent(WebhookEventKey),

    /// Upstream persistence failure (repository implementations wrap their
    /// own error types into this variant at the trait boundary).
    #[error("repository error: {0}")]
    Repository(String),

    /// Transport-level failure. A non-2xx response is not an error at this
    /// layer — it is a delivery failure handled by webhook semantics.
    #[error("http client error: {0}")]
    HttpClient(String),

    /// A dispatch was dropped because its webhook raced into `Disabled` or
    /// `Unavailable` between being queued and being delivered. Recoverable —
    /// surfaced on the hub rather than silently discarded (see SPEC_FULL §9).
    #[error("dispatch for webhook {0} dropped: webhook is disabled or unavailable")]
    RaceDroppedDispatch(WebhookId),
}
