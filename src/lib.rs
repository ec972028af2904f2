//! Reliable-dispatch engine for webhook delivery.
//!
//! This crate consumes a stream of webhook events from a repository, groups
//! them into HTTP dispatches per destination, delivers them according to
//! per-webhook semantics (at-most-once or at-least-once), and drives a retry
//! state machine with exponential backoff that can ultimately quarantine a
//! persistently failing destination.
//!
//! It ships the engine and in-memory reference implementations of its
//! repository/HTTP-client trait boundaries; a database-backed `WebhookRepo`/
//! `WebhookEventRepo` and an HTTP receiver/CLI are integration concerns left
//! to the embedding application.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use uuid::Uuid;
//! use webhook_dispatch::{
//!     Engine, EngineConfig, InMemoryWebhookEventRepo, InMemoryWebhookRepo,
//!     ReqwestWebhookHttpClient, Webhook, WebhookDeliveryMode, WebhookEvent,
//!     WebhookEventKey, WebhookEventStatus, WebhookStatus,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let http_client = Arc::new(ReqwestWebhookHttpClient::new(Duration::from_secs(10)));
//!     let webhooks = Arc::new(InMemoryWebhookRepo::new());
//!     let events = Arc::new(InMemoryWebhookEventRepo::new());
//!
//!     let webhook_id = Uuid::new_v4();
//!     webhooks.insert(Webhook {
//!         id: webhook_id,
//!         url: "https://example.com/hook".to_string(),
//!         label: "example".to_string(),
//!         status: WebhookStatus::Enabled,
//!         mode: WebhookDeliveryMode::at_least_once_single(),
//!     });
//!
//!     let engine = Engine::new(http_client, webhooks, events.clone(), EngineConfig::default());
//!     engine.start().await?;
//!
//!     events
//!         .submit(WebhookEvent {
//!             key: WebhookEventKey::new(webhook_id, Uuid::new_v4()),
//!             status: WebhookEventStatus::New,
//!             payload: r#"{"event":"ping"}"#.to_string(),
//!             headers: vec![("Content-Type".to_string(), "application/json".to_string())],
//!         })
//!         .await;
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod batching;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod error_hub;
pub mod http_client;
pub mod latch;
pub mod recovery;
pub mod repo;
pub mod retry;
pub mod signing;
pub mod state;
pub mod subscription;
pub mod types;

// Re-export the crate's public interface at the root, the same flattening
// the teacher applies over its own manager/storage/request modules.
pub use config::{BatchingConfig, EngineConfig, RetryConfig};
pub use engine::Engine;
pub use error::{Result, WebhookError};
pub use http_client::{HttpResponse, MockWebhookHttpClient, ReqwestWebhookHttpClient, WebhookHttpClient, WebhookHttpRequest};
pub use repo::{InMemoryRepos, InMemoryWebhookEventRepo, InMemoryWebhookRepo, NewEventDequeue, WebhookEventRepo, WebhookRepo};
pub use state::{InternalState, RetryingState, StateChange, WebhookState};
pub use types::{
    DispatchId, Retry, Webhook, WebhookBatching, WebhookDeliveryMode, WebhookDispatch, WebhookEvent, WebhookEventId,
    WebhookEventKey, WebhookEventStatus, WebhookId, WebhookSemantics, WebhookStatus,
};
