//! Repository trait boundaries (`WebhookRepo`, `WebhookEventRepo`) plus
//! in-memory reference implementations.
//!
//! These traits are the engine's external collaborators (SPEC_FULL §6): a
//! production deployment backs them with a real database. This crate ships
//! only the trait and an in-memory implementation, the same split the
//! teacher draws between its `Storage` trait and `InMemoryStorage`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Webhook, WebhookEvent, WebhookEventKey, WebhookEventStatus, WebhookId, WebhookStatus};

/// Repository of webhook destinations.
#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn get_webhook_by_id(&self, id: WebhookId) -> Result<Option<Webhook>>;
    async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()>;

    /// All known webhooks. Read-only, used by recovery at startup to find
    /// candidates with events stuck in `Delivering` — not a hot path.
    async fn list_webhooks(&self) -> Result<Vec<Webhook>>;
}

/// A live feed of newly-submitted events in `New` status. Dropping the
/// dequeue closes the underlying channel from the consumer side.
pub struct NewEventDequeue {
    rx: mpsc::Receiver<WebhookEvent>,
}

impl NewEventDequeue {
    pub async fn take(&mut self) -> Option<WebhookEvent> {
        self.rx.recv().await
    }
}

/// Repository of webhook events: status transitions and the `New`-event
/// subscription the ingestion stage consumes from.
#[async_trait]
pub trait WebhookEventRepo: Send + Sync {
    /// Open a subscription dequeue of events in `New` status. Implementations
    /// typically support only one live subscriber at a time.
    fn subscribe_new_events(&self) -> NewEventDequeue;

    async fn set_event_status(&self, key: WebhookEventKey, status: WebhookEventStatus) -> Result<()>;

    async fn set_event_status_many(&self, keys: &[WebhookEventKey], status: WebhookEventStatus) -> Result<()>;

    async fn set_all_as_failed_by_webhook_id(&self, id: WebhookId) -> Result<()>;

    /// Events left in `Delivering` for a webhook — the recovery target after
    /// an unclean restart (SPEC_FULL §4.6).
    async fn get_delivering_events_by_webhook(&self, id: WebhookId) -> Result<Vec<WebhookEvent>>;
}

/// In-memory `WebhookRepo`, suitable for tests and single-process use.
#[derive(Default)]
pub struct InMemoryWebhookRepo {
    webhooks: RwLock<HashMap<WebhookId, Webhook>>,
}

impl InMemoryWebhookRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, webhook: Webhook) {
        self.webhooks.write().insert(webhook.id, webhook);
    }
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn get_webhook_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        Ok(self.webhooks.read().get(&id).cloned())
    }

    async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()> {
        if let Some(webhook) = self.webhooks.write().get_mut(&id) {
            webhook.status = status;
        }
        Ok(())
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        Ok(self.webhooks.read().values().cloned().collect())
    }
}

/// In-memory `WebhookEventRepo`, suitable for tests and single-process use.
pub struct InMemoryWebhookEventRepo {
    events: RwLock<HashMap<WebhookEventKey, WebhookEvent>>,
    new_event_tx: RwLock<Option<mpsc::Sender<WebhookEvent>>>,
}

impl Default for InMemoryWebhookEventRepo {
    fn default() -> Self {
        Self { events: RwLock::new(HashMap::new()), new_event_tx: RwLock::new(None) }
    }
}

impl InMemoryWebhookEventRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a new event (status `New`), storing it and — if a subscriber is
    /// live — forwarding it onto the subscription dequeue.
    pub async fn submit(&self, event: WebhookEvent) {
        let key = event.key;
        self.events.write().insert(key, event.clone());
        let sender = self.new_event_tx.read().clone();
        if let Some(tx) = sender {
            // Best-effort: if the subscriber's queue is full or gone, the
            // event still exists in the repo for recovery/polling paths.
            let _ = tx.send(event).await;
        }
    }

    pub fn get(&self, key: WebhookEventKey) -> Option<WebhookEvent> {
        self.events.read().get(&key).cloned()
    }
}

#[async_trait]
impl WebhookEventRepo for InMemoryWebhookEventRepo {
    fn subscribe_new_events(&self) -> NewEventDequeue {
        let (tx, rx) = mpsc::channel(1024);
        *self.new_event_tx.write() = Some(tx);
        NewEventDequeue { rx }
    }

    async fn set_event_status(&self, key: WebhookEventKey, status: WebhookEventStatus) -> Result<()> {
        if let Some(event) = self.events.write().get_mut(&key) {
            event.status = status;
        }
        Ok(())
    }

    async fn set_event_status_many(&self, keys: &[WebhookEventKey], status: WebhookEventStatus) -> Result<()> {
        let mut events = self.events.write();
        for key in keys {
            if let Some(event) = events.get_mut(key) {
                event.status = status;
            }
        }
        Ok(())
    }

    async fn set_all_as_failed_by_webhook_id(&self, id: WebhookId) -> Result<()> {
        let mut events = self.events.write();
        for event in events.values_mut() {
            if event.webhook_id() == id && event.status == WebhookEventStatus::Delivering {
                event.status = WebhookEventStatus::Failed;
            }
        }
        Ok(())
    }

    async fn get_delivering_events_by_webhook(&self, id: WebhookId) -> Result<Vec<WebhookEvent>> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|e| e.webhook_id() == id && e.status == WebhookEventStatus::Delivering)
            .cloned()
            .collect())
    }
}

/// Convenience bundle of the two in-memory repos, `Arc`-wrapped for sharing
/// across the engine's tasks.
pub struct InMemoryRepos {
    pub webhooks: Arc<InMemoryWebhookRepo>,
    pub events: Arc<InMemoryWebhookEventRepo>,
}

impl InMemoryRepos {
    pub fn new() -> Self {
        Self { webhooks: Arc::new(InMemoryWebhookRepo::new()), events: Arc::new(InMemoryWebhookEventRepo::new()) }
    }
}

impl Default for InMemoryRepos {
    fn default() -> Self {
        Self::new()
    }
}
