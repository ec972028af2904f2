//! The dispatcher: turns one [`WebhookDispatch`] into a single HTTP attempt
//! and reacts to its outcome.
//!
//! Grounded on the teacher's claim → sign → send → drain-results pipeline in
//! `dwctl/src/webhooks/dispatcher.rs`, collapsed to single-attempt scope: the
//! claim/sign/DB-update stages there map onto our repo-trait calls, and the
//! sender task's success/failure split maps onto [`Dispatcher::deliver`]'s two
//! branches. The retry subsystem (`retry.rs`) owns re-attempts; this module
//! only ever makes one POST per call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::WebhookError;
use crate::error_hub::ErrorHub;
use crate::http_client::{HttpResponse, WebhookHttpClient, WebhookHttpRequest};
use crate::repo::{WebhookEventRepo, WebhookRepo};
use crate::state::{InternalState, RetryQueueLookup};
use crate::types::{Webhook, WebhookDispatch, WebhookEventStatus, WebhookId, WebhookSemantics, WebhookStatus};

/// Outcome of one delivery attempt, as seen by the caller driving the
/// dispatch (the subscription stage for a first attempt, or the retry
/// worker for a re-attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The attempt succeeded; events are now `Delivered`.
    Delivered,
    /// The attempt failed. For `AtMostOnce` webhooks this is terminal
    /// (events are now `Failed`); for `AtLeastOnce` webhooks the dispatch has
    /// been handed to the retry subsystem.
    Failed,
}

/// Single-attempt delivery driver, shared by the ingestion path (first
/// attempt) and the retry subsystem (subsequent attempts).
pub struct Dispatcher<H: WebhookHttpClient, WR: WebhookRepo, ER: WebhookEventRepo> {
    http_client: Arc<H>,
    webhooks: Arc<WR>,
    events: Arc<ER>,
    state: Arc<InternalState>,
    errors: Arc<ErrorHub>,
    retry_queue_capacity: usize,
}

impl<H: WebhookHttpClient, WR: WebhookRepo, ER: WebhookEventRepo> Dispatcher<H, WR, ER> {
    pub fn new(
        http_client: Arc<H>,
        webhooks: Arc<WR>,
        events: Arc<ER>,
        state: Arc<InternalState>,
        errors: Arc<ErrorHub>,
        retry_queue_capacity: usize,
    ) -> Self {
        Self { http_client, webhooks, events, state, errors, retry_queue_capacity }
    }

    pub fn webhooks_repo(&self) -> &Arc<WR> {
        &self.webhooks
    }

    pub fn events_repo(&self) -> &Arc<ER> {
        &self.events
    }

    pub fn state(&self) -> &Arc<InternalState> {
        &self.state
    }

    pub fn errors(&self) -> &Arc<ErrorHub> {
        &self.errors
    }

    /// Perform the raw HTTP attempt for `dispatch`, with no status writes or
    /// retry routing. Used directly by the retry subsystem's worker, which
    /// drives success/failure handling inline rather than looping back
    /// through [`Dispatcher::deliver`] (SPEC_FULL §4.5).
    pub async fn attempt(&self, dispatch: &WebhookDispatch) -> crate::error::Result<HttpResponse> {
        let request = WebhookHttpRequest {
            url: dispatch.url.clone(),
            body: dispatch.body(),
            headers: dispatch.headers().to_vec(),
        };
        self.http_client.post(request).await
    }

    /// Attempt to deliver `dispatch` to `webhook` once. Reports the outcome,
    /// updates event status, and — for `AtLeastOnce` failures — hands the
    /// dispatch to the retry subsystem.
    pub async fn deliver(&self, webhook: &Webhook, dispatch: WebhookDispatch) -> DeliveryOutcome {
        let result = self.attempt(&dispatch).await;

        match result {
            Ok(response) if response.is_success() => self.handle_success(webhook, dispatch, response).await,
            Ok(response) => {
                self.errors.post(WebhookError::HttpClient(format!(
                    "webhook {} responded {}",
                    webhook.id, response.status_code
                )));
                self.handle_failure(webhook, dispatch).await
            }
            Err(e) => {
                self.errors.post(e.clone());
                self.handle_failure(webhook, dispatch).await
            }
        }
    }

    async fn handle_success(&self, webhook: &Webhook, dispatch: WebhookDispatch, response: HttpResponse) -> DeliveryOutcome {
        tracing::debug!(webhook_id = %webhook.id, dispatch_id = dispatch.id, status = response.status_code, "dispatch delivered");

        if let Err(e) = self.events.set_event_status_many(&dispatch.keys(), WebhookEventStatus::Delivered).await {
            self.errors.post(e);
        }

        if dispatch.semantics == WebhookSemantics::AtLeastOnce {
            self.state.remove_retry(webhook.id, dispatch.id);
            self.maybe_close_retrying(webhook.id).await;
        }

        DeliveryOutcome::Delivered
    }

    async fn handle_failure(&self, webhook: &Webhook, dispatch: WebhookDispatch) -> DeliveryOutcome {
        match dispatch.semantics {
            WebhookSemantics::AtMostOnce => {
                if let Err(e) = self.events.set_event_status_many(&dispatch.keys(), WebhookEventStatus::Failed).await {
                    self.errors.post(e);
                }
                DeliveryOutcome::Failed
            }
            WebhookSemantics::AtLeastOnce => {
                self.route_to_retry(webhook, dispatch).await;
                DeliveryOutcome::Failed
            }
        }
    }

    /// Hand a failed `AtLeastOnce` dispatch to the webhook's retry queue,
    /// creating it if this is the webhook's first in-flight failure. The
    /// get-or-create lookup is a single atomic operation on `InternalState`
    /// (see [`RetryQueueLookup`]) so two concurrent failures for the same
    /// webhook can never each create their own queue.
    async fn route_to_retry(&self, webhook: &Webhook, dispatch: WebhookDispatch) {
        let tx = match self.state.get_or_start_retrying(webhook.id, self.retry_queue_capacity) {
            RetryQueueLookup::Existing(tx) => tx,
            RetryQueueLookup::Created(tx) => {
                if let Err(e) = self.webhooks.set_webhook_status(webhook.id, WebhookStatus::Retrying { since: Utc::now() }).await {
                    self.errors.post(e);
                }
                tx
            }
            // The webhook is already known in-memory as Disabled/Unavailable:
            // a concurrent transition raced us here, and the dispatch cannot
            // be retried against a webhook no longer taking traffic
            // (SPEC_FULL §9).
            RetryQueueLookup::Blocked => {
                self.errors.post(WebhookError::RaceDroppedDispatch(webhook.id));
                if let Err(e) = self.events.set_event_status_many(&dispatch.keys(), WebhookEventStatus::Failed).await {
                    self.errors.post(e);
                }
                return;
            }
        };

        if tx.send(dispatch).await.is_err() {
            self.errors.post(WebhookError::HttpClient(format!(
                "retry queue for webhook {} closed unexpectedly",
                webhook.id
            )));
        }
    }

    /// If a webhook's retry map just emptied out, it has recovered: flip it
    /// back to `Enabled`. Called after every successful retry delivery.
    /// Returns whether it actually closed. The check-and-transition happens
    /// under one lock on `InternalState` so a retry fed in right as the map
    /// empties is never silently discarded by an overwrite.
    pub(crate) async fn maybe_close_retrying(&self, webhook_id: WebhookId) -> bool {
        let closed = self.state.close_if_retries_empty(webhook_id);
        if closed {
            if let Err(e) = self.webhooks.set_webhook_status(webhook_id, WebhookStatus::Enabled).await {
                self.errors.post(e);
            }
        }
        closed
    }
}

/// A thin adapter used by the engine facade to know how long to wait before
/// giving up on an in-flight HTTP attempt (separate from retry backoff,
/// which governs the gap *between* attempts).
pub fn attempt_timeout(default: Duration) -> Duration {
    default
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_hub::ErrorHub;
    use crate::http_client::MockWebhookHttpClient;
    use crate::repo::{InMemoryWebhookEventRepo, InMemoryWebhookRepo};
    use crate::types::{WebhookDeliveryMode, WebhookEvent, WebhookEventKey};
    use uuid::Uuid;

    fn webhook(id: uuid::Uuid, mode: WebhookDeliveryMode) -> Webhook {
        Webhook { id, url: "https://example.test/hook".into(), label: "test".into(), status: WebhookStatus::Enabled, mode }
    }

    fn event(webhook_id: uuid::Uuid) -> WebhookEvent {
        WebhookEvent {
            key: WebhookEventKey::new(webhook_id, Uuid::new_v4()),
            status: WebhookEventStatus::Delivering,
            payload: "{}".into(),
            headers: vec![],
        }
    }

    fn dispatcher_with(
        http: MockWebhookHttpClient,
    ) -> (
        Dispatcher<MockWebhookHttpClient, InMemoryWebhookRepo, InMemoryWebhookEventRepo>,
        Arc<InMemoryWebhookEventRepo>,
        Arc<InternalState>,
    ) {
        let webhooks = Arc::new(InMemoryWebhookRepo::new());
        let events = Arc::new(InMemoryWebhookEventRepo::new());
        let state = Arc::new(InternalState::new());
        let errors = Arc::new(ErrorHub::new(16));
        let dispatcher = Dispatcher::new(Arc::new(http), webhooks, events.clone(), state.clone(), errors, 8);
        (dispatcher, events, state)
    }

    #[tokio::test]
    async fn at_most_once_failure_marks_events_failed_and_does_not_retry() {
        let http = MockWebhookHttpClient::new();
        http.queue_response("https://example.test/hook", Ok(HttpResponse { status_code: 500 }));
        let (dispatcher, events, state) = dispatcher_with(http);

        let webhook = webhook(Uuid::new_v4(), WebhookDeliveryMode::at_most_once_single());
        let event = event(webhook.id);
        let key = event.key;
        events.submit(event.clone()).await;
        let dispatch = WebhookDispatch::new(&webhook, vec![event]);

        let outcome = dispatcher.deliver(&webhook, dispatch).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(events.get(key).unwrap().status, WebhookEventStatus::Failed);
        assert!(state.existing_retry_queue(webhook.id).is_none());
    }

    #[tokio::test]
    async fn at_least_once_failure_creates_a_retry_queue() {
        let http = MockWebhookHttpClient::new();
        http.queue_response("https://example.test/hook", Ok(HttpResponse { status_code: 500 }));
        let (dispatcher, events, state) = dispatcher_with(http);

        let webhook = webhook(Uuid::new_v4(), WebhookDeliveryMode::at_least_once_single());
        let event = event(webhook.id);
        events.submit(event.clone()).await;
        let dispatch = WebhookDispatch::new(&webhook, vec![event]);

        let outcome = dispatcher.deliver(&webhook, dispatch).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert!(state.existing_retry_queue(webhook.id).is_some());
    }

    #[tokio::test]
    async fn success_marks_events_delivered() {
        let http = MockWebhookHttpClient::new();
        http.queue_response("https://example.test/hook", Ok(HttpResponse { status_code: 200 }));
        let (dispatcher, events, _state) = dispatcher_with(http);

        let webhook = webhook(Uuid::new_v4(), WebhookDeliveryMode::at_most_once_single());
        let event = event(webhook.id);
        let key = event.key;
        events.submit(event.clone()).await;
        let dispatch = WebhookDispatch::new(&webhook, vec![event]);

        let outcome = dispatcher.deliver(&webhook, dispatch).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(events.get(key).unwrap().status, WebhookEventStatus::Delivered);
    }

    #[tokio::test]
    async fn race_dropped_dispatch_is_reported_when_webhook_already_unavailable() {
        let http = MockWebhookHttpClient::new();
        http.queue_response("https://example.test/hook", Ok(HttpResponse { status_code: 500 }));
        let (dispatcher, events, state) = dispatcher_with(http);

        let webhook = webhook(Uuid::new_v4(), WebhookDeliveryMode::at_least_once_single());
        state.update_webhook_state(webhook.id, crate::state::WebhookState::Unavailable);

        let event = event(webhook.id);
        let key = event.key;
        events.submit(event.clone()).await;
        let dispatch = WebhookDispatch::new(&webhook, vec![event]);

        let outcome = dispatcher.deliver(&webhook, dispatch).await;
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(events.get(key).unwrap().status, WebhookEventStatus::Failed);
        assert!(state.existing_retry_queue(webhook.id).is_none());
    }
}
