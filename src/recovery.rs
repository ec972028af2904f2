//! Startup recovery: reconstruct retrying state from events left in
//! `Delivering` by a prior, uncleanly-terminated run (SPEC_FULL §4.6).
//!
//! This is the reconstruction the distilled spec calls out as
//! declared-but-unimplemented upstream — there's no teacher file to lift it
//! from directly, so it's built from the same pieces [`crate::dispatcher`]
//! uses to route a freshly-failed `AtLeastOnce` dispatch into the retry
//! subsystem, run once before the new-event subscription starts polling.

use std::sync::Arc;

use chrono::Utc;

use crate::error_hub::ErrorHub;
use crate::repo::{WebhookEventRepo, WebhookRepo};
use crate::state::{InternalState, RetryQueueLookup};
use crate::types::{WebhookDispatch, WebhookEventStatus, WebhookSemantics, WebhookStatus};

/// Scan all webhooks for events stuck in `Delivering`, and either fail them
/// outright (`AtMostOnce`) or hand them to the retry subsystem as if the
/// dispatcher had just observed a first failure (`AtLeastOnce`).
pub async fn recover<WR: WebhookRepo, ER: WebhookEventRepo>(
    webhooks: &Arc<WR>,
    events: &Arc<ER>,
    state: &Arc<InternalState>,
    errors: &Arc<ErrorHub>,
    retry_queue_capacity: usize,
) {
    let all_webhooks = match webhooks.list_webhooks().await {
        Ok(w) => w,
        Err(e) => {
            errors.post(e);
            return;
        }
    };

    for webhook in all_webhooks {
        let delivering = match events.get_delivering_events_by_webhook(webhook.id).await {
            Ok(events) => events,
            Err(e) => {
                errors.post(e);
                continue;
            }
        };

        if delivering.is_empty() {
            continue;
        }

        match webhook.mode.semantics {
            WebhookSemantics::AtMostOnce => {
                tracing::info!(webhook_id = %webhook.id, count = delivering.len(), "marking stale at-most-once deliveries failed");
                let keys: Vec<_> = delivering.iter().map(|e| e.key).collect();
                if let Err(e) = events.set_event_status_many(&keys, WebhookEventStatus::Failed).await {
                    errors.post(e);
                }
            }
            WebhookSemantics::AtLeastOnce => {
                let dispatch = WebhookDispatch::new(&webhook, delivering);
                let tx = match state.get_or_start_retrying(webhook.id, retry_queue_capacity) {
                    RetryQueueLookup::Existing(tx) => tx,
                    RetryQueueLookup::Created(tx) => {
                        if let Err(e) = webhooks.set_webhook_status(webhook.id, WebhookStatus::Retrying { since: Utc::now() }).await {
                            errors.post(e);
                        }
                        tx
                    }
                    RetryQueueLookup::Blocked => {
                        tracing::warn!(webhook_id = %webhook.id, "webhook already disabled/unavailable at recovery, failing stale deliveries");
                        if let Err(e) = events.set_event_status_many(&dispatch.keys(), WebhookEventStatus::Failed).await {
                            errors.post(e);
                        }
                        continue;
                    }
                };

                tracing::info!(webhook_id = %webhook.id, count = dispatch.keys().len(), "re-queuing stale at-least-once deliveries for retry");
                if tx.send(dispatch).await.is_err() {
                    errors.post(crate::error::WebhookError::HttpClient(format!(
                        "retry queue for recovered webhook {} closed unexpectedly",
                        webhook.id
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{InMemoryWebhookEventRepo, InMemoryWebhookRepo};
    use crate::types::{WebhookDeliveryMode, WebhookEvent, WebhookEventKey};
    use uuid::Uuid;

    fn webhook(id: uuid::Uuid, mode: WebhookDeliveryMode) -> crate::types::Webhook {
        crate::types::Webhook { id, url: "https://example.test/hook".into(), label: "t".into(), status: WebhookStatus::Enabled, mode }
    }

    #[tokio::test]
    async fn at_most_once_delivering_events_are_marked_failed() {
        let webhooks = Arc::new(InMemoryWebhookRepo::new());
        let events = Arc::new(InMemoryWebhookEventRepo::new());
        let state = Arc::new(InternalState::new());
        let errors = Arc::new(ErrorHub::new(16));

        let id = Uuid::new_v4();
        webhooks.insert(webhook(id, WebhookDeliveryMode::at_most_once_single()));
        let key = WebhookEventKey::new(id, Uuid::new_v4());
        events
            .submit(WebhookEvent { key, status: WebhookEventStatus::Delivering, payload: "{}".into(), headers: vec![] })
            .await;

        recover(&webhooks, &events, &state, &errors, 8).await;

        assert_eq!(events.get(key).unwrap().status, WebhookEventStatus::Failed);
        assert!(state.existing_retry_queue(id).is_none());
    }

    #[tokio::test]
    async fn at_least_once_delivering_events_are_requeued_for_retry() {
        let webhooks = Arc::new(InMemoryWebhookRepo::new());
        let events = Arc::new(InMemoryWebhookEventRepo::new());
        let state = Arc::new(InternalState::new());
        let errors = Arc::new(ErrorHub::new(16));

        let id = Uuid::new_v4();
        webhooks.insert(webhook(id, WebhookDeliveryMode::at_least_once_single()));
        let key = WebhookEventKey::new(id, Uuid::new_v4());
        events
            .submit(WebhookEvent { key, status: WebhookEventStatus::Delivering, payload: "{}".into(), headers: vec![] })
            .await;

        recover(&webhooks, &events, &state, &errors, 8).await;

        assert!(state.existing_retry_queue(id).is_some());
        assert_eq!(events.get(key).unwrap().status, WebhookEventStatus::Delivering);
        assert!(matches!(
            webhooks.get_webhook_by_id(id).await.unwrap().unwrap().status,
            WebhookStatus::Retrying { .. }
        ));
    }
}
