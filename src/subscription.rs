//! New-event subscription: the ingestion stage that turns `New` events into
//! `Delivering` events handed off to batching or direct dispatch.
//!
//! Grounded on the teacher's daemon poll loop shape (`batcher/src/daemon/mod.rs`):
//! a `tokio::select!` racing a single inbound source against a shutdown
//! signal, with per-item handling kept uninterruptible so a status write is
//! never torn mid-flight.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error_hub::ErrorHub;
use crate::latch::CountDownLatch;
use crate::repo::{WebhookEventRepo, WebhookRepo};
use crate::types::{Webhook, WebhookBatching, WebhookDispatch, WebhookEvent, WebhookEventStatus};

/// Run the new-event subscription until `shutdown` fires.
///
/// `batching_tx` is `Some` only when the engine is configured with a
/// batching stage; when `None`, `Batched`-mode webhooks fall back to
/// per-event single dispatch, same as `Single`-mode webhooks.
pub async fn run_subscription_stage<WR: WebhookRepo, ER: WebhookEventRepo>(
    webhooks: Arc<WR>,
    events: Arc<ER>,
    errors: Arc<ErrorHub>,
    batching_tx: Option<mpsc::Sender<(Webhook, WebhookEvent)>>,
    dispatch_tx: mpsc::Sender<(Webhook, WebhookDispatch)>,
    shutdown: CancellationToken,
    startup_latch: Arc<CountDownLatch>,
    shutdown_latch: Arc<CountDownLatch>,
) {
    let mut dequeue = events.subscribe_new_events();
    startup_latch.count_down();
    tracing::debug!("new-event subscription live");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("new-event subscription received shutdown");
                break;
            }

            maybe_event = dequeue.take() => {
                match maybe_event {
                    Some(event) => handle_event(event, &webhooks, &events, &errors, batching_tx.as_ref(), &dispatch_tx).await,
                    None => {
                        tracing::debug!("new-event subscription dequeue closed");
                        break;
                    }
                }
            }
        }
    }

    shutdown_latch.count_down();
}

/// Handle a single `New` event to completion: resolve its webhook, mark it
/// `Delivering`, and hand it off. Runs with no intervening `select!` against
/// shutdown, so the status write and handoff act as one unit.
async fn handle_event<WR: WebhookRepo, ER: WebhookEventRepo>(
    mut event: WebhookEvent,
    webhooks: &Arc<WR>,
    events: &Arc<ER>,
    errors: &Arc<ErrorHub>,
    batching_tx: Option<&mpsc::Sender<(Webhook, WebhookEvent)>>,
    dispatch_tx: &mpsc::Sender<(Webhook, WebhookDispatch)>,
) {
    let webhook_id = event.webhook_id();

    let webhook = match webhooks.get_webhook_by_id(webhook_id).await {
        Ok(Some(webhook)) => webhook,
        Ok(None) => {
            errors.post(crate::error::WebhookError::MissingWebhook(webhook_id));
            return;
        }
        Err(e) => {
            errors.post(e);
            return;
        }
    };

    if !webhook.status.is_available() {
        tracing::debug!(webhook_id = %webhook_id, "dropping event for unavailable webhook");
        return;
    }

    if let Err(e) = events.set_event_status(event.key, WebhookEventStatus::Delivering).await {
        errors.post(e);
        return;
    }
    event.status = WebhookEventStatus::Delivering;

    match (webhook.mode.batching, batching_tx) {
        (WebhookBatching::Batched, Some(tx)) => {
            if tx.send((webhook, event)).await.is_err() {
                tracing::warn!("batching stage channel closed, dropping event");
            }
        }
        _ => {
            let dispatch = WebhookDispatch::new(&webhook, vec![event]);
            if dispatch_tx.send((webhook, dispatch)).await.is_err() {
                tracing::warn!("dispatch channel closed, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{InMemoryWebhookEventRepo, InMemoryWebhookRepo};
    use crate::types::{WebhookDeliveryMode, WebhookEventKey, WebhookId, WebhookStatus};
    use std::time::Duration;
    use uuid::Uuid;

    fn webhook(id: WebhookId, mode: WebhookDeliveryMode, status: WebhookStatus) -> Webhook {
        Webhook { id, url: "https://example.test/hook".into(), label: "test".into(), status, mode }
    }

    fn event(webhook_id: WebhookId) -> WebhookEvent {
        WebhookEvent { key: WebhookEventKey::new(webhook_id, Uuid::new_v4()), status: WebhookEventStatus::New, payload: "{}".into(), headers: vec![] }
    }

    #[tokio::test]
    async fn single_mode_event_is_marked_delivering_and_routed_to_dispatch() {
        let webhooks = Arc::new(InMemoryWebhookRepo::new());
        let events = Arc::new(InMemoryWebhookEventRepo::new());
        let errors = Arc::new(ErrorHub::new(16));

        let id = Uuid::new_v4();
        webhooks.insert(webhook(id, WebhookDeliveryMode::at_most_once_single(), WebhookStatus::Enabled));

        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let startup_latch = Arc::new(CountDownLatch::new(1));
        let shutdown_latch = Arc::new(CountDownLatch::new(1));

        let task = tokio::spawn(run_subscription_stage(
            webhooks.clone(),
            events.clone(),
            errors,
            None,
            dispatch_tx,
            shutdown.clone(),
            startup_latch.clone(),
            shutdown_latch.clone(),
        ));

        tokio::time::timeout(Duration::from_millis(100), startup_latch.wait()).await.unwrap();

        let event = event(id);
        let key = event.key;
        events.submit(event).await;

        let (_, dispatch) = tokio::time::timeout(Duration::from_millis(100), dispatch_rx.recv()).await.unwrap().unwrap();
        assert_eq!(dispatch.keys(), vec![key]);
        assert_eq!(events.get(key).unwrap().status, WebhookEventStatus::Delivering);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn event_for_disabled_webhook_is_dropped() {
        let webhooks = Arc::new(InMemoryWebhookRepo::new());
        let events = Arc::new(InMemoryWebhookEventRepo::new());
        let errors = Arc::new(ErrorHub::new(16));

        let id = Uuid::new_v4();
        webhooks.insert(webhook(id, WebhookDeliveryMode::at_most_once_single(), WebhookStatus::Disabled));

        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let startup_latch = Arc::new(CountDownLatch::new(1));
        let shutdown_latch = Arc::new(CountDownLatch::new(1));

        let task = tokio::spawn(run_subscription_stage(
            webhooks.clone(), events.clone(), errors, None, dispatch_tx, shutdown.clone(), startup_latch.clone(), shutdown_latch.clone(),
        ));
        startup_latch.wait().await;

        let event = event(id);
        let key = event.key;
        events.submit(event).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(dispatch_rx.try_recv().is_err());
        assert_eq!(events.get(key).unwrap().status, WebhookEventStatus::New);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_webhook_posts_error_and_drops_event() {
        let webhooks = Arc::new(InMemoryWebhookRepo::new());
        let events = Arc::new(InMemoryWebhookEventRepo::new());
        let errors = Arc::new(ErrorHub::new(16));
        let mut error_rx = errors.subscribe();

        let (dispatch_tx, _dispatch_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let startup_latch = Arc::new(CountDownLatch::new(1));
        let shutdown_latch = Arc::new(CountDownLatch::new(1));

        let task = tokio::spawn(run_subscription_stage(
            webhooks, events.clone(), errors, None, dispatch_tx, shutdown.clone(), startup_latch.clone(), shutdown_latch.clone(),
        ));
        startup_latch.wait().await;

        let missing_id = Uuid::new_v4();
        events.submit(event(missing_id)).await;

        match tokio::time::timeout(Duration::from_millis(100), error_rx.recv()).await.unwrap().unwrap() {
            crate::error::WebhookError::MissingWebhook(id) => assert_eq!(id, missing_id),
            other => panic!("unexpected error: {other:?}"),
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
    }
}
