//! Batching stage: groups single events per `(webhook id, content-type)` and
//! flushes by size or time.
//!
//! A single task owns all grouping state, combining the inbound queue and a
//! `FuturesUnordered` of per-group deadline timers in one `tokio::select!`
//! loop (SPEC_FULL §4.4) — the same "one task, one `select!`, no locking
//! between independent units of work" shape the teacher uses for its sender
//! and retry loops, just with per-group timers instead of a semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BatchingConfig;
use crate::latch::CountDownLatch;
use crate::types::{Webhook, WebhookDispatch, WebhookEvent, WebhookId};

/// Grouping key: a webhook plus the content-type of the events accumulating
/// under it (content-type is read case-insensitively from event headers).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    webhook_id: WebhookId,
    content_type: Option<String>,
}

struct Accumulator {
    webhook: Webhook,
    events: Vec<WebhookEvent>,
}

/// Run the batching stage until the input channel closes or `shutdown` fires.
///
/// `input` carries events already resolved to their webhook and marked
/// `Delivering` by the subscription stage. `output` receives one
/// `(Webhook, WebhookDispatch)` per flushed group.
pub async fn run_batching_stage(
    mut input: mpsc::Receiver<(Webhook, WebhookEvent)>,
    output: mpsc::Sender<(Webhook, WebhookDispatch)>,
    config: BatchingConfig,
    shutdown: CancellationToken,
    latch: Arc<CountDownLatch>,
) {
    let mut groups: HashMap<GroupKey, Accumulator> = HashMap::new();
    let mut deadlines = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("batching stage received shutdown, flushing partial batches");
                break;
            }

            maybe_item = input.recv() => {
                match maybe_item {
                    Some((webhook, event)) => {
                        let key = GroupKey { webhook_id: webhook.id, content_type: event.content_type().map(str::to_string) };
                        let is_new_group = !groups.contains_key(&key);
                        let entry = groups.entry(key.clone()).or_insert_with(|| Accumulator { webhook: webhook.clone(), events: Vec::new() });
                        entry.events.push(event);

                        if is_new_group {
                            let max_wait = config.max_wait;
                            let deadline_key = key.clone();
                            deadlines.push(async move {
                                tokio::time::sleep(max_wait).await;
                                deadline_key
                            });
                        }

                        if groups.get(&key).map(|g| g.events.len()).unwrap_or(0) >= config.max_size {
                            if let Some(acc) = groups.remove(&key) {
                                flush(&output, acc).await;
                            }
                        }
                    }
                    None => {
                        tracing::debug!("batching stage input closed");
                        break;
                    }
                }
            }

            Some(key) = deadlines.next() => {
                // The group may already have been flushed by size; a fired
                // deadline for an absent key is a no-op.
                if let Some(acc) = groups.remove(&key) {
                    flush(&output, acc).await;
                }
            }
        }
    }

    for (_, acc) in groups.drain() {
        flush(&output, acc).await;
    }

    latch.count_down();
}

async fn flush(output: &mpsc::Sender<(Webhook, WebhookDispatch)>, acc: Accumulator) {
    let dispatch = WebhookDispatch::new(&acc.webhook, acc.events);
    tracing::debug!(webhook_id = %acc.webhook.id, dispatch_id = dispatch.id, size = dispatch.size(), "flushing batch");
    if output.send((acc.webhook, dispatch)).await.is_err() {
        tracing::warn!("batching stage output channel closed, dropping flushed dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WebhookDeliveryMode, WebhookEventKey, WebhookEventStatus, WebhookStatus};
    use std::time::Duration;
    use uuid::Uuid;

    fn webhook(mode: WebhookDeliveryMode) -> Webhook {
        Webhook { id: Uuid::new_v4(), url: "https://example.test/hook".into(), label: "test".into(), status: WebhookStatus::Enabled, mode }
    }

    fn event(webhook_id: WebhookId, content_type: &str) -> WebhookEvent {
        WebhookEvent {
            key: WebhookEventKey::new(webhook_id, Uuid::new_v4()),
            status: WebhookEventStatus::Delivering,
            payload: "{}".into(),
            headers: vec![("Content-Type".into(), content_type.into())],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_max_size_without_waiting_for_timer() {
        let config = BatchingConfig { capacity: 16, max_size: 2, max_wait: Duration::from_secs(60) };
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let latch = Arc::new(CountDownLatch::new(1));

        let task = tokio::spawn(run_batching_stage(input_rx, output_tx, config, shutdown.clone(), latch.clone()));

        let webhook = webhook(WebhookDeliveryMode::at_most_once_batched());
        input_tx.send((webhook.clone(), event(webhook.id, "application/json"))).await.unwrap();
        input_tx.send((webhook.clone(), event(webhook.id, "application/json"))).await.unwrap();

        let (_, dispatch) = tokio::time::timeout(Duration::from_millis(100), output_rx.recv()).await.unwrap().unwrap();
        assert_eq!(dispatch.size(), 2);

        shutdown.cancel();
        drop(input_tx);
        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_max_wait_when_never_reaching_max_size() {
        let config = BatchingConfig { capacity: 16, max_size: 100, max_wait: Duration::from_millis(50) };
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let latch = Arc::new(CountDownLatch::new(1));

        let task = tokio::spawn(run_batching_stage(input_rx, output_tx, config, shutdown.clone(), latch.clone()));

        let webhook = webhook(WebhookDeliveryMode::at_most_once_batched());
        input_tx.send((webhook.clone(), event(webhook.id, "application/json"))).await.unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;

        let (_, dispatch) = tokio::time::timeout(Duration::from_millis(100), output_rx.recv()).await.unwrap().unwrap();
        assert_eq!(dispatch.size(), 1);

        shutdown.cancel();
        drop(input_tx);
        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn distinct_content_types_form_separate_batches() {
        let config = BatchingConfig { capacity: 16, max_size: 2, max_wait: Duration::from_secs(60) };
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let latch = Arc::new(CountDownLatch::new(1));

        let task = tokio::spawn(run_batching_stage(input_rx, output_tx, config, shutdown.clone(), latch.clone()));

        let webhook = webhook(WebhookDeliveryMode::at_most_once_batched());
        input_tx.send((webhook.clone(), event(webhook.id, "application/json"))).await.unwrap();
        input_tx.send((webhook.clone(), event(webhook.id, "application/xml"))).await.unwrap();

        shutdown.cancel();
        drop(input_tx);

        let mut sizes = vec![];
        while let Some((_, dispatch)) = output_rx.recv().await {
            sizes.push(dispatch.size());
        }
        sizes.sort();
        assert_eq!(sizes, vec![1, 1]);

        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
    }
}
