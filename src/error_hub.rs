//! Error hub: a broadcast channel with a sliding (drop-oldest) discard
//! policy. Producers are never blocked by a slow consumer — that is exactly
//! what `tokio::sync::broadcast`'s own lagged-receiver semantics give us, so
//! the hub is a thin, typed wrapper rather than a custom ring buffer.

use tokio::sync::broadcast;

use crate::error::WebhookError;

/// Broadcast hub carrying engine-side errors to subscribers.
///
/// `post` never blocks and never fails: if there are no subscribers, or a
/// subscriber is too slow to keep up, the error is simply dropped (oldest
/// first) rather than backpressuring the producer.
pub struct ErrorHub {
    tx: broadcast::Sender<WebhookError>,
}

impl ErrorHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Post an error to the hub. Never blocks.
    pub fn post(&self, error: WebhookError) {
        tracing::warn!(error = %error, "webhook dispatch engine error");
        // No receivers is not an error condition for a sliding hub: the
        // error is just dropped, matching "subscribers unaware of the feed
        // see silent degradation" (SPEC_FULL §7).
        let _ = self.tx.send(error);
    }

    /// Subscribe to the live error feed. Subscribers that lag behind the
    /// sliding buffer's capacity silently miss older errors rather than
    /// stalling the hub; callers that want to observe this can match on
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<WebhookError> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn post_without_subscribers_does_not_block_or_panic() {
        let hub = ErrorHub::new(4);
        hub.post(WebhookError::MissingWebhook(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn subscriber_receives_posted_errors() {
        let hub = ErrorHub::new(4);
        let mut rx = hub.subscribe();
        let id = Uuid::new_v4();
        hub.post(WebhookError::MissingWebhook(id));
        match rx.recv().await.unwrap() {
            WebhookError::MissingWebhook(got) => assert_eq!(got, id),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_producer() {
        let hub = ErrorHub::new(2);
        let mut rx = hub.subscribe();
        // Overflow the sliding buffer without the subscriber reading.
        for _ in 0..10 {
            hub.post(WebhookError::MissingWebhook(Uuid::new_v4()));
        }
        // The subscriber observes a lag rather than the producer blocking.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected Lagged, got {other:?}"),
        }
    }
}
