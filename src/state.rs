//! Internal (in-memory) state: per-webhook dispatch/retry bookkeeping, the
//! shutdown flag, and a broadcast channel of changes.
//!
//! This is deliberately *not* the persisted [`WebhookStatus`](crate::types::WebhookStatus) —
//! it is the engine's private view of which webhooks currently have a retry
//! pipeline running. Modeled as a mutex-guarded struct plus a separate
//! broadcast channel for change notifications, so snapshot reads are never
//! conflated with subscription (SPEC_FULL §9).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::types::{DispatchId, Retry, WebhookDispatch, WebhookId};

/// In-memory state for a single webhook, distinct from its persisted
/// [`WebhookStatus`](crate::types::WebhookStatus).
pub enum WebhookState {
    /// Normal dispatching.
    Enabled,
    /// No dispatch.
    Disabled,
    /// At least one in-flight retry pipeline.
    Retrying(RetryingState),
    /// Terminal failure mode.
    Unavailable,
}

/// The data carried by a webhook in the `Retrying` state.
pub struct RetryingState {
    pub since: DateTime<Utc>,
    /// Feeds new dispatches into this webhook's retry loop.
    pub dispatch_tx: mpsc::Sender<WebhookDispatch>,
    /// In-flight retries, keyed by dispatch id.
    pub retries: HashMap<DispatchId, Retry>,
}

impl RetryingState {
    /// Invariant (SPEC_FULL §3.1): a webhook is `Retrying` iff its `retries`
    /// map is non-empty, or its dispatch queue can still produce items. The
    /// queue side of that is opaque here (a closed, drained channel is
    /// indistinguishable from one that merely has no items queued *yet*), so
    /// this only reflects the map half — callers drive the closing condition
    /// from the feeder/worker tasks observing their channel directly.
    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}

/// Outcome of [`InternalState::get_or_start_retrying`].
pub enum RetryQueueLookup {
    /// The webhook was already `Retrying`; here is its queue.
    Existing(mpsc::Sender<WebhookDispatch>),
    /// The webhook just transitioned into `Retrying`; here is its new queue.
    Created(mpsc::Sender<WebhookDispatch>),
    /// The webhook is `Disabled`/`Unavailable` in-memory and cannot retry.
    Blocked,
}

/// A change to the engine's internal state, published for subscribers.
#[derive(Clone)]
pub enum StateChange {
    /// The shutdown flag was set.
    Shutdown,
    /// A webhook just transitioned into `Retrying`; carries a receiver for
    /// its dispatch queue so the retry subsystem can spawn a loop for it.
    ToRetrying(WebhookId, Arc<Mutex<Option<mpsc::Receiver<WebhookDispatch>>>>),
}

struct Inner {
    is_shutdown: bool,
    webhook_state: HashMap<WebhookId, WebhookState>,
}

/// The engine's single shared cell of mutable state, paired with a broadcast
/// channel of [`StateChange`]s.
pub struct InternalState {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<StateChange>,
}

impl InternalState {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { inner: Mutex::new(Inner { is_shutdown: false, webhook_state: HashMap::new() }), changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().is_shutdown
    }

    /// Monotonic: once set, stays set (SPEC_FULL §3.5).
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.is_shutdown {
            return;
        }
        inner.is_shutdown = true;
        drop(inner);
        let _ = self.changes.send(StateChange::Shutdown);
    }

    pub fn update_webhook_state(&self, id: WebhookId, state: WebhookState) {
        self.inner.lock().webhook_state.insert(id, state);
    }

    /// Transition `id` into `Retrying`, creating its dispatch queue, and
    /// publish `ToRetrying` so the retry subsystem picks it up.
    pub fn transition_to_retrying(&self, id: WebhookId, capacity: usize) -> mpsc::Sender<WebhookDispatch> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity);
        let state = RetryingState { since: Utc::now(), dispatch_tx: dispatch_tx.clone(), retries: HashMap::new() };
        self.inner.lock().webhook_state.insert(id, WebhookState::Retrying(state));
        let _ = self
            .changes
            .send(StateChange::ToRetrying(id, Arc::new(Mutex::new(Some(dispatch_rx)))));
        dispatch_tx
    }

    /// Atomically get webhook `id`'s existing retry queue, or start one if
    /// it isn't currently tracked as `Retrying`/`Disabled`/`Unavailable`.
    /// Holds a single lock across the whole check-then-act so two concurrent
    /// callers for the same webhook can never both observe "no queue yet"
    /// and each create one (at most one retry loop per webhook).
    pub fn get_or_start_retrying(&self, id: WebhookId, capacity: usize) -> RetryQueueLookup {
        let mut inner = self.inner.lock();
        match inner.webhook_state.get(&id) {
            Some(WebhookState::Retrying(r)) => return RetryQueueLookup::Existing(r.dispatch_tx.clone()),
            Some(WebhookState::Disabled) | Some(WebhookState::Unavailable) => return RetryQueueLookup::Blocked,
            _ => {}
        }
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity);
        let state = RetryingState { since: Utc::now(), dispatch_tx: dispatch_tx.clone(), retries: HashMap::new() };
        inner.webhook_state.insert(id, WebhookState::Retrying(state));
        drop(inner);
        let _ = self
            .changes
            .send(StateChange::ToRetrying(id, Arc::new(Mutex::new(Some(dispatch_rx)))));
        RetryQueueLookup::Created(dispatch_tx)
    }

    /// Insert a retry into webhook `id`'s retry map. No-op if `id` is not
    /// currently `Retrying`.
    pub fn set_retry(&self, id: WebhookId, dispatch_id: DispatchId, retry: Retry) {
        let mut inner = self.inner.lock();
        if let Some(WebhookState::Retrying(r)) = inner.webhook_state.get_mut(&id) {
            r.retries.insert(dispatch_id, retry);
        }
    }

    /// Remove a retry from webhook `id`'s retry map. No-op if absent.
    pub fn remove_retry(&self, id: WebhookId, dispatch_id: DispatchId) {
        let mut inner = self.inner.lock();
        if let Some(WebhookState::Retrying(r)) = inner.webhook_state.get_mut(&id) {
            r.retries.remove(&dispatch_id);
        }
    }

    /// Whether webhook `id`'s retry map is currently empty (used by the
    /// retry worker to decide when to stop looping).
    pub fn retries_empty(&self, id: WebhookId) -> bool {
        match self.inner.lock().webhook_state.get(&id) {
            Some(WebhookState::Retrying(r)) => r.is_empty(),
            _ => true,
        }
    }

    /// Atomically check whether webhook `id`'s retry map is empty and, if
    /// so, transition it straight to `Enabled`. Returns whether it closed.
    /// A single lock hold here matters: checking and transitioning under
    /// separate locks leaves a window where a retry fed in between (and
    /// recorded in the about-to-be-discarded map) gets silently dropped.
    pub fn close_if_retries_empty(&self, id: WebhookId) -> bool {
        let mut inner = self.inner.lock();
        match inner.webhook_state.get(&id) {
            Some(WebhookState::Retrying(r)) if r.is_empty() => {
                inner.webhook_state.insert(id, WebhookState::Enabled);
                true
            }
            _ => false,
        }
    }

    /// Snapshot whether a webhook is currently tracked as `Retrying`
    /// (used by the dispatcher to decide whether to enqueue onto an
    /// existing queue or start a new retry pipeline).
    pub fn existing_retry_queue(&self, id: WebhookId) -> Option<mpsc::Sender<WebhookDispatch>> {
        match self.inner.lock().webhook_state.get(&id) {
            Some(WebhookState::Retrying(r)) => Some(r.dispatch_tx.clone()),
            _ => None,
        }
    }

    /// Whether the webhook is known to be `Disabled` or `Unavailable`
    /// in-memory (used by the dispatcher's race-detection branch).
    pub fn is_disabled_or_unavailable(&self, id: WebhookId) -> bool {
        matches!(
            self.inner.lock().webhook_state.get(&id),
            Some(WebhookState::Disabled) | Some(WebhookState::Unavailable)
        )
    }
}

impl Default for InternalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn shutdown_is_monotonic_and_idempotent() {
        let state = InternalState::new();
        assert!(!state.is_shutdown());
        state.shutdown();
        assert!(state.is_shutdown());
        state.shutdown();
        assert!(state.is_shutdown());
    }

    #[test]
    fn set_retry_is_noop_when_not_retrying() {
        let state = InternalState::new();
        let id = Uuid::new_v4();
        state.update_webhook_state(id, WebhookState::Enabled);
        // No panic, no effect: webhook isn't Retrying.
        state.remove_retry(id, 1);
        assert!(state.retries_empty(id));
    }

    #[tokio::test]
    async fn transition_to_retrying_publishes_change() {
        let state = InternalState::new();
        let id = Uuid::new_v4();
        let mut rx = state.subscribe();
        state.transition_to_retrying(id, 8);
        match rx.recv().await.unwrap() {
            StateChange::ToRetrying(got_id, _) => assert_eq!(got_id, id),
            _ => panic!("expected ToRetrying"),
        }
        assert!(state.existing_retry_queue(id).is_some());
    }

    #[test]
    fn get_or_start_retrying_returns_the_same_queue_on_repeated_calls() {
        let state = InternalState::new();
        let id = Uuid::new_v4();

        let first = match state.get_or_start_retrying(id, 8) {
            RetryQueueLookup::Created(tx) => tx,
            _ => panic!("expected Created on first call"),
        };
        let second = match state.get_or_start_retrying(id, 8) {
            RetryQueueLookup::Existing(tx) => tx,
            _ => panic!("expected Existing on second call"),
        };
        assert!(first.same_channel(&second));
    }

    #[test]
    fn get_or_start_retrying_is_blocked_for_disabled_webhooks() {
        let state = InternalState::new();
        let id = Uuid::new_v4();
        state.update_webhook_state(id, WebhookState::Disabled);
        assert!(matches!(state.get_or_start_retrying(id, 8), RetryQueueLookup::Blocked));
    }

    #[test]
    fn close_if_retries_empty_transitions_only_when_the_map_is_empty() {
        let state = InternalState::new();
        let id = Uuid::new_v4();
        state.transition_to_retrying(id, 8);
        state.set_retry(id, 1, Retry::first(test_dispatch(id), std::time::Duration::ZERO, 2));

        assert!(!state.close_if_retries_empty(id), "must not close with a retry still pending");

        state.remove_retry(id, 1);
        assert!(state.close_if_retries_empty(id));
        assert!(state.existing_retry_queue(id).is_none(), "webhook should no longer be Retrying");
    }

    fn test_dispatch(webhook_id: WebhookId) -> WebhookDispatch {
        use crate::types::{Webhook, WebhookDeliveryMode, WebhookEvent, WebhookEventKey, WebhookEventStatus, WebhookStatus};

        let webhook = Webhook {
            id: webhook_id,
            url: "https://example.test/hook".into(),
            label: "test".into(),
            status: WebhookStatus::Enabled,
            mode: WebhookDeliveryMode::at_least_once_single(),
        };
        let event = WebhookEvent {
            key: WebhookEventKey::new(webhook_id, Uuid::new_v4()),
            status: WebhookEventStatus::Delivering,
            payload: "{}".into(),
            headers: vec![],
        };
        WebhookDispatch::new(&webhook, vec![event])
    }
}
