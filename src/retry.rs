//! Retry subsystem: one supervised retry loop per webhook currently in the
//! `Retrying` in-memory state.
//!
//! Grounded on the teacher's `run_sender` shape (`dwctl/src/webhooks/dispatcher.rs`):
//! a channel-fed task with a `CancellationToken` for clean shutdown, and on
//! `fusillade`'s habit of tying timer tasks to a child cancellation token so
//! a cancelled parent never leaves orphan sleepers. Driven here by
//! [`crate::state::StateChange::ToRetrying`] notifications rather than a
//! direct channel, since any number of webhooks can enter `Retrying`
//! independently over the engine's lifetime.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::dispatcher::Dispatcher;
use crate::http_client::WebhookHttpClient;
use crate::repo::{WebhookEventRepo, WebhookRepo};
use crate::state::{StateChange, WebhookState};
use crate::types::{Retry, WebhookDispatch, WebhookEventStatus, WebhookId, WebhookStatus};

/// Listen for `ToRetrying` state changes and spawn a supervised retry loop
/// for each one, until `shutdown` fires.
///
/// `changes` must come from a subscription taken out *before* anything else
/// can publish a `ToRetrying` change (recovery in particular) — a broadcast
/// receiver only observes changes sent after it subscribes, so the caller
/// subscribes synchronously and hands the receiver in here rather than this
/// function subscribing itself once its task happens to be scheduled.
pub async fn run_retry_subsystem<H: WebhookHttpClient + 'static, WR: WebhookRepo + 'static, ER: WebhookEventRepo + 'static>(
    dispatcher: Arc<Dispatcher<H, WR, ER>>,
    config: RetryConfig,
    shutdown: CancellationToken,
    mut changes: broadcast::Receiver<StateChange>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!("retry subsystem received shutdown");
                break;
            }
            change = changes.recv() => {
                match change {
                    Ok(StateChange::ToRetrying(webhook_id, dispatch_rx_holder)) => {
                        let dispatch_rx = dispatch_rx_holder.lock().take();
                        if let Some(dispatch_rx) = dispatch_rx {
                            spawn_retry_loop(dispatcher.clone(), webhook_id, dispatch_rx, config, shutdown.child_token());
                        }
                    }
                    Ok(StateChange::Shutdown) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "retry subsystem lagged behind state changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Supervise a single webhook's retry loop: run it with a total time budget,
/// and apply the recovered/exhausted outcome once it settles.
fn spawn_retry_loop<H: WebhookHttpClient + 'static, WR: WebhookRepo + 'static, ER: WebhookEventRepo + 'static>(
    dispatcher: Arc<Dispatcher<H, WR, ER>>,
    webhook_id: WebhookId,
    dispatch_rx: mpsc::Receiver<WebhookDispatch>,
    config: RetryConfig,
    loop_cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = tokio::time::timeout(
            config.timeout,
            run_one_webhook_retry_loop(dispatcher.clone(), webhook_id, dispatch_rx, config, loop_cancel.clone()),
        )
        .await;

        match result {
            Err(_elapsed) => {
                tracing::warn!(webhook_id = %webhook_id, "webhook retry budget exhausted, marking unavailable");
                // Cancels every in-flight backoff timer and feeder this loop spawned.
                loop_cancel.cancel();
                let now = chrono::Utc::now();
                if let Err(e) = dispatcher.webhooks_repo().set_webhook_status(webhook_id, WebhookStatus::Unavailable { since: now }).await {
                    dispatcher.errors().post(e);
                }
                if let Err(e) = dispatcher.events_repo().set_all_as_failed_by_webhook_id(webhook_id).await {
                    dispatcher.errors().post(e);
                }
                dispatcher.state().update_webhook_state(webhook_id, WebhookState::Unavailable);
            }
            // The loop's own success path already transitioned the webhook
            // back to Enabled via `Dispatcher::maybe_close_retrying`.
            Ok(true) => {
                tracing::debug!(webhook_id = %webhook_id, "webhook retry loop drained, recovered");
            }
            // Cancelled by shutdown before draining; nothing further to
            // persist here, the process is already tearing down.
            Ok(false) => {
                tracing::debug!(webhook_id = %webhook_id, "webhook retry loop cancelled before draining");
            }
        }
    });
}

/// One attempt's outcome, as observed by the worker loop.
enum RetryStep {
    /// Delivered. `closed` reports whether this was the last outstanding
    /// retry for the webhook (it has been flipped back to `Enabled`).
    Delivered { closed: bool },
    /// The loop was cancelled from outside (timeout/shutdown) mid-attempt.
    Cancelled,
}

/// The feeder + worker pair for a single webhook's retry pipeline. Returns
/// `true` if the loop ran to completion (the state's retry map emptied and
/// the webhook is back to `Enabled`), `false` if it was cancelled from
/// outside before that point (SPEC_FULL §4.5: "the worker runs until the
/// state's `retries` map is empty").
async fn run_one_webhook_retry_loop<H: WebhookHttpClient + 'static, WR: WebhookRepo + 'static, ER: WebhookEventRepo + 'static>(
    dispatcher: Arc<Dispatcher<H, WR, ER>>,
    webhook_id: WebhookId,
    mut dispatch_rx: mpsc::Receiver<WebhookDispatch>,
    config: RetryConfig,
    loop_cancel: CancellationToken,
) -> bool {
    // Capacity 1 tightly couples feeder and worker: only one attempt for
    // this webhook is ever in flight at a time.
    let (retry_tx, mut retry_rx) = mpsc::channel::<Retry>(1);

    let feeder = {
        let state = dispatcher.state().clone();
        let feeder_cancel = loop_cancel.clone();
        tokio::spawn(async move {
            loop {
                let dispatch = tokio::select! {
                    biased;
                    _ = feeder_cancel.cancelled() => break,
                    maybe = dispatch_rx.recv() => match maybe {
                        Some(dispatch) => dispatch,
                        None => break,
                    },
                };
                let retry = Retry::first(dispatch, config.exponential_base, config.exponential_factor);
                // Register before offering: the map entry must exist before
                // the worker can observe this retry as in flight.
                state.set_retry(webhook_id, retry.dispatch.id, retry.clone());
                if retry_tx.send(retry).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut drained = false;
    while let Some(retry) = retry_rx.recv().await {
        match run_retry_to_completion(&dispatcher, webhook_id, retry, &loop_cancel).await {
            RetryStep::Cancelled => break,
            RetryStep::Delivered { closed } => {
                if closed {
                    drained = true;
                    break;
                }
            }
        }
    }

    // The feeder only stops on its own when `loop_cancel` fires; once this
    // worker has decided to stop (drained or cancelled) it must not be left
    // blocked on `dispatch_rx.recv()` waiting for a queue nobody drains
    // anymore.
    feeder.abort();
    drained
}

/// Drive a single dispatch through attempts until it is delivered or the
/// loop is cancelled (timeout/shutdown). Ordering across a webhook's
/// backlog is preserved because the worker never pulls the next item off
/// `retry_queue` until this returns.
async fn run_retry_to_completion<H: WebhookHttpClient + 'static, WR: WebhookRepo + 'static, ER: WebhookEventRepo + 'static>(
    dispatcher: &Arc<Dispatcher<H, WR, ER>>,
    webhook_id: WebhookId,
    mut retry: Retry,
    loop_cancel: &CancellationToken,
) -> RetryStep {
    loop {
        if loop_cancel.is_cancelled() {
            return RetryStep::Cancelled;
        }

        let outcome = dispatcher.attempt(&retry.dispatch).await;

        match outcome {
            Ok(response) if response.is_success() => {
                if let Err(e) = dispatcher
                    .events_repo()
                    .set_event_status_many(&retry.dispatch.keys(), WebhookEventStatus::Delivered)
                    .await
                {
                    dispatcher.errors().post(e);
                }
                dispatcher.state().remove_retry(webhook_id, retry.dispatch.id);
                let closed = dispatcher.maybe_close_retrying(webhook_id).await;
                tracing::debug!(webhook_id = %webhook_id, dispatch_id = retry.dispatch.id, closed, "retry delivered");
                return RetryStep::Delivered { closed };
            }
            Ok(response) => {
                dispatcher.errors().post(crate::error::WebhookError::HttpClient(format!(
                    "webhook {} responded {} on retry attempt {}",
                    webhook_id, response.status_code, retry.attempt
                )));
            }
            Err(e) => {
                dispatcher.errors().post(e);
            }
        }

        let next = retry.next();
        dispatcher.state().set_retry(webhook_id, next.dispatch.id, next.clone());
        let backoff = next.backoff.unwrap_or_default();

        if !wait_backoff(backoff, loop_cancel).await {
            return RetryStep::Cancelled;
        }
        retry = next;
    }
}

/// Run the backoff delay as its own detached task, tied to a child of the
/// retry loop's cancellation token, so a timed-out or completed loop never
/// leaves an orphan sleeper. Returns `false` if cancelled before the delay
/// elapsed.
async fn wait_backoff(backoff: std::time::Duration, loop_cancel: &CancellationToken) -> bool {
    let timer_cancel = loop_cancel.child_token();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        tokio::select! {
            _ = timer_cancel.cancelled() => {}
            _ = tokio::time::sleep(backoff) => {
                let _ = done_tx.send(());
            }
        }
    });

    tokio::select! {
        _ = loop_cancel.cancelled() => false,
        result = done_rx => result.is_ok(),
    }
}
