//! Engine facade: wires Internal State, the error hub, recovery, the
//! new-event subscription, the optional batching stage, and the retry
//! subsystem into the three public operations SPEC_FULL §6 describes:
//! `start`, `shutdown`, `get_errors`.
//!
//! Grounded on `InMemoryRequestManager::run` in the teacher's
//! `batcher/src/manager/in_memory.rs`: a struct holding the shared
//! collaborators plus a `JoinHandle`/`CancellationToken` pair, spawned once
//! from a constructor-like entry point and torn down cooperatively.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batching::run_batching_stage;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, WebhookError};
use crate::error_hub::ErrorHub;
use crate::http_client::WebhookHttpClient;
use crate::latch::CountDownLatch;
use crate::recovery::recover;
use crate::repo::{WebhookEventRepo, WebhookRepo};
use crate::retry::run_retry_subsystem;
use crate::state::InternalState;
use crate::subscription::run_subscription_stage;
use crate::types::{Webhook, WebhookDispatch};

/// The reliable-dispatch engine. Owns the internal state cell, the error
/// hub, and the handles of every long-running task it has spawned.
pub struct Engine<H: WebhookHttpClient + 'static, WR: WebhookRepo + 'static, ER: WebhookEventRepo + 'static> {
    dispatcher: Arc<Dispatcher<H, WR, ER>>,
    config: EngineConfig,
    shutdown: CancellationToken,
    startup_latch: Arc<CountDownLatch>,
    shutdown_latch: Arc<CountDownLatch>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<H: WebhookHttpClient + 'static, WR: WebhookRepo + 'static, ER: WebhookEventRepo + 'static> Engine<H, WR, ER> {
    pub fn new(http_client: Arc<H>, webhooks: Arc<WR>, events: Arc<ER>, config: EngineConfig) -> Self {
        let state = Arc::new(InternalState::new());
        let errors = Arc::new(ErrorHub::new(config.error_sliding_capacity));
        let dispatcher = Arc::new(Dispatcher::new(http_client, webhooks, events, state, errors, config.retry.capacity));

        let shutdown_latch_count = 1 + usize::from(config.batching.is_some());
        Self {
            dispatcher,
            config,
            shutdown: CancellationToken::new(),
            startup_latch: Arc::new(CountDownLatch::new(1)),
            shutdown_latch: Arc::new(CountDownLatch::new(shutdown_latch_count)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the retry subsystem, recover stale `Delivering` events, then
    /// spawn the subscription and optional batching stage. Returns once the
    /// new-event subscription has initialized — callers may then safely
    /// push events into the event repo.
    ///
    /// The retry subsystem must subscribe to state changes *before*
    /// recovery runs: recovery drives webhooks straight into `Retrying` via
    /// the same `StateChange::ToRetrying` broadcast the dispatcher uses, and
    /// a broadcast channel only delivers to receivers that already exist —
    /// a late subscriber would silently miss recovered webhooks.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let state_changes = self.dispatcher.state().subscribe();
        let retry_task = tokio::spawn(run_retry_subsystem(
            self.dispatcher.clone(),
            self.config.retry,
            self.shutdown.clone(),
            state_changes,
        ));
        self.tasks.lock().push(retry_task);

        recover(
            self.dispatcher.webhooks_repo(),
            self.dispatcher.events_repo(),
            self.dispatcher.state(),
            self.dispatcher.errors(),
            self.config.retry.capacity,
        )
        .await;

        let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel::<(Webhook, WebhookDispatch)>(
            self.config.batching.map(|b| b.capacity).unwrap_or(1024),
        );

        let batching_tx = if let Some(batching_config) = self.config.batching {
            let (batching_tx, batching_rx) = tokio::sync::mpsc::channel(batching_config.capacity);
            let task = tokio::spawn(run_batching_stage(
                batching_rx,
                dispatch_tx.clone(),
                batching_config,
                self.shutdown.clone(),
                self.shutdown_latch.clone(),
            ));
            self.tasks.lock().push(task);
            Some(batching_tx)
        } else {
            None
        };

        let subscription_task = tokio::spawn(run_subscription_stage(
            self.dispatcher.webhooks_repo().clone(),
            self.dispatcher.events_repo().clone(),
            self.dispatcher.errors().clone(),
            batching_tx,
            dispatch_tx,
            self.shutdown.clone(),
            self.startup_latch.clone(),
            self.shutdown_latch.clone(),
        ));
        self.tasks.lock().push(subscription_task);

        let dispatch_fanout_task = tokio::spawn(run_dispatch_fanout(self.dispatcher.clone(), dispatch_rx));
        self.tasks.lock().push(dispatch_fanout_task);

        self.startup_latch.wait().await;
        tracing::info!("dispatch engine started");
        Ok(())
    }

    /// Set the shutdown flag (monotonic, SPEC_FULL §3.5) and await every
    /// long-running stage draining: in-flight HTTP attempts run to
    /// completion, partial batches are flushed once.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        self.dispatcher.state().shutdown();
        self.shutdown.cancel();
        self.shutdown_latch.wait().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    return Err(WebhookError::Repository(format!("engine task panicked during shutdown: {e}")));
                }
            }
        }

        tracing::info!("dispatch engine shut down");
        Ok(())
    }

    /// Subscribe to the live feed of engine-side errors.
    pub fn get_errors(&self) -> tokio::sync::broadcast::Receiver<WebhookError> {
        self.dispatcher.errors().subscribe()
    }
}

/// Fan the dispatcher out over however many single/batched dispatches the
/// subscription and batching stages hand it, one concurrent `deliver` per
/// dispatch. Bounded only by the shared `dispatch_rx` channel; each
/// individual delivery owns no further internal concurrency of its own.
async fn run_dispatch_fanout<H: WebhookHttpClient + 'static, WR: WebhookRepo + 'static, ER: WebhookEventRepo + 'static>(
    dispatcher: Arc<Dispatcher<H, WR, ER>>,
    mut dispatch_rx: tokio::sync::mpsc::Receiver<(Webhook, WebhookDispatch)>,
) {
    let mut inflight = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            maybe_item = dispatch_rx.recv() => {
                match maybe_item {
                    Some((webhook, dispatch)) => {
                        let dispatcher = dispatcher.clone();
                        inflight.spawn(async move {
                            dispatcher.deliver(&webhook, dispatch).await;
                        });
                    }
                    None => break,
                }
            }
            Some(result) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!("dispatch delivery task panicked");
                    }
                }
            }
        }
    }

    while inflight.join_next().await.is_some() {}
}
