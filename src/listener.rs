//! # Queue Listeners
//!
//! One [`QueuePoller`] per configured alias. Each poll asks admission control
//! first, pulls at most one message, hands it to the dispatcher and settles it:
//! ack plus an immediate re-poll on success, nack with the configured requeue
//! policy on failure.
//!
//! [`ListenerRegistry::rebuild`] replaces the whole set of pollers. Queue
//! declarations for every alias must succeed before any poller starts; a
//! single failed declaration abandons the rebuild. Polls already in flight
//! when a rebuild or shutdown happens run to completion, but no new tick or
//! re-poll starts afterwards.

use crate::admission::CapacityCheck;
use crate::error::{ProvisionerError, Result};
use crate::events::{EventPublisher, ProcessedMessage};
use crate::messaging::{BrokerChannel, QueueMessage};
use crate::orchestration::JobReceipt;
use crate::reconciler::ConfigSet;
use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Turns one pulled message into a job
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, alias: &str, message: &QueueMessage) -> Result<JobReceipt>;
}

/// What a single poll did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Poller belongs to a superseded listener set
    Cancelled,
    /// Admission refused; nothing pulled
    Busy,
    Empty,
    /// Message dispatched and acked
    Dispatched(JobReceipt),
    /// Dispatch failed; message nacked
    Rejected,
    /// Broker get failed
    Failed,
}

/// Counters for one poller
#[derive(Debug, Default)]
pub struct PollerStats {
    pub polls: AtomicU64,
    pub busy_skips: AtomicU64,
    pub dispatched: AtomicU64,
    pub rejected: AtomicU64,
}

/// Polls one queue
pub struct QueuePoller {
    alias: String,
    channel: Arc<dyn BrokerChannel>,
    dispatcher: Arc<dyn MessageDispatcher>,
    admission: Arc<dyn CapacityCheck>,
    publisher: EventPublisher,
    requeue_on_failure: bool,
    cancelled: Arc<AtomicBool>,
    stats: PollerStats,
}

impl std::fmt::Debug for QueuePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePoller")
            .field("alias", &self.alias)
            .field("requeue_on_failure", &self.requeue_on_failure)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

impl QueuePoller {
    pub fn new(
        alias: impl Into<String>,
        channel: Arc<dyn BrokerChannel>,
        dispatcher: Arc<dyn MessageDispatcher>,
        admission: Arc<dyn CapacityCheck>,
        publisher: EventPublisher,
        requeue_on_failure: bool,
    ) -> Self {
        Self {
            alias: alias.into(),
            channel,
            dispatcher,
            admission,
            publisher,
            requeue_on_failure,
            cancelled: Arc::new(AtomicBool::new(false)),
            stats: PollerStats::default(),
        }
    }

    fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Ask admission, pull at most one message and dispatch it.
    ///
    /// A successful dispatch schedules another poll for the same alias in the
    /// background.
    pub fn poll_once(self: Arc<Self>) -> BoxFuture<'static, PollOutcome> {
        async move {
            if self.is_cancelled() {
                return PollOutcome::Cancelled;
            }
            self.stats.polls.fetch_add(1, Ordering::Relaxed);
            debug!(queue = %self.alias, "Checking for new messages in queue");

            let state = self.admission.check_capacity(&self.alias).await;
            if state.busy {
                self.stats.busy_skips.fetch_add(1, Ordering::Relaxed);
                info!(
                    queue = %self.alias,
                    active = state.active,
                    state = %state.state,
                    "Max parallelism reached. Queue busy"
                );
                return PollOutcome::Busy;
            }

            let message = match self.channel.get_one_message(&self.alias).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(queue = %self.alias, "No new messages in queue");
                    return PollOutcome::Empty;
                }
                Err(err) => {
                    error!(queue = %self.alias, error = %err, "Could not get message from queue");
                    return PollOutcome::Failed;
                }
            };

            self.consume(message).await
        }
        .boxed()
    }

    async fn consume(self: Arc<Self>, message: QueueMessage) -> PollOutcome {
        match self.dispatcher.dispatch(&self.alias, &message).await {
            Ok(receipt) => {
                if let Err(err) = self.channel.ack(&message).await {
                    error!(queue = %self.alias, error = %err, "Could not acknowledge message");
                }
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                self.publisher
                    .publish_processed(ProcessedMessage::succeeded(&self.alias, &receipt.job));
                info!(
                    queue = %self.alias,
                    job = %receipt.job,
                    "Successfully dispatched message from queue"
                );

                if !self.is_cancelled() {
                    tokio::spawn(self.clone().poll_once());
                }
                PollOutcome::Dispatched(receipt)
            }
            Err(err) => {
                error!(
                    queue = %self.alias,
                    error = %err,
                    requeue = self.requeue_on_failure,
                    "Error while trying to dispatch message from queue"
                );
                if let Err(nack_err) = self.channel.nack(&message, self.requeue_on_failure).await {
                    error!(queue = %self.alias, error = %nack_err, "Could not reject message");
                }
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                self.publisher
                    .publish_processed(ProcessedMessage::failed(&self.alias, err));
                PollOutcome::Rejected
            }
        }
    }
}

struct ListenerGeneration {
    shutdown_tx: watch::Sender<bool>,
    cancelled: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    aliases: BTreeSet<String>,
}

impl ListenerGeneration {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        drop(self.tasks);
    }
}

/// Owns the active set of queue pollers
pub struct ListenerRegistry {
    channel: Arc<dyn BrokerChannel>,
    publisher: EventPublisher,
    requeue_on_failure: bool,
    current: Mutex<Option<ListenerGeneration>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("requeue_on_failure", &self.requeue_on_failure)
            .finish_non_exhaustive()
    }
}

impl ListenerRegistry {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        publisher: EventPublisher,
        requeue_on_failure: bool,
    ) -> Self {
        Self {
            channel,
            publisher,
            requeue_on_failure,
            current: Mutex::new(None),
        }
    }

    /// Replace all pollers with one per spec in `specs`
    pub async fn rebuild(
        &self,
        specs: &ConfigSet,
        dispatcher: Arc<dyn MessageDispatcher>,
        admission: Arc<dyn CapacityCheck>,
    ) -> Result<()> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            previous.cancel();
        }

        let aliases: BTreeSet<String> = specs.keys().cloned().collect();
        info!(queues = ?aliases, "Ensuring queues exist");

        try_join_all(aliases.iter().map(|alias| async move {
            self.channel.assert_queue(alias).await.map_err(|err| match err {
                ProvisionerError::QueueDeclare { .. } => err,
                other => ProvisionerError::queue_declare(alias, other.to_string()),
            })
        }))
        .await?;

        let (shutdown_tx, _) = watch::channel(false);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(specs.len());

        for alias in &aliases {
            let Some(spec) = specs.get(alias) else {
                continue;
            };
            let poller = Arc::new(
                QueuePoller::new(
                    alias.clone(),
                    self.channel.clone(),
                    dispatcher.clone(),
                    admission.clone(),
                    self.publisher.clone(),
                    self.requeue_on_failure,
                )
                .with_cancellation(cancelled.clone()),
            );

            let period = if spec.interval < MIN_POLL_INTERVAL {
                warn!(
                    queue = %alias,
                    interval_ms = spec.interval_ms(),
                    "Poll interval too small, using 1s"
                );
                MIN_POLL_INTERVAL
            } else {
                spec.interval
            };

            tasks.push(tokio::spawn(run_poller(poller, period, shutdown_tx.subscribe())));
        }

        debug!(listeners = tasks.len(), "Queue listeners started");
        *current = Some(ListenerGeneration {
            shutdown_tx,
            cancelled,
            tasks,
            aliases,
        });
        Ok(())
    }

    /// Aliases with a running poller
    pub async fn active_aliases(&self) -> BTreeSet<String> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|generation| generation.aliases.clone())
            .unwrap_or_default()
    }

    /// Stop every poller
    pub async fn shutdown(&self) {
        if let Some(generation) = self.current.lock().await.take() {
            info!(queues = generation.aliases.len(), "Stopping queue listeners");
            generation.cancel();
        }
    }
}

/// Immediate first poll, then one poll per `period` until shutdown
async fn run_poller(
    poller: Arc<QueuePoller>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if poller.clone().poll_once().await == PollOutcome::Cancelled {
                    break;
                }
            }
        }
    }
    let stats = poller.stats();
    debug!(
        queue = %poller.alias(),
        polls = stats.polls.load(Ordering::Relaxed),
        busy_skips = stats.busy_skips.load(Ordering::Relaxed),
        dispatched = stats.dispatched.load(Ordering::Relaxed),
        rejected = stats.rejected.load(Ordering::Relaxed),
        "Queue poller stopped"
    );
}
