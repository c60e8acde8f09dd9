//! # Connection Manager
//!
//! Owns the single broker connection and its channel. A fatal close clears the
//! handle and starts the reconnect loop:
//!
//! 1. the first reconnect attempt runs immediately
//! 2. each failed attempt increments the retry counter; once the counter
//!    reaches the configured ceiling a [`FatalError::ReconnectExhausted`] is
//!    reported and no further attempt is made
//! 3. otherwise the next attempt is scheduled after the current backoff, and
//!    the backoff is multiplied by a random factor in `[0, 2.5)` rounded up to
//!    whole seconds
//! 4. a successful connect resets counter and backoff to their base values
//!
//! Application-requested closes are terminal. [`ConnectionManager::stop`]
//! cancels every pending reconnect timer.

use super::channel::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerSession, CloseReason, QueueMessage,
};
use crate::config::ReconnectConfig;
use crate::constants::system;
use crate::error::{FatalError, ProvisionerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source of uniformly distributed values in `[0, 1)`
pub trait RandomSource: Send + Sync + 'static {
    fn next_f64(&self) -> f64;
}

/// Default [`RandomSource`] backed by `fastrand`
#[derive(Debug, Default, Clone, Copy)]
pub struct FastRandSource;

impl RandomSource for FastRandSource {
    fn next_f64(&self) -> f64 {
        fastrand::f64()
    }
}

/// Result of recording one failed reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Try again after `delay`; `attempt` is the number of failures so far
    Retry { attempt: u32, delay: Duration },
    /// Retry ceiling reached
    Exhausted { attempts: u32 },
}

/// Retry counter and randomized backoff duration
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempts: 0,
            current: base,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_backoff, config.max_attempts)
    }

    pub fn record_failure(&mut self, random: &dyn RandomSource) -> BackoffDecision {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return BackoffDecision::Exhausted {
                attempts: self.attempts,
            };
        }

        let delay = self.current;
        let factor = random.next_f64() * system::RECONNECT_BACKOFF_MAX_FACTOR;
        self.current = Duration::from_secs((delay.as_secs_f64() * factor).ceil() as u64);

        BackoffDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.base;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_backoff(&self) -> Duration {
        self.current
    }
}

struct ConnectionState {
    connection: Option<Arc<dyn BrokerConnection>>,
    backoff: ReconnectBackoff,
    tasks: Vec<JoinHandle<()>>,
}

/// Owner of the broker connection and the reconnect state machine
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    random: Arc<dyn RandomSource>,
    state: Mutex<ConnectionState>,
    fatal_tx: mpsc::UnboundedSender<FatalError>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionManager")
            .field("connected", &state.connection.is_some())
            .field("attempts", &state.backoff.attempts())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        random: Arc<dyn RandomSource>,
        reconnect: &ReconnectConfig,
        fatal_tx: mpsc::UnboundedSender<FatalError>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            random,
            state: Mutex::new(ConnectionState {
                connection: None,
                backoff: ReconnectBackoff::from_config(reconnect),
                tasks: Vec::new(),
            }),
            fatal_tx,
            stopped: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Establish the initial connection
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        debug!("Trying to connect to broker");
        let session = self.connector.connect().await?;
        if let Some(rejected) = self.install(session) {
            close_rejected(rejected).await;
            return Err(ProvisionerError::connect("connection manager is stopped"));
        }
        info!("Connected to broker");
        Ok(())
    }

    /// Adopt a fresh session and watch it for closes. A stopped manager keeps
    /// nothing and hands the connection back to be closed.
    #[must_use]
    fn install(self: &Arc<Self>, session: BrokerSession) -> Option<Arc<dyn BrokerConnection>> {
        let BrokerSession {
            connection,
            mut close_events,
        } = session;

        let mut state = self.state.lock();
        // stop() flips the flag before taking this lock
        if self.is_stopped() {
            return Some(connection);
        }
        state.connection = Some(connection);
        state.backoff.reset();

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => {}
                reason = close_events.recv() => match reason {
                    Some(reason) if reason.is_fatal() => {
                        warn!(error = %reason.message(), "Connection error with broker, attempting reconnect");
                        manager.state.lock().connection = None;
                        manager
                            .reconnect(ProvisionerError::fatal_disconnect(reason.message()))
                            .await;
                    }
                    Some(reason) => {
                        info!(reason = %reason.message(), "Broker connection closed");
                        manager.state.lock().connection = None;
                    }
                    None => debug!("Broker close notifications ended"),
                },
            }
        });

        state.tasks.retain(|task| !task.is_finished());
        state.tasks.push(watcher);
        None
    }

    async fn reconnect(self: Arc<Self>, cause: ProvisionerError) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if self.is_stopped() {
                return;
            }

            let last_error = match self.connector.connect().await {
                Ok(session) => {
                    match self.install(session) {
                        Some(rejected) => close_rejected(rejected).await,
                        None => info!(cause = %cause, "Successfully reconnected to broker"),
                    }
                    return;
                }
                Err(err) => err,
            };

            let decision = self.state.lock().backoff.record_failure(self.random.as_ref());
            match decision {
                BackoffDecision::Exhausted { attempts } => {
                    error!(
                        attempts,
                        cause = %cause,
                        error = %last_error,
                        "Connection error not recovered after retries"
                    );
                    let _ = self.fatal_tx.send(FatalError::ReconnectExhausted {
                        attempts,
                        cause,
                        last_error,
                    });
                    return;
                }
                BackoffDecision::Retry { attempt, delay } => {
                    warn!(
                        attempt,
                        backoff_seconds = delay.as_secs(),
                        error = %last_error,
                        "Could not reconnect to broker, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Cancel pending reconnects and close the connection; idempotent
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let connection = {
            let mut state = self.state.lock();
            for task in state.tasks.drain(..) {
                task.abort();
            }
            state.connection.take()
        };

        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                warn!(error = %err, "Error while closing broker connection");
            }
        }
        info!("Broker connection stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().backoff.attempts()
    }

    pub fn current_backoff(&self) -> Duration {
        self.state.lock().backoff.current_backoff()
    }

    fn current_channel(&self, queue: &str, operation: &str) -> Result<Arc<dyn BrokerChannel>> {
        self.state
            .lock()
            .connection
            .as_ref()
            .map(|connection| connection.channel())
            .ok_or_else(|| ProvisionerError::channel(queue, operation, "not connected to broker"))
    }
}

async fn close_rejected(connection: Arc<dyn BrokerConnection>) {
    debug!("Connection manager stopped, closing new broker connection");
    if let Err(err) = connection.close().await {
        warn!(error = %err, "Error while closing broker connection");
    }
}

#[async_trait]
impl BrokerChannel for ConnectionManager {
    async fn assert_queue(&self, queue: &str) -> Result<()> {
        self.current_channel(queue, "assert_queue")?
            .assert_queue(queue)
            .await
    }

    async fn get_one_message(&self, queue: &str) -> Result<Option<QueueMessage>> {
        self.current_channel(queue, "get")?
            .get_one_message(queue)
            .await
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        self.current_channel(&message.queue, "ack")?
            .ack(message)
            .await
    }

    async fn nack(&self, message: &QueueMessage, requeue: bool) -> Result<()> {
        self.current_channel(&message.queue, "nack")?
            .nack(message, requeue)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::in_memory::InMemoryConnector;
    use std::sync::atomic::AtomicUsize;

    /// Cycles through a fixed list of values
    struct ScriptedRandom {
        values: Vec<f64>,
        index: AtomicUsize,
    }

    impl ScriptedRandom {
        fn new(values: Vec<f64>) -> Self {
            Self {
                values,
                index: AtomicUsize::new(0),
            }
        }
    }

    impl RandomSource for ScriptedRandom {
        fn next_f64(&self) -> f64 {
            let i = self.index.fetch_add(1, Ordering::SeqCst);
            self.values[i % self.values.len()]
        }
    }

    fn reconnect_config(base_secs: u64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            base_backoff: Duration::from_secs(base_secs),
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_sequence_with_scripted_random() {
        let random = ScriptedRandom::new(vec![0.8, 0.5, 0.0]);
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(10), 5);

        // 10 * 0.8 * 2.5 = 20
        assert_eq!(
            backoff.record_failure(&random),
            BackoffDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
        // 20 * 0.5 * 2.5 = 25
        assert_eq!(
            backoff.record_failure(&random),
            BackoffDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(20)
            }
        );
        assert_eq!(
            backoff.record_failure(&random),
            BackoffDecision::Retry {
                attempt: 3,
                delay: Duration::from_secs(25)
            }
        );
        assert_eq!(backoff.current_backoff(), Duration::ZERO);
    }

    #[test]
    fn test_backoff_rounds_up() {
        let random = ScriptedRandom::new(vec![0.01]);
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(10), 5);
        backoff.record_failure(&random);
        // 10 * 0.025 = 0.25 -> 1
        assert_eq!(backoff.current_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_exhausts_at_ceiling_and_resets() {
        let random = ScriptedRandom::new(vec![0.5]);
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(2), 3);

        assert!(matches!(backoff.record_failure(&random), BackoffDecision::Retry { .. }));
        assert!(matches!(backoff.record_failure(&random), BackoffDecision::Retry { .. }));
        assert_eq!(
            backoff.record_failure(&random),
            BackoffDecision::Exhausted { attempts: 3 }
        );

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_reports_fatal_after_ceiling() {
        let connector = Arc::new(InMemoryConnector::default());
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            connector.clone(),
            Arc::new(ScriptedRandom::new(vec![0.5])),
            &reconnect_config(1, 5),
            fatal_tx,
        );
        manager.connect().await.unwrap();
        assert_eq!(connector.connect_calls(), 1);

        connector.always_fail(true);
        connector.drop_connection(CloseReason::Fatal("heartbeat timeout".into()));

        let fatal = fatal_rx.recv().await.unwrap();
        assert!(matches!(
            fatal,
            FatalError::ReconnectExhausted {
                attempts: 5,
                cause: ProvisionerError::FatalDisconnect { ref message },
                last_error: ProvisionerError::Connect { .. },
            } if message == "heartbeat timeout"
        ));
        assert_eq!(connector.connect_calls(), 1 + 5);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(connector.connect_calls(), 1 + 5);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_resets_backoff() {
        let connector = Arc::new(InMemoryConnector::default());
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            connector.clone(),
            Arc::new(ScriptedRandom::new(vec![0.9])),
            &reconnect_config(10, 5),
            fatal_tx,
        );
        manager.connect().await.unwrap();

        connector.fail_next(3);
        connector.drop_connection(CloseReason::Fatal("CONNECTION_FORCED".into()));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(manager.is_connected());
        assert_eq!(connector.connect_calls(), 1 + 4);
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_secs(10));
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_close_does_not_reconnect() {
        let connector = Arc::new(InMemoryConnector::default());
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            connector.clone(),
            Arc::new(FastRandSource),
            &reconnect_config(1, 5),
            fatal_tx,
        );
        manager.connect().await.unwrap();

        connector.drop_connection(CloseReason::Requested("shutdown".into()));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!manager.is_connected());
        assert_eq!(connector.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reconnect() {
        let connector = Arc::new(InMemoryConnector::default());
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            connector.clone(),
            Arc::new(ScriptedRandom::new(vec![0.5])),
            &reconnect_config(30, 5),
            fatal_tx,
        );
        manager.connect().await.unwrap();

        connector.always_fail(true);
        connector.drop_connection(CloseReason::Fatal("socket closed".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let calls = connector.connect_calls();

        manager.stop().await;
        manager.stop().await;
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(connector.connect_calls(), calls);
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_arriving_after_stop_is_discarded() {
        let connector = Arc::new(InMemoryConnector::default());
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            connector.clone(),
            Arc::new(FastRandSource),
            &reconnect_config(1, 5),
            fatal_tx,
        );
        manager.stop().await;

        // A connect that was already in flight when stop() ran
        let session = connector.connect().await.unwrap();
        assert!(manager.install(session).is_some());
        assert!(!manager.is_connected());
        assert!(manager.state.lock().tasks.is_empty());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ProvisionerError::Connect { .. }));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_channel_operations_fail_when_disconnected() {
        let connector = Arc::new(InMemoryConnector::default());
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            connector,
            Arc::new(FastRandSource),
            &reconnect_config(1, 5),
            fatal_tx,
        );

        let err = manager.assert_queue("orders").await.unwrap_err();
        assert!(matches!(err, ProvisionerError::Channel { .. }));
    }
}
