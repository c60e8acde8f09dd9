//! # Provisioner
//!
//! Composition root wiring the connection manager, reconciler, admission
//! controller, dispatcher and listener registry together.
//!
//! Startup order:
//!
//! 1. connect to the broker (failure is returned to the caller)
//! 2. subscribe to provisioner events; every `Reloaded` rebuilds the listeners
//!    from the set it carries
//! 3. reconcile once; with reload enabled, keep reconciling on a fixed period
//!
//! Components never terminate the process. Conditions that must end it are
//! sent as [`FatalError`]s and surface through [`Provisioner::wait_for_fatal`].

use crate::admission::AdmissionController;
use crate::config::ProvisionerConfig;
use crate::dispatcher::JobDispatcher;
use crate::error::{FatalError, Result};
use crate::events::{EventPublisher, ProvisionerEvent};
use crate::job_spec::JobDefaults;
use crate::listener::ListenerRegistry;
use crate::messaging::{BrokerConnector, ConnectionManager, RandomSource};
use crate::orchestration::{ConfigStore, JobOrchestrator};
use crate::reconciler::{ConfigReconciler, ConfigSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// External collaborators the provisioner runs against
pub struct Collaborators {
    pub connector: Arc<dyn BrokerConnector>,
    pub orchestrator: Arc<dyn JobOrchestrator>,
    pub config_store: Arc<dyn ConfigStore>,
    pub random: Arc<dyn RandomSource>,
}

/// Running provisioner
pub struct Provisioner {
    config: ProvisionerConfig,
    publisher: EventPublisher,
    connection: Arc<ConnectionManager>,
    reconciler: Arc<ConfigReconciler>,
    admission: Arc<AdmissionController>,
    dispatcher: Arc<JobDispatcher>,
    listeners: Arc<ListenerRegistry>,
    fatal_tx: mpsc::UnboundedSender<FatalError>,
    fatal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FatalError>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("environment", &self.config.environment)
            .field("broker", &self.config.broker.redacted_uri())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Provisioner {
    pub fn new(config: ProvisionerConfig, collaborators: Collaborators) -> Self {
        let publisher = EventPublisher::default();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(
            collaborators.connector,
            collaborators.random,
            &config.reconnect,
            fatal_tx.clone(),
        );

        let reconciler = Arc::new(ConfigReconciler::new(
            collaborators.config_store,
            config.reconcile.clone(),
            config.kubernetes.pod_namespace.clone(),
            JobDefaults::new(
                config.kubernetes.job_scope.clone(),
                config.kubernetes.default_registry.clone(),
            ),
            publisher.clone(),
        ));

        let admission = Arc::new(AdmissionController::new(
            reconciler.clone(),
            collaborators.orchestrator.clone(),
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            reconciler.clone(),
            collaborators.orchestrator,
        ));
        let listeners = Arc::new(ListenerRegistry::new(
            connection.clone(),
            publisher.clone(),
            config.broker.requeue_on_failure,
        ));

        Self {
            config,
            publisher,
            connection,
            reconciler,
            admission,
            dispatcher,
            listeners,
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Connect, run the initial reconciliation and start the reload schedule
    pub async fn start(&self) -> Result<()> {
        info!(
            environment = %self.config.environment,
            broker = %self.config.broker.redacted_uri(),
            reload_enabled = self.reconciler.reload_enabled(),
            "Starting event job provisioner"
        );

        self.connection.connect().await?;
        self.running.store(true, Ordering::SeqCst);

        let event_task = self.spawn_event_loop();
        self.tasks.lock().push(event_task);

        if let Err(fatal) = self.reconciler.run_tick().await {
            let _ = self.fatal_tx.send(fatal);
            return Ok(());
        }

        if self.reconciler.reload_enabled() {
            let reload_task = self.spawn_reload_schedule();
            self.tasks.lock().push(reload_task);
        }

        Ok(())
    }

    fn spawn_event_loop(&self) -> JoinHandle<()> {
        let mut events = self.publisher.subscribe();
        let reconciler = self.reconciler.clone();
        let listeners = self.listeners.clone();
        let admission = self.admission.clone();
        let dispatcher = self.dispatcher.clone();
        let fatal_tx = self.fatal_tx.clone();

        tokio::spawn(async move {
            let rebuild = |configs: Arc<ConfigSet>| {
                let listeners = listeners.clone();
                let admission = admission.clone();
                let dispatcher = dispatcher.clone();
                let fatal_tx = fatal_tx.clone();
                async move {
                    if let Err(err) = listeners.rebuild(&configs, dispatcher, admission).await {
                        error!(error = %err, "Error updating queue listeners");
                        let _ = fatal_tx.send(FatalError::ListenerTopology(err));
                    }
                }
            };

            loop {
                match events.recv().await {
                    Ok(ProvisionerEvent::Reloaded { configs }) => rebuild(configs).await,
                    Ok(ProvisionerEvent::Processed(processed)) => {
                        debug!(
                            queue = %processed.alias,
                            success = processed.success,
                            "Message processed"
                        );
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            skipped,
                            "Event loop lagged, rebuilding from current configuration"
                        );
                        rebuild(reconciler.active()).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_reload_schedule(&self) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let period = self.config.reconcile.reload_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Reload is enabled here, so ticks never report a fatal
                let _ = reconciler.run_tick().await;
            }
        })
    }

    /// Wait for the first condition that must end the process
    pub async fn wait_for_fatal(&self) -> Option<FatalError> {
        self.fatal_rx.lock().await.recv().await
    }

    /// Stop reloading, tear down listeners and close the broker connection
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Provisioner already stopped");
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.reconciler.clear().await;
        self.listeners.shutdown().await;
        self.connection.stop().await;
        info!("Event job provisioner stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn reconciler(&self) -> &Arc<ConfigReconciler> {
        &self.reconciler
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }
}
