//! Shared doubles and builders for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use event_job_provisioner::config::{ProvisionerConfig, ReconcileConfig, ReconnectConfig};
use event_job_provisioner::error::{ProvisionerError, Result};
use event_job_provisioner::job_spec::JobSpec;
use event_job_provisioner::listener::ListenerRegistry;
use event_job_provisioner::messaging::{InMemoryBroker, InMemoryConnector, RandomSource};
use event_job_provisioner::orchestration::{ConfigStore, JobOrchestrator, JobReceipt, MessageSecret};
use event_job_provisioner::provisioner::{Collaborators, Provisioner};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration map double with switchable failures
#[derive(Debug, Default)]
pub struct ScriptedStore {
    documents: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl ScriptedStore {
    pub fn with(documents: &[(&str, &str)]) -> Arc<Self> {
        let store = Self::default();
        for (alias, document) in documents {
            store.set(alias, document);
        }
        Arc::new(store)
    }

    pub fn set(&self, alias: &str, document: &str) {
        self.documents
            .lock()
            .insert(alias.to_string(), document.to_string());
    }

    pub fn remove(&self, alias: &str) {
        self.documents.lock().remove(alias);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for ScriptedStore {
    async fn get_config(&self, name: &str, _namespace: &str) -> Result<HashMap<String, String>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProvisionerError::config_fetch(name, "connection refused"));
        }
        Ok(self.documents.lock().clone())
    }
}

/// Orchestrator double recording created jobs and secrets
#[derive(Debug, Default)]
pub struct ScriptedOrchestrator {
    active: AtomicU32,
    count_failing: AtomicBool,
    dispatch_failing: AtomicBool,
    count_queries: AtomicUsize,
    jobs: Mutex<Vec<(String, Vec<u8>)>>,
    secrets: Mutex<Vec<MessageSecret>>,
}

impl ScriptedOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_active(&self, active: u32) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn set_count_failing(&self, failing: bool) {
        self.count_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_dispatch_failing(&self, failing: bool) {
        self.dispatch_failing.store(failing, Ordering::SeqCst);
    }

    pub fn count_queries(&self) -> usize {
        self.count_queries.load(Ordering::SeqCst)
    }

    /// Job name and message of every created job, in order
    pub fn jobs(&self) -> Vec<(String, Vec<u8>)> {
        self.jobs.lock().clone()
    }

    pub fn secrets(&self) -> Vec<MessageSecret> {
        self.secrets.lock().clone()
    }
}

#[async_trait]
impl JobOrchestrator for ScriptedOrchestrator {
    async fn create_job(&self, spec: &JobSpec, message: &[u8]) -> Result<JobReceipt> {
        if self.dispatch_failing.load(Ordering::SeqCst) {
            return Err(ProvisionerError::orchestration_dispatch(
                &spec.alias,
                "admission webhook denied the request",
            ));
        }

        let job = format!("{}-{}", spec.job_name, self.jobs.lock().len() + 1);
        self.create_secret(&MessageSecret::new(
            &spec.namespace,
            &spec.job_name,
            &job,
            message,
        ))
        .await?;
        self.jobs.lock().push((job.clone(), message.to_vec()));

        Ok(JobReceipt {
            job,
            alias: spec.alias.clone(),
            job_name: spec.job_name.clone(),
        })
    }

    async fn count_active_jobs(&self, spec: &JobSpec) -> Result<u32> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        if self.count_failing.load(Ordering::SeqCst) {
            return Err(ProvisionerError::orchestration_query(
                &spec.alias,
                "the server is currently unable to handle the request",
            ));
        }
        Ok(self.active.load(Ordering::SeqCst))
    }

    async fn create_secret(&self, secret: &MessageSecret) -> Result<()> {
        self.secrets.lock().push(secret.clone());
        Ok(())
    }
}

/// Random source returning one fixed value
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

pub fn test_config(reload_enabled: bool) -> ProvisionerConfig {
    ProvisionerConfig {
        reconnect: ReconnectConfig {
            base_backoff: Duration::from_secs(1),
            max_attempts: 5,
        },
        reconcile: ReconcileConfig {
            config_map_name: "provisioner-configs".to_string(),
            reload_enabled,
            reload_interval: Duration::from_secs(30),
        },
        environment: "test".to_string(),
        ..Default::default()
    }
}

/// A provisioner wired to in-memory doubles
pub struct Harness {
    pub provisioner: Provisioner,
    pub connector: Arc<InMemoryConnector>,
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<ScriptedStore>,
    pub orchestrator: Arc<ScriptedOrchestrator>,
}

impl Harness {
    pub fn new(config: ProvisionerConfig, store: Arc<ScriptedStore>) -> Self {
        let broker = InMemoryBroker::new();
        let connector = Arc::new(InMemoryConnector::new(broker.clone()));
        let orchestrator = ScriptedOrchestrator::new();

        let provisioner = Provisioner::new(
            config,
            Collaborators {
                connector: connector.clone(),
                orchestrator: orchestrator.clone(),
                config_store: store.clone(),
                random: Arc::new(FixedRandom(0.5)),
            },
        );

        Self {
            provisioner,
            connector,
            broker,
            store,
            orchestrator,
        }
    }
}

/// Poll `condition` every 10ms until it holds; panics after `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the registry runs exactly `expected`
pub async fn wait_for_listeners(registry: &ListenerRegistry, expected: &[&str]) {
    let expected: BTreeSet<String> = expected.iter().map(|alias| alias.to_string()).collect();
    for _ in 0..500 {
        if registry.active_aliases().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "listeners never matched {expected:?}, running {:?}",
        registry.active_aliases().await
    );
}

pub const ORDERS: &str = "jobName: resize\nimage: resizer\nparallelism: 2\ninterval: 5\n";
pub const INVOICES: &str = "jobName: render\nimage: renderer\nparallelism: unlimited\n";
