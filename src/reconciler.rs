//! # Configuration Reconciler
//!
//! Fetches the raw job documents from the configuration store, parses them
//! into [`JobSpec`]s and swaps the active set when something changed.
//!
//! The active set is an `Arc<ConfigSet>` behind a lock and is only ever
//! replaced as a whole, so readers see either the old or the new set. A change
//! is any alias whose spec differs from the current one, or an empty fetch
//! replacing a non-empty set. Unparseable documents fail the whole
//! reconciliation and leave the active set untouched.

use crate::config::ReconcileConfig;
use crate::error::{FatalError, Result};
use crate::events::EventPublisher;
use crate::job_spec::{JobDefaults, JobSpec};
use crate::orchestration::ConfigStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Active job specs keyed by alias
pub type ConfigSet = HashMap<String, JobSpec>;

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The active set was replaced
    Reloaded(Arc<ConfigSet>),
    Unchanged,
}

/// Owner of the active configuration set
pub struct ConfigReconciler {
    store: Arc<dyn ConfigStore>,
    config: ReconcileConfig,
    pod_namespace: String,
    defaults: JobDefaults,
    active: RwLock<Arc<ConfigSet>>,
    publisher: EventPublisher,
    in_progress: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ConfigReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigReconciler")
            .field("config_map", &self.config.config_map_name)
            .field("pod_namespace", &self.pod_namespace)
            .field("active", &self.active.read().len())
            .finish()
    }
}

impl ConfigReconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        config: ReconcileConfig,
        pod_namespace: impl Into<String>,
        defaults: JobDefaults,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            config,
            pod_namespace: pod_namespace.into(),
            defaults,
            active: RwLock::new(Arc::new(ConfigSet::new())),
            publisher,
            in_progress: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the active set
    pub fn active(&self) -> Arc<ConfigSet> {
        self.active.read().clone()
    }

    pub fn get(&self, alias: &str) -> Option<JobSpec> {
        self.active.read().get(alias).cloned()
    }

    pub fn reload_enabled(&self) -> bool {
        self.config.reload_enabled
    }

    /// Fetch, parse and diff; swap and notify on change
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let _guard = self.in_progress.lock().await;
        debug!(config_map = %self.config.config_map_name, "Trying to reload configuration");

        let raw = self
            .store
            .get_config(&self.config.config_map_name, &self.pod_namespace)
            .await?;
        let next = self.parse(raw)?;

        let current = self.active();
        let changed = has_changed(&current, &next);
        debug!(
            found = next.len(),
            current = current.len(),
            changed,
            "Compared configurations"
        );

        if !changed {
            info!("No configurations changed");
            return Ok(ReconcileOutcome::Unchanged);
        }

        let next = Arc::new(next);
        *self.active.write() = next.clone();

        let mut aliases: Vec<&str> = next.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        info!(configs = ?aliases, "Configuration reloaded");

        self.publisher.publish_reloaded(next.clone());
        Ok(ReconcileOutcome::Reloaded(next))
    }

    /// Run one reconciliation and apply the failure policy: with reload
    /// enabled failures are logged and retried on the next tick, otherwise
    /// they are fatal
    pub async fn run_tick(&self) -> std::result::Result<(), FatalError> {
        match self.reconcile().await {
            Ok(_) => Ok(()),
            Err(err) if self.config.reload_enabled => {
                warn!(error = %err, "Error reloading configuration");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Could not load configuration and reload is not enabled");
                Err(FatalError::InitialConfigLoad(err))
            }
        }
    }

    /// Replace the active set with an empty one, notifying if it was non-empty
    pub async fn clear(&self) {
        let _guard = self.in_progress.lock().await;
        let empty = Arc::new(ConfigSet::new());
        let previous = std::mem::replace(&mut *self.active.write(), empty.clone());
        if !previous.is_empty() {
            self.publisher.publish_reloaded(empty);
        }
    }

    fn parse(&self, raw: HashMap<String, String>) -> Result<ConfigSet> {
        // Sorted so the first reported parse error is deterministic
        let raw: BTreeMap<String, String> = raw.into_iter().collect();
        raw.iter()
            .map(|(alias, document)| {
                JobSpec::from_yaml(alias, document, &self.defaults)
                    .map(|spec| (alias.clone(), spec))
            })
            .collect()
    }
}

/// Whether `next` should replace `current`
pub fn has_changed(current: &ConfigSet, next: &ConfigSet) -> bool {
    next.iter()
        .any(|(alias, spec)| current.get(alias) != Some(spec))
        || (next.is_empty() && !current.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionerError;
    use crate::events::ProvisionerEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct StaticStore {
        data: Mutex<Result<HashMap<String, String>>>,
    }

    impl Default for StaticStore {
        fn default() -> Self {
            Self {
                data: Mutex::new(Ok(HashMap::new())),
            }
        }
    }

    impl StaticStore {
        fn set(&self, entries: &[(&str, &str)]) {
            *self.data.lock() = Ok(entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect());
        }

        fn fail(&self) {
            *self.data.lock() = Err(ProvisionerError::config_fetch("configs", "forbidden"));
        }
    }

    #[async_trait]
    impl ConfigStore for StaticStore {
        async fn get_config(&self, _: &str, _: &str) -> Result<HashMap<String, String>> {
            self.data.lock().clone()
        }
    }

    fn reconciler(
        store: Arc<StaticStore>,
        reload_enabled: bool,
    ) -> (ConfigReconciler, EventPublisher) {
        let publisher = EventPublisher::new(16);
        let reconciler = ConfigReconciler::new(
            store,
            ReconcileConfig {
                config_map_name: "configs".to_string(),
                reload_enabled,
                reload_interval: Duration::from_secs(60),
            },
            "ops",
            JobDefaults::new("jobs", None),
            publisher.clone(),
        );
        (reconciler, publisher)
    }

    const ORDERS: &str = "jobName: orders\nimage: worker\n";
    const ORDERS_V2: &str = "jobName: orders\nimage: worker\nimageVersion: '2'\n";
    const BILLING: &str = "jobName: billing\nimage: worker\n";

    #[tokio::test]
    async fn test_identical_fetch_notifies_once() {
        let store = Arc::new(StaticStore::default());
        store.set(&[("orders", ORDERS)]);
        let (reconciler, publisher) = reconciler(store, true);
        let mut events = publisher.subscribe();

        assert!(matches!(reconciler.reconcile().await.unwrap(), ReconcileOutcome::Reloaded(_)));
        assert_eq!(reconciler.reconcile().await.unwrap(), ReconcileOutcome::Unchanged);

        assert!(matches!(events.try_recv(), Ok(ProvisionerEvent::Reloaded { .. })));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_changed_spec_replaces_set() {
        let store = Arc::new(StaticStore::default());
        store.set(&[("orders", ORDERS)]);
        let (reconciler, _) = reconciler(store.clone(), true);
        reconciler.reconcile().await.unwrap();
        let before = reconciler.active();

        store.set(&[("orders", ORDERS_V2)]);
        reconciler.reconcile().await.unwrap();

        assert_eq!(before["orders"].image, "worker:latest");
        assert_eq!(reconciler.active()["orders"].image, "worker:2");
    }

    #[tokio::test]
    async fn test_removal_alone_is_not_a_change() {
        let store = Arc::new(StaticStore::default());
        store.set(&[("orders", ORDERS), ("billing", BILLING)]);
        let (reconciler, _) = reconciler(store.clone(), true);
        reconciler.reconcile().await.unwrap();

        store.set(&[("orders", ORDERS)]);
        assert_eq!(reconciler.reconcile().await.unwrap(), ReconcileOutcome::Unchanged);
        assert_eq!(reconciler.active().len(), 2);
    }

    #[tokio::test]
    async fn test_everything_removed_is_a_change() {
        let store = Arc::new(StaticStore::default());
        store.set(&[("orders", ORDERS)]);
        let (reconciler, _) = reconciler(store.clone(), true);
        reconciler.reconcile().await.unwrap();

        store.set(&[]);
        assert!(matches!(
            reconciler.reconcile().await.unwrap(),
            ReconcileOutcome::Reloaded(set) if set.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_empty_to_empty_is_unchanged() {
        let store = Arc::new(StaticStore::default());
        let (reconciler, _) = reconciler(store, true);
        assert_eq!(reconciler.reconcile().await.unwrap(), ReconcileOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_active_set() {
        let store = Arc::new(StaticStore::default());
        store.set(&[("orders", ORDERS)]);
        let (reconciler, _) = reconciler(store.clone(), true);
        reconciler.reconcile().await.unwrap();

        store.set(&[("orders", ORDERS_V2), ("broken", "image: missing-job-name\n")]);
        let err = reconciler.reconcile().await.unwrap_err();

        assert!(matches!(err, ProvisionerError::ConfigParse { ref alias, .. } if alias == "broken"));
        assert_eq!(reconciler.active()["orders"].image, "worker:latest");
    }

    #[tokio::test]
    async fn test_fetch_failure_policy() {
        let store = Arc::new(StaticStore::default());
        store.fail();

        let (tolerant, _) = reconciler(store.clone(), true);
        assert!(tolerant.reload_enabled());
        assert!(tolerant.run_tick().await.is_ok());

        let (strict, _) = reconciler(store, false);
        assert!(!strict.reload_enabled());
        assert!(matches!(
            strict.run_tick().await,
            Err(FatalError::InitialConfigLoad(ProvisionerError::ConfigFetch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_clear_notifies_only_when_non_empty() {
        let store = Arc::new(StaticStore::default());
        store.set(&[("orders", ORDERS)]);
        let (reconciler, publisher) = reconciler(store, true);
        reconciler.reconcile().await.unwrap();
        let mut events = publisher.subscribe();

        reconciler.clear().await;
        reconciler.clear().await;

        assert!(matches!(
            events.try_recv(),
            Ok(ProvisionerEvent::Reloaded { configs }) if configs.is_empty()
        ));
        assert!(events.try_recv().is_err());
        assert!(reconciler.active().is_empty());
    }
}
