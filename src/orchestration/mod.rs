//! # Orchestration Collaborators
//!
//! The provisioner talks to two external systems besides the broker: the job
//! orchestrator (create jobs, count active ones) and the configuration store
//! (read the config map holding job specs). Both sit behind traits so the
//! admission and reconciliation logic can be exercised without a cluster.
//!
//! - [`secret`]: the per-message secret payload handed to each job
//! - [`kubernetes`]: REST implementation of both traits against the Kubernetes API

pub mod kubernetes;
pub mod secret;

use crate::error::Result;
use crate::job_spec::JobSpec;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

pub use kubernetes::KubernetesClient;
pub use secret::MessageSecret;

/// Identity of a created job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReceipt {
    /// Generated job (and secret) name
    pub job: String,
    pub alias: String,
    pub job_name: String,
}

/// Job orchestration backend
#[async_trait]
pub trait JobOrchestrator: Send + Sync + 'static {
    /// Create the message secret and the job consuming it
    async fn create_job(&self, spec: &JobSpec, message: &[u8]) -> Result<JobReceipt>;

    /// Count jobs for `spec` that are currently active.
    ///
    /// Implementations may cap the count at `parallelism + 1`; the admission
    /// decision only needs to know whether the limit is exceeded.
    async fn count_active_jobs(&self, spec: &JobSpec) -> Result<u32>;

    /// Create the secret carrying one message to its job
    async fn create_secret(&self, secret: &MessageSecret) -> Result<()>;
}

/// Key/value configuration store (a config map)
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn get_config(&self, name: &str, namespace: &str) -> Result<HashMap<String, String>>;
}
