//! Message-to-job dispatch.

use crate::error::{ProvisionerError, Result};
use crate::listener::MessageDispatcher;
use crate::messaging::QueueMessage;
use crate::orchestration::{JobOrchestrator, JobReceipt};
use crate::reconciler::ConfigReconciler;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Creates one job per message using the alias's active spec
#[derive(Clone)]
pub struct JobDispatcher {
    specs: Arc<ConfigReconciler>,
    orchestrator: Arc<dyn JobOrchestrator>,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher").finish_non_exhaustive()
    }
}

impl JobDispatcher {
    pub fn new(specs: Arc<ConfigReconciler>, orchestrator: Arc<dyn JobOrchestrator>) -> Self {
        Self {
            specs,
            orchestrator,
        }
    }
}

#[async_trait]
impl MessageDispatcher for JobDispatcher {
    async fn dispatch(&self, alias: &str, message: &QueueMessage) -> Result<JobReceipt> {
        debug!(
            queue = %alias,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            "Received new message"
        );

        let spec = self.specs.get(alias).ok_or_else(|| {
            ProvisionerError::orchestration_dispatch(alias, "no active configuration for queue")
        })?;

        self.orchestrator.create_job(&spec, &message.data).await
    }
}
