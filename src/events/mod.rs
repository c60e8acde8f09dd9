//! # Provisioner Events
//!
//! Typed notifications emitted by the reconciler and the queue pollers. The
//! composition root listens for [`ProvisionerEvent::Reloaded`] to rebuild the
//! listener topology; [`ProvisionerEvent::Processed`] exists for observability
//! and tests.

pub mod publisher;

use crate::error::ProvisionerError;
use crate::reconciler::ConfigSet;
use std::sync::Arc;

pub use publisher::EventPublisher;

/// Discrete events published on the [`EventPublisher`]
#[derive(Debug, Clone)]
pub enum ProvisionerEvent {
    /// The active configuration set was replaced
    Reloaded { configs: Arc<ConfigSet> },
    /// A pulled message was dispatched (acked) or rejected (nacked)
    Processed(ProcessedMessage),
}

/// Outcome of dispatching one message
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMessage {
    pub alias: String,
    pub success: bool,
    /// Created job name on success
    pub job: Option<String>,
    pub error: Option<ProvisionerError>,
}

impl ProcessedMessage {
    pub fn succeeded(alias: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            success: true,
            job: Some(job.into()),
            error: None,
        }
    }

    pub fn failed(alias: impl Into<String>, error: ProvisionerError) -> Self {
        Self {
            alias: alias.into(),
            success: false,
            job: None,
            error: Some(error),
        }
    }
}
