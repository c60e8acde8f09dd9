#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Event Job Provisioner
//!
//! Bridges broker queues to Kubernetes jobs. Every configured queue (alias) is
//! polled on its own interval; when admission control reports free capacity one
//! message is pulled and turned into a job that receives the message through a
//! secret.
//!
//! ## Architecture
//!
//! ```text
//! ConfigReconciler ──Reloaded──▶ ListenerRegistry ──▶ QueuePoller (per alias)
//!        │                                              │
//!        ▼                                              ├─▶ AdmissionController
//!   ConfigStore                                         ├─▶ ConnectionManager (get/ack/nack)
//!                                                       └─▶ JobDispatcher ─▶ JobOrchestrator
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Environment configuration
//! - [`error`] - Error taxonomy and fatal conditions
//! - [`job_spec`] - Job configuration model and manifest generation
//! - [`reconciler`] - Configuration fetch, diff and swap
//! - [`admission`] - Per-queue admission control with degraded-mode fallback
//! - [`listener`] - Queue polling and listener topology
//! - [`dispatcher`] - Message to job dispatch
//! - [`messaging`] - Broker connection, reconnect and channel implementations
//! - [`orchestration`] - Kubernetes collaborators
//! - [`events`] - Reload and processed-message notifications
//! - [`provisioner`] - Composition root
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use event_job_provisioner::config::ConfigLoader;
//! use event_job_provisioner::messaging::{AmqpConnector, FastRandSource};
//! use event_job_provisioner::orchestration::KubernetesClient;
//! use event_job_provisioner::provisioner::{Collaborators, Provisioner};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::from_env()?;
//! let kubernetes = Arc::new(
//!     KubernetesClient::connect(&config.kubernetes, config.is_production()).await?,
//! );
//!
//! let provisioner = Provisioner::new(
//!     config.clone(),
//!     Collaborators {
//!         connector: Arc::new(AmqpConnector::new(config.broker.clone())),
//!         orchestrator: kubernetes.clone(),
//!         config_store: kubernetes,
//!         random: Arc::new(FastRandSource),
//!     },
//! );
//! provisioner.start().await?;
//!
//! if let Some(fatal) = provisioner.wait_for_fatal().await {
//!     eprintln!("fatal: {fatal}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job_spec;
pub mod listener;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod provisioner;
pub mod reconciler;

pub use admission::{AdmissionController, CapacityCheck, CapacityState, ProcessingState};
pub use config::{ConfigLoader, ProvisionerConfig};
pub use error::{FatalError, ProvisionerError, Result};
pub use events::{EventPublisher, ProcessedMessage, ProvisionerEvent};
pub use job_spec::{JobSpec, Parallelism};
pub use provisioner::{Collaborators, Provisioner};
pub use reconciler::{ConfigReconciler, ConfigSet};
