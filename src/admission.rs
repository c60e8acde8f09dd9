//! # Admission Control
//!
//! Decides, per queue, whether one more job may be dispatched right now.
//!
//! | spec | orchestrator | result |
//! |---|---|---|
//! | missing | not asked | `busy`, `NotFound`, active `-1` |
//! | `unlimited` | not asked | not busy, `Unlimited`, active `0` |
//! | limited | count ok | `busy = parallelism < active`, `Fresh` |
//! | limited | count failed | degraded, see below |
//!
//! Degraded mode works from a per-alias estimate: `busy = parallelism <
//! estimate + 1`, and the estimate grows by one on every non-busy answer. It
//! never shrinks until a fresh count overwrites it. Estimates are kept per alias
//! for the lifetime of the controller, so they survive configuration reloads.
//! Checks for the same alias are serialized on a per-alias lock held across
//! the count query.

use crate::job_spec::JobSpec;
use crate::orchestration::JobOrchestrator;
use crate::reconciler::ConfigReconciler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How an admission answer was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapacityState {
    Fresh,
    Unlimited,
    /// Derived from the local estimate
    Old,
    NotFound,
}

impl fmt::Display for CapacityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapacityState::Fresh => "fresh",
            CapacityState::Unlimited => "unlimited",
            CapacityState::Old => "old",
            CapacityState::NotFound => "notfound",
        };
        f.write_str(name)
    }
}

/// Admission answer for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingState {
    pub active: i64,
    pub busy: bool,
    pub state: CapacityState,
}

impl ProcessingState {
    pub fn not_found() -> Self {
        Self {
            active: -1,
            busy: true,
            state: CapacityState::NotFound,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            active: 0,
            busy: false,
            state: CapacityState::Unlimited,
        }
    }
}

/// Capacity answer source used by the queue pollers
#[async_trait]
pub trait CapacityCheck: Send + Sync + 'static {
    async fn check_capacity(&self, alias: &str) -> ProcessingState;
}

/// Local estimate for one alias
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackState {
    pub estimated_active: u32,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub ever_observed_live: bool,
}

/// Admission controller backed by the orchestrator's active job count
pub struct AdmissionController {
    specs: Arc<ConfigReconciler>,
    orchestrator: Arc<dyn JobOrchestrator>,
    fallback: DashMap<String, Arc<Mutex<FallbackState>>>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("tracked_aliases", &self.fallback.len())
            .finish()
    }
}

impl AdmissionController {
    pub fn new(specs: Arc<ConfigReconciler>, orchestrator: Arc<dyn JobOrchestrator>) -> Self {
        Self {
            specs,
            orchestrator,
            fallback: DashMap::new(),
        }
    }

    /// Current local estimate for `alias`, if it was ever checked
    pub async fn fallback_state(&self, alias: &str) -> Option<FallbackState> {
        let entry = self.fallback.get(alias).map(|entry| entry.value().clone())?;
        let state = entry.lock().await.clone();
        Some(state)
    }

    fn fallback_for(&self, alias: &str) -> Arc<Mutex<FallbackState>> {
        self.fallback
            .entry(alias.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn check_limited(&self, spec: &JobSpec, limit: u32) -> ProcessingState {
        let entry = self.fallback_for(&spec.alias);
        let mut fallback = entry.lock().await;

        match self.orchestrator.count_active_jobs(spec).await {
            Ok(active) => {
                fallback.estimated_active = active;
                fallback.last_seen_at = Some(Utc::now());
                fallback.ever_observed_live = true;

                ProcessingState {
                    active: i64::from(active),
                    busy: limit < active,
                    state: CapacityState::Fresh,
                }
            }
            Err(err) => {
                warn!(
                    queue = %spec.alias,
                    error = %err,
                    "Unknown processing state, using local fallback"
                );

                let last_active = fallback.estimated_active;
                let busy = u64::from(limit) < u64::from(last_active) + 1;
                if !busy {
                    fallback.estimated_active = last_active.saturating_add(1);
                }

                ProcessingState {
                    active: i64::from(last_active),
                    busy,
                    state: CapacityState::Old,
                }
            }
        }
    }
}

#[async_trait]
impl CapacityCheck for AdmissionController {
    async fn check_capacity(&self, alias: &str) -> ProcessingState {
        let Some(spec) = self.specs.get(alias) else {
            debug!(queue = %alias, "No configuration for queue");
            return ProcessingState::not_found();
        };

        let Some(limit) = spec.parallelism.limit() else {
            return ProcessingState::unlimited();
        };

        self.check_limited(&spec, limit).await
    }
}
