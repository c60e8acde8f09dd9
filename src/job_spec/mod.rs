//! # Job Specifications
//!
//! Canonical, comparable representation of one queue's dispatch configuration.
//!
//! A [`JobSpec`] is parsed from one YAML document of the job configuration map,
//! with defaults filled in: image reference resolution, resource tiers merged
//! per key over fixed defaults, and identity labels merged over caller labels.
//!
//! ## Equality
//!
//! Two specs are equal when their content matches regardless of ordering:
//! labels and resource tiers compare as key/value sets, the environment
//! compares as a set of `(name, value)` pairs. `parallelism` does not take part
//! in equality. Reconciliation relies on this to avoid rebuilding listeners for
//! a reordered but otherwise identical configuration.

pub mod template;

use crate::constants::{job_defaults, labels, resources};
use crate::error::{ProvisionerError, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

pub use template::JobTemplate;

/// Concurrency ceiling for a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parallelism {
    /// At most this many active jobs
    Limited(u32),
    /// Admission control disabled
    Unlimited,
}

impl Parallelism {
    pub fn limit(&self) -> Option<u32> {
        match self {
            Parallelism::Limited(limit) => Some(*limit),
            Parallelism::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Parallelism::Unlimited)
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Limited(job_defaults::PARALLELISM)
    }
}

impl fmt::Display for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parallelism::Limited(limit) => write!(f, "{limit}"),
            Parallelism::Unlimited => f.write_str(job_defaults::UNLIMITED),
        }
    }
}

impl<'de> Deserialize<'de> for Parallelism {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ParallelismVisitor;

        impl<'de> Visitor<'de> for ParallelismVisitor {
            type Value = Parallelism;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a positive integer or \"unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Parallelism, E> {
                match u32::try_from(value) {
                    Ok(0) => Err(E::custom("parallelism must be greater than 0")),
                    Ok(limit) => Ok(Parallelism::Limited(limit)),
                    Err(_) => Err(E::custom("parallelism exceeds u32::MAX")),
                }
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Parallelism, E> {
                if value <= 0 {
                    return Err(E::custom("parallelism must be greater than 0"));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Parallelism, E> {
                let value = value.trim();
                if value == job_defaults::UNLIMITED {
                    return Ok(Parallelism::Unlimited);
                }
                let parsed: u64 = value
                    .parse()
                    .map_err(|_| E::custom(format!("invalid parallelism '{value}'")))?;
                self.visit_u64(parsed)
            }
        }

        deserializer.deserialize_any(ParallelismVisitor)
    }
}

/// YAML scalar normalised to its string form (`1`, `true`, `"1Gi"`)
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScalarString(String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ScalarVisitor;

        impl<'de> Visitor<'de> for ScalarVisitor {
            type Value = ScalarString;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<ScalarString, E> {
                Ok(ScalarString(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    ScalarString::deserialize(deserializer).map(|s| s.0)
}

/// One environment variable injected into the job container
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Resource requests and limits for the job container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRequirements {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            requests: BTreeMap::from([
                ("cpu".to_string(), resources::REQUEST_CPU.to_string()),
                ("memory".to_string(), resources::REQUEST_MEMORY.to_string()),
            ]),
            limits: BTreeMap::from([
                ("cpu".to_string(), resources::LIMIT_CPU.to_string()),
                ("memory".to_string(), resources::LIMIT_MEMORY.to_string()),
            ]),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResourceDocument {
    #[serde(default)]
    requests: BTreeMap<String, ScalarString>,
    #[serde(default)]
    limits: BTreeMap<String, ScalarString>,
}

/// Raw configuration document as stored in the config map
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDocument {
    job_name: String,
    image: String,
    image_version: Option<ScalarString>,
    registry: Option<String>,
    namespace: Option<String>,
    timeout: Option<u64>,
    interval: Option<u64>,
    parallelism: Option<Parallelism>,
    #[serde(default)]
    environment: Vec<EnvVar>,
    #[serde(default)]
    resources: ResourceDocument,
    #[serde(default)]
    labels: BTreeMap<String, ScalarString>,
    service_account: Option<String>,
}

/// Defaults supplied by the process configuration
#[derive(Debug, Clone, Default)]
pub struct JobDefaults {
    /// Namespace used when a document names none
    pub scope: String,
    /// Registry prefixed when a document names none
    pub registry: Option<String>,
}

impl JobDefaults {
    pub fn new(scope: impl Into<String>, registry: Option<String>) -> Self {
        Self {
            scope: scope.into(),
            registry,
        }
    }
}

/// Dispatch configuration for one queue alias
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Queue name and configuration key
    pub alias: String,
    /// Logical job identifier used in resource names and labels
    pub job_name: String,
    /// Fully qualified image reference
    pub image: String,
    pub namespace: String,
    /// Maximum runtime in seconds
    pub timeout: u64,
    /// Poll period
    pub interval: Duration,
    pub parallelism: Parallelism,
    pub environment: Vec<EnvVar>,
    pub resources: ResourceRequirements,
    pub labels: BTreeMap<String, String>,
    pub service_account: Option<String>,
}

impl JobSpec {
    /// Parse one configuration document for `alias`
    pub fn from_yaml(alias: &str, document: &str, defaults: &JobDefaults) -> Result<Self> {
        let document: JobDocument = serde_yaml::from_str(document)
            .map_err(|e| ProvisionerError::config_parse(alias, e.to_string()))?;

        Ok(Self::from_document(alias, document, defaults))
    }

    fn from_document(alias: &str, document: JobDocument, defaults: &JobDefaults) -> Self {
        // Empty strings and zero durations count as unset
        let image_version = non_empty(document.image_version.map(|v| v.0))
            .unwrap_or_else(|| job_defaults::IMAGE_VERSION.to_string());
        let registry =
            non_empty(document.registry).or_else(|| non_empty(defaults.registry.clone()));
        let image = build_image_reference(registry.as_deref(), &document.image, &image_version);

        let namespace = non_empty(document.namespace).unwrap_or_else(|| defaults.scope.clone());
        let timeout = non_zero(document.timeout).unwrap_or(job_defaults::TIMEOUT_SECONDS);
        let interval = non_zero(document.interval).unwrap_or(job_defaults::INTERVAL_SECONDS);

        let mut resources = ResourceRequirements::default();
        resources
            .requests
            .extend(document.resources.requests.into_iter().map(|(k, v)| (k, v.0)));
        resources
            .limits
            .extend(document.resources.limits.into_iter().map(|(k, v)| (k, v.0)));

        // Caller labels first so identity labels win on collisions
        let mut job_labels: BTreeMap<String, String> = document
            .labels
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        job_labels.extend([
            (labels::COMPONENT.to_string(), labels::COMPONENT_VALUE.to_string()),
            (labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string()),
            (labels::JOB_GROUP.to_string(), labels::JOB_GROUP_VALUE.to_string()),
            (
                labels::NAME.to_string(),
                format!("{alias}{}", labels::PROCESSOR_SUFFIX),
            ),
            (labels::VERSION.to_string(), image_version),
            (labels::PART_OF.to_string(), namespace.clone()),
            (labels::JOB_ITEM.to_string(), document.job_name.clone()),
        ]);

        Self {
            alias: alias.to_string(),
            job_name: document.job_name,
            image,
            namespace,
            timeout,
            interval: Duration::from_secs(interval),
            parallelism: document.parallelism.unwrap_or_default(),
            environment: document.environment,
            resources,
            labels: job_labels,
            service_account: document.service_account,
        }
    }

    /// Poll period in milliseconds
    pub fn interval_ms(&self) -> u128 {
        self.interval.as_millis()
    }

    fn environment_set(&self) -> BTreeSet<(&str, &str)> {
        self.environment
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_str()))
            .collect()
    }
}

impl PartialEq for JobSpec {
    fn eq(&self, other: &Self) -> bool {
        self.alias == other.alias
            && self.job_name == other.job_name
            && self.timeout == other.timeout
            && self.interval == other.interval
            && self.namespace == other.namespace
            && self.image == other.image
            && self.service_account == other.service_account
            && self.labels == other.labels
            && self.resources == other.resources
            && self.environment_set() == other.environment_set()
    }
}

impl Eq for JobSpec {}

/// `registry/image:version`, registry omitted when absent
pub fn build_image_reference(registry: Option<&str>, image: &str, version: &str) -> String {
    match registry {
        Some(registry) if !registry.is_empty() => format!("{registry}/{image}:{version}"),
        _ => format!("{image}:{version}"),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_zero(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}
