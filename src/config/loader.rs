//! Configuration Loader
//!
//! Reads the process environment through the `config` crate's `Environment`
//! source, deserialises it into flat [`EnvSettings`], and maps those onto the
//! typed [`ProvisionerConfig`]. Tests inject a map instead of touching the
//! real process environment.

use super::error::{ConfigResult, ConfigurationError};
use super::{
    BrokerConfig, KubernetesConfig, ProvisionerConfig, ReconcileConfig, ReconnectConfig,
    TlsConfig,
};
use crate::constants::system;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Flat view of the supported environment variables (keys are lowercased)
#[derive(Debug, Clone, Deserialize)]
struct EnvSettings {
    #[serde(default = "default_amqp_host")]
    amqp_host: String,
    #[serde(default = "default_amqp_port")]
    amqp_port: u16,
    amqp_username: Option<String>,
    amqp_password: Option<String>,
    amqp_vhost: Option<String>,
    #[serde(default = "default_heartbeat")]
    amqp_heartbeat: u16,
    #[serde(default)]
    amqp_tls: bool,
    amqp_ca_cert: Option<String>,
    #[serde(default)]
    amqp_requeue: bool,

    #[serde(default = "default_reconnect_backoff")]
    reconnect_backoff_seconds: u64,
    #[serde(default = "default_reconnect_attempts")]
    reconnect_max_attempts: u32,

    docker_registry: Option<String>,
    #[serde(default = "default_namespace")]
    pod_namespace: String,
    #[serde(default = "default_namespace")]
    kubernetes_job_scope: String,
    kubernetes_api_url: Option<String>,
    kubernetes_token: Option<String>,
    kubernetes_ca_cert: Option<String>,

    #[serde(default = "default_config_map_name")]
    config_map_name: String,
    reload_enabled: Option<String>,
    #[serde(default = "default_reload_interval")]
    reload_interval_seconds: u64,

    #[serde(default = "default_environment")]
    provisioner_env: String,
}

fn default_amqp_host() -> String {
    system::DEFAULT_AMQP_HOST.to_string()
}

fn default_amqp_port() -> u16 {
    system::DEFAULT_AMQP_PORT
}

fn default_heartbeat() -> u16 {
    system::DEFAULT_HEARTBEAT_SECONDS
}

fn default_reconnect_backoff() -> u64 {
    system::DEFAULT_RECONNECT_BACKOFF_SECONDS
}

fn default_reconnect_attempts() -> u32 {
    system::DEFAULT_RECONNECT_MAX_ATTEMPTS
}

fn default_namespace() -> String {
    system::DEFAULT_NAMESPACE.to_string()
}

fn default_config_map_name() -> String {
    system::DEFAULT_CONFIG_MAP_NAME.to_string()
}

fn default_reload_interval() -> u64 {
    system::DEFAULT_RELOAD_INTERVAL_SECONDS
}

fn default_environment() -> String {
    "development".to_string()
}

/// Treat empty variables as unset
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Reload stays enabled unless explicitly switched off
fn reload_enabled(value: Option<&str>) -> bool {
    match value {
        Some(raw) => !system::RELOAD_DISABLED_VALUES.contains(&raw.trim().to_lowercase().as_str()),
        None => true,
    }
}

/// Loads [`ProvisionerConfig`] from environment variables
#[derive(Debug)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from the process environment
    pub fn from_env() -> ConfigResult<ProvisionerConfig> {
        Self::load(config::Environment::default())
    }

    /// Load from an explicit variable map (upper-case names, as in the environment)
    pub fn from_map(variables: HashMap<String, String>) -> ConfigResult<ProvisionerConfig> {
        Self::load(config::Environment::default().source(Some(variables)))
    }

    fn load(source: config::Environment) -> ConfigResult<ProvisionerConfig> {
        let settings: EnvSettings = config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(ConfigurationError::source_error)?;

        let config = Self::map_settings(settings);
        config.validate()?;

        debug!(
            broker = %config.broker.redacted_uri(),
            environment = %config.environment,
            config_map = %config.reconcile.config_map_name,
            reload_enabled = config.reconcile.reload_enabled,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    fn map_settings(settings: EnvSettings) -> ProvisionerConfig {
        let ca_cert_path = non_empty(settings.amqp_ca_cert).map(PathBuf::from);
        let tls = if settings.amqp_tls || ca_cert_path.is_some() {
            Some(TlsConfig { ca_cert_path })
        } else {
            None
        };

        ProvisionerConfig {
            broker: BrokerConfig {
                host: settings.amqp_host,
                port: settings.amqp_port,
                username: non_empty(settings.amqp_username),
                password: non_empty(settings.amqp_password),
                vhost: non_empty(settings.amqp_vhost),
                heartbeat_seconds: settings.amqp_heartbeat,
                tls,
                requeue_on_failure: settings.amqp_requeue,
            },
            reconnect: ReconnectConfig {
                base_backoff: Duration::from_secs(settings.reconnect_backoff_seconds),
                max_attempts: settings.reconnect_max_attempts,
            },
            kubernetes: KubernetesConfig {
                job_scope: settings.kubernetes_job_scope,
                pod_namespace: settings.pod_namespace,
                default_registry: non_empty(settings.docker_registry),
                api_url: non_empty(settings.kubernetes_api_url),
                token: non_empty(settings.kubernetes_token),
                ca_cert_path: non_empty(settings.kubernetes_ca_cert).map(PathBuf::from),
            },
            reconcile: ReconcileConfig {
                config_map_name: settings.config_map_name,
                reload_enabled: reload_enabled(settings.reload_enabled.as_deref()),
                reload_interval: Duration::from_secs(settings.reload_interval_seconds),
            },
            environment: settings.provisioner_env,
        }
    }
}
