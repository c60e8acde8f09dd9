//! # Provisioner Configuration
//!
//! Process-level configuration for the provisioner. Everything comes from the
//! environment: broker endpoint and credentials, reconnect policy, Kubernetes
//! access, and the configuration reload schedule.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_job_provisioner::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::from_env()?;
//!
//! println!("broker: {}", config.broker.redacted_uri());
//! println!("reload enabled: {}", config.reconcile.reload_enabled);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::system;
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Broker endpoint, credentials and delivery policy
    pub broker: BrokerConfig,

    /// Reconnect backoff policy
    pub reconnect: ReconnectConfig,

    /// Kubernetes API access and job defaults
    pub kubernetes: KubernetesConfig,

    /// Job configuration source and reload schedule
    pub reconcile: ReconcileConfig,

    /// Deployment environment (`production` switches to in-cluster access and JSON logs)
    pub environment: String,
}

impl ProvisionerConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Validate configuration for consistency and required fields
    pub fn validate(&self) -> ConfigResult<()> {
        if self.broker.host.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "AMQP_HOST",
                "broker configuration",
            ));
        }

        if self.broker.port == 0 {
            return Err(ConfigurationError::invalid_value(
                "AMQP_PORT",
                "0",
                "port must be greater than 0",
            ));
        }

        if self.broker.heartbeat_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "AMQP_HEARTBEAT",
                "0",
                "heartbeat must be greater than 0",
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "RECONNECT_MAX_ATTEMPTS",
                "0",
                "at least one reconnect attempt is required",
            ));
        }

        if self.reconcile.reload_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "RELOAD_INTERVAL_SECONDS",
                "0",
                "reload interval must be greater than 0",
            ));
        }

        if self.reconcile.config_map_name.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "CONFIG_MAP_NAME",
                "reconcile configuration",
            ));
        }

        Ok(())
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            reconnect: ReconnectConfig::default(),
            kubernetes: KubernetesConfig::default(),
            reconcile: ReconcileConfig::default(),
            environment: "development".to_string(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    pub heartbeat_seconds: u16,
    /// `Some` switches the transport to `amqps`
    pub tls: Option<TlsConfig>,
    /// Requeue a message when its dispatch fails (otherwise it is dropped)
    pub requeue_on_failure: bool,
}

impl BrokerConfig {
    /// Full connection URI including credentials and heartbeat
    pub fn uri(&self) -> String {
        self.build_uri(true)
    }

    /// Connection URI safe for logging
    pub fn redacted_uri(&self) -> String {
        self.build_uri(false)
    }

    fn build_uri(&self, with_credentials: bool) -> String {
        let scheme = if self.tls.is_some() { "amqps" } else { "amqp" };

        let authority = match (&self.username, &self.password) {
            (Some(username), Some(password)) if with_credentials => format!(
                "{}:{}@{}:{}",
                urlencoding::encode(username),
                urlencoding::encode(password),
                self.host,
                self.port
            ),
            (Some(username), Some(_)) => format!(
                "{}:***@{}:{}",
                urlencoding::encode(username),
                self.host,
                self.port
            ),
            _ => format!("{}:{}", self.host, self.port),
        };

        let vhost = self
            .vhost
            .as_deref()
            .map(|vhost| format!("/{}", urlencoding::encode(vhost)))
            .unwrap_or_default();

        format!(
            "{scheme}://{authority}{vhost}?heartbeat={}",
            self.heartbeat_seconds
        )
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: system::DEFAULT_AMQP_HOST.to_string(),
            port: system::DEFAULT_AMQP_PORT,
            username: None,
            password: None,
            vhost: None,
            heartbeat_seconds: system::DEFAULT_HEARTBEAT_SECONDS,
            tls: None,
            requeue_on_failure: false,
        }
    }
}

/// TLS settings for the broker transport
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM encoded CA chain; system roots are used when absent
    pub ca_cert_path: Option<PathBuf>,
}

/// Reconnect backoff policy
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry, restored after every successful reconnect
    pub base_backoff: Duration,
    /// Failed attempts after which recovery is abandoned
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(system::DEFAULT_RECONNECT_BACKOFF_SECONDS),
            max_attempts: system::DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

/// Kubernetes access and job defaults
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Namespace jobs are created in when a spec names none
    pub job_scope: String,
    /// Namespace holding the job configuration map
    pub pod_namespace: String,
    /// Registry prefixed to images that name none
    pub default_registry: Option<String>,
    /// Explicit API server URL (out-of-cluster access)
    pub api_url: Option<String>,
    /// Explicit bearer token (out-of-cluster access)
    pub token: Option<String>,
    /// Explicit CA bundle for the API server
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            job_scope: system::DEFAULT_NAMESPACE.to_string(),
            pod_namespace: system::DEFAULT_NAMESPACE.to_string(),
            default_registry: None,
            api_url: None,
            token: None,
            ca_cert_path: None,
        }
    }
}

/// Job configuration source and reload schedule
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub config_map_name: String,
    /// Keep reconciling on a fixed period after the initial load
    pub reload_enabled: bool,
    pub reload_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            config_map_name: system::DEFAULT_CONFIG_MAP_NAME.to_string(),
            reload_enabled: true,
            reload_interval: Duration::from_secs(system::DEFAULT_RELOAD_INTERVAL_SECONDS),
        }
    }
}
