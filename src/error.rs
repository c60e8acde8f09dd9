//! # Error Types
//!
//! Structured error handling for the provisioner using `thiserror`.
//!
//! Two families live here:
//!
//! - [`ProvisionerError`]: recoverable or per-operation failures returned by
//!   components (connect, config fetch/parse, orchestration, queue operations).
//! - [`FatalError`]: conditions that must end the process. Components never exit
//!   on their own; they report a `FatalError` on a channel and the binary turns
//!   it into exit code 1.

use thiserror::Error;

/// Component-level error taxonomy
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisionerError {
    /// Transport, authentication or TLS failure while connecting to the broker
    #[error("Broker connection failed: {message}")]
    Connect { message: String },

    /// Broker closed the connection with an unrecoverable condition
    #[error("Fatal broker disconnect: {message}")]
    FatalDisconnect { message: String },

    /// Configuration store could not be read
    #[error("Configuration fetch failed for '{name}': {message}")]
    ConfigFetch { name: String, message: String },

    /// A configuration document could not be parsed into a job spec
    #[error("Invalid job configuration '{alias}': {message}")]
    ConfigParse { alias: String, message: String },

    /// Active job count could not be determined
    #[error("Active job query failed for '{alias}': {message}")]
    OrchestrationQuery { alias: String, message: String },

    /// Job or secret creation failed
    #[error("Job dispatch failed for '{alias}': {message}")]
    OrchestrationDispatch { alias: String, message: String },

    /// Queue declaration was rejected by the broker
    #[error("Queue declare failed: {queue}: {message}")]
    QueueDeclare { queue: String, message: String },

    /// get/ack/nack on the broker channel failed
    #[error("Channel operation failed: {queue}: {operation}: {message}")]
    Channel {
        queue: String,
        operation: String,
        message: String,
    },

    /// Invalid process configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProvisionerError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub fn fatal_disconnect(message: impl Into<String>) -> Self {
        Self::FatalDisconnect {
            message: message.into(),
        }
    }

    pub fn config_fetch(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigFetch {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config_parse(alias: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigParse {
            alias: alias.into(),
            message: message.into(),
        }
    }

    pub fn orchestration_query(alias: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OrchestrationQuery {
            alias: alias.into(),
            message: message.into(),
        }
    }

    pub fn orchestration_dispatch(alias: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OrchestrationDispatch {
            alias: alias.into(),
            message: message.into(),
        }
    }

    pub fn queue_declare(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueDeclare {
            queue: queue.into(),
            message: message.into(),
        }
    }

    pub fn channel(
        queue: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Channel {
            queue: queue.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<crate::config::ConfigurationError> for ProvisionerError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        ProvisionerError::Configuration(error.to_string())
    }
}

/// Conditions that terminate the process with exit code 1
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FatalError {
    /// Initial configuration load failed while continuous reload is disabled
    #[error("Could not load configuration and reload is not enabled: {0}")]
    InitialConfigLoad(ProvisionerError),

    /// Queue topology could not be established for a reload
    #[error("Error updating queue listeners: {0}")]
    ListenerTopology(ProvisionerError),

    /// Reconnect budget spent without recovering the broker connection.
    /// `cause` is the disconnect that started the cycle, `last_error` the
    /// failure of the final attempt.
    #[error("Connection error not recovered after {attempts} attempts: {cause} (last attempt: {last_error})")]
    ReconnectExhausted {
        attempts: u32,
        cause: ProvisionerError,
        last_error: ProvisionerError,
    },
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = ProvisionerError::queue_declare("orders", "ACCESS_REFUSED");
        assert_eq!(err.to_string(), "Queue declare failed: orders: ACCESS_REFUSED");

        let err = ProvisionerError::channel("orders", "nack", "channel closed");
        assert_eq!(
            err.to_string(),
            "Channel operation failed: orders: nack: channel closed"
        );
    }

    #[test]
    fn test_fatal_error_wraps_cause() {
        let fatal = FatalError::ReconnectExhausted {
            attempts: 5,
            cause: ProvisionerError::fatal_disconnect("CONNECTION_FORCED"),
            last_error: ProvisionerError::connect("connection refused"),
        };
        let message = fatal.to_string();
        assert!(message.contains("after 5 attempts"));
        assert!(message.contains("Fatal broker disconnect: CONNECTION_FORCED"));
        assert!(message.contains("connection refused"));
    }
}
