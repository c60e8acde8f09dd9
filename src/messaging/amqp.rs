//! AMQP 0.9.1 broker implementation using the `lapin` crate.
//!
//! One connection with one channel. Queue polling uses `basic_get` with manual
//! acknowledgement; there are no consumers and no prefetch.

use super::channel::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerSession, CloseReason, QueueMessage,
};
use crate::config::BrokerConfig;
use crate::constants::system;
use crate::error::{ProvisionerError, Result};
use async_trait::async_trait;
use lapin::options::{BasicAckOptions, BasicGetOptions, BasicNackOptions, QueueDeclareOptions};
use lapin::tcp::OwnedTLSConfig;
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ConnectionState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Connects to the broker described by [`BrokerConfig`]
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<Connection> {
        let uri = self.config.uri();
        let properties = ConnectionProperties::default()
            .with_connection_name(system::CONNECTION_NAME.into());

        let ca_path = self
            .config
            .tls
            .as_ref()
            .and_then(|tls| tls.ca_cert_path.as_ref());

        let connection = match ca_path {
            Some(path) => {
                let cert_chain = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ProvisionerError::connect(format!(
                        "could not read CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let tls = OwnedTLSConfig {
                    identity: None,
                    cert_chain: Some(cert_chain),
                };
                Connection::connect_with_config(&uri, properties, tls).await
            }
            None => Connection::connect(&uri, properties).await,
        };

        connection.map_err(|e| {
            ProvisionerError::connect(format!("{}: {}", self.config.redacted_uri(), e))
        })
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<BrokerSession> {
        debug!(uri = %self.config.redacted_uri(), "Opening AMQP connection");
        let connection = self.open().await?;

        let (close_tx, close_events) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = close_tx.send(classify_close(&err));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ProvisionerError::connect(format!("channel creation failed: {}", e)))?;

        info!(uri = %self.config.redacted_uri(), "AMQP connection established");

        Ok(BrokerSession {
            connection: Arc::new(AmqpConnection {
                connection,
                channel: Arc::new(AmqpChannel { channel }),
            }),
            close_events,
        })
    }
}

/// Protocol errors, forced closures and transport loss are fatal; a connection
/// that is already closing was closed by us
fn classify_close(err: &lapin::Error) -> CloseReason {
    match err {
        lapin::Error::InvalidConnectionState(ConnectionState::Closed | ConnectionState::Closing) => {
            CloseReason::Requested(err.to_string())
        }
        other => CloseReason::Fatal(other.to_string()),
    }
}

struct AmqpConnection {
    connection: Connection,
    channel: Arc<AmqpChannel>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "provisioner shutdown")
            .await
            .map_err(|e| ProvisionerError::connect(format!("close failed: {}", e)))
    }
}

/// Channel operations on a `lapin` channel
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| ProvisionerError::queue_declare(queue, e.to_string()))
    }

    async fn get_one_message(&self, queue: &str) -> Result<Option<QueueMessage>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| ProvisionerError::channel(queue, "get", e.to_string()))?;

        Ok(message.map(|message| QueueMessage {
            queue: queue.to_string(),
            delivery_tag: message.delivery.delivery_tag,
            data: message.delivery.data,
            redelivered: message.delivery.redelivered,
        }))
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| ProvisionerError::channel(&message.queue, "ack", e.to_string()))
    }

    async fn nack(&self, message: &QueueMessage, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                message.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProvisionerError::channel(&message.queue, "nack", e.to_string()))
    }
}
