//! Broker channel and connection abstractions.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One message pulled from a queue, awaiting ack or nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue the message was pulled from
    pub queue: String,
    /// Channel-scoped delivery tag used for ack/nack
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

impl QueueMessage {
    /// Message body as UTF-8 (lossy)
    pub fn content(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// The channel operations the dispatch engine relies on
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a durable queue; idempotent
    async fn assert_queue(&self, queue: &str) -> Result<()>;

    /// Pull at most one message without auto-ack
    async fn get_one_message(&self, queue: &str) -> Result<Option<QueueMessage>>;

    async fn ack(&self, message: &QueueMessage) -> Result<()>;

    /// Reject a message, optionally putting it back on the queue
    async fn nack(&self, message: &QueueMessage, requeue: bool) -> Result<()>;
}

/// How a broker connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Protocol-fatal condition, forced closure or transport loss; triggers reconnect
    Fatal(String),
    /// Application-initiated close; terminal
    Requested(String),
}

impl CloseReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CloseReason::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            CloseReason::Fatal(message) | CloseReason::Requested(message) => message,
        }
    }
}

/// A live broker connection owning exactly one channel
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn channel(&self) -> Arc<dyn BrokerChannel>;

    /// Close the connection; closing an already-closed connection succeeds
    async fn close(&self) -> Result<()>;
}

/// A freshly established connection plus the stream of its close events
pub struct BrokerSession {
    pub connection: Arc<dyn BrokerConnection>,
    pub close_events: mpsc::UnboundedReceiver<CloseReason>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}

/// Establishes broker connections (endpoint, credentials, heartbeat, TLS are its concern)
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<BrokerSession>;
}
