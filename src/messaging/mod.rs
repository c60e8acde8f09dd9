//! # Messaging Module
//!
//! Broker access for the provisioner. The core only needs four channel
//! operations (declare, get one, ack, nack) plus a connection that reports how
//! it closed; everything else about the wire protocol stays behind the
//! [`BrokerConnector`] seam.
//!
//! - [`channel`]: the channel/connection abstraction
//! - [`connection`]: connection ownership and reconnect/backoff
//! - [`amqp`]: AMQP 0.9.1 implementation on `lapin`
//! - [`in_memory`]: in-process broker for tests and local runs

pub mod amqp;
pub mod channel;
pub mod connection;
pub mod in_memory;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use channel::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerSession, CloseReason, QueueMessage,
};
pub use connection::{
    BackoffDecision, ConnectionManager, FastRandSource, RandomSource, ReconnectBackoff,
};
pub use in_memory::{InMemoryBroker, InMemoryConnector};
