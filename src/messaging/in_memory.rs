//! In-memory broker for tests and local runs.
//!
//! Queues must be declared before they can be read, mirroring a broker that
//! rejects `basic_get` on a missing queue. Nacked messages with `requeue` go
//! back to the head of their queue and come back flagged as redelivered.

use super::channel::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerSession, CloseReason, QueueMessage,
};
use crate::error::{ProvisionerError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<(Vec<u8>, bool)>>,
    declared: HashSet<String>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
    acked: Vec<QueueMessage>,
    nacked: Vec<(QueueMessage, bool)>,
    failing_declares: HashSet<String>,
}

/// Shared in-process queue store
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a message; the queue does not need to be declared yet
    pub fn publish(&self, queue: &str, data: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back((data.into(), false));
    }

    /// Make every future declaration of `queue` fail
    pub fn fail_declare_for(&self, queue: &str) {
        self.state.lock().failing_declares.insert(queue.to_string());
    }

    pub fn declared_queues(&self) -> HashSet<String> {
        self.state.lock().declared.clone()
    }

    /// Messages still waiting in `queue`
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn acked(&self) -> Vec<QueueMessage> {
        self.state.lock().acked.clone()
    }

    /// Nacked messages with the requeue flag they were rejected with
    pub fn nacked(&self) -> Vec<(QueueMessage, bool)> {
        self.state.lock().nacked.clone()
    }

    fn settle(&self, message: &QueueMessage, operation: &str) -> Result<(String, Vec<u8>)> {
        self.state
            .lock()
            .unacked
            .remove(&message.delivery_tag)
            .ok_or_else(|| {
                ProvisionerError::channel(
                    &message.queue,
                    operation,
                    format!("unknown delivery tag {}", message.delivery_tag),
                )
            })
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn assert_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_declares.contains(queue) {
            return Err(ProvisionerError::queue_declare(queue, "ACCESS_REFUSED"));
        }
        state.declared.insert(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn get_one_message(&self, queue: &str) -> Result<Option<QueueMessage>> {
        let mut state = self.state.lock();
        if !state.declared.contains(queue) {
            return Err(ProvisionerError::channel(queue, "get", "NOT_FOUND - no queue"));
        }

        let Some((data, redelivered)) = state.queues.get_mut(queue).and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };

        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        state
            .unacked
            .insert(delivery_tag, (queue.to_string(), data.clone()));

        Ok(Some(QueueMessage {
            queue: queue.to_string(),
            delivery_tag,
            data,
            redelivered,
        }))
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        self.settle(message, "ack")?;
        self.state.lock().acked.push(message.clone());
        Ok(())
    }

    async fn nack(&self, message: &QueueMessage, requeue: bool) -> Result<()> {
        let (queue, data) = self.settle(message, "nack")?;
        let mut state = self.state.lock();
        if requeue {
            state
                .queues
                .entry(queue)
                .or_default()
                .push_front((data, true));
        }
        state.nacked.push((message.clone(), requeue));
        Ok(())
    }
}

/// Connector handing out connections to one [`InMemoryBroker`], with
/// scriptable connect failures and connection drops
#[derive(Debug)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
    fail_next: AtomicU32,
    always_fail: AtomicBool,
    connect_calls: AtomicUsize,
    close_tx: Mutex<Option<mpsc::UnboundedSender<CloseReason>>>,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new(InMemoryBroker::new())
    }
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            fail_next: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            close_tx: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> Arc<InMemoryBroker> {
        self.broker.clone()
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn always_fail(&self, enabled: bool) {
        self.always_fail.store(enabled, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Close the current connection as if the broker or application did
    pub fn drop_connection(&self, reason: CloseReason) {
        if let Some(close_tx) = self.close_tx.lock().take() {
            let _ = close_tx.send(reason);
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<BrokerSession> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ProvisionerError::connect("ECONNREFUSED"));
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ProvisionerError::connect("ECONNREFUSED"));
        }

        let (close_tx, close_events) = mpsc::unbounded_channel();
        *self.close_tx.lock() = Some(close_tx);

        Ok(BrokerSession {
            connection: Arc::new(InMemoryConnection {
                broker: self.broker.clone(),
            }),
            close_events,
        })
    }
}

struct InMemoryConnection {
    broker: Arc<InMemoryBroker>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.broker.clone()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_requires_declared_queue() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", "hello");

        assert!(broker.get_one_message("orders").await.is_err());

        broker.assert_queue("orders").await.unwrap();
        let message = broker.get_one_message("orders").await.unwrap().unwrap();
        assert_eq!(message.content(), "hello");
        assert!(!message.redelivered);
        assert!(broker.get_one_message("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nack_with_requeue_returns_message_to_head() {
        let broker = InMemoryBroker::new();
        broker.assert_queue("orders").await.unwrap();
        broker.publish("orders", "first");
        broker.publish("orders", "second");

        let first = broker.get_one_message("orders").await.unwrap().unwrap();
        broker.nack(&first, true).await.unwrap();

        let again = broker.get_one_message("orders").await.unwrap().unwrap();
        assert_eq!(again.content(), "first");
        assert!(again.redelivered);
        broker.nack(&again, false).await.unwrap();

        assert_eq!(broker.pending("orders"), 1);
        assert_eq!(broker.nacked().len(), 2);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = InMemoryBroker::new();
        broker.assert_queue("orders").await.unwrap();
        broker.publish("orders", "payload");

        let message = broker.get_one_message("orders").await.unwrap().unwrap();
        broker.ack(&message).await.unwrap();
        assert!(broker.ack(&message).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_declare() {
        let broker = InMemoryBroker::new();
        broker.fail_declare_for("forbidden");
        let err = broker.assert_queue("forbidden").await.unwrap_err();
        assert!(matches!(err, ProvisionerError::QueueDeclare { .. }));
    }

    #[tokio::test]
    async fn test_connector_scripted_failures() {
        let connector = InMemoryConnector::default();
        connector.fail_next(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        let mut session = connector.connect().await.unwrap();
        assert_eq!(connector.connect_calls(), 3);

        connector.drop_connection(CloseReason::Fatal("gone".into()));
        assert_eq!(
            session.close_events.recv().await,
            Some(CloseReason::Fatal("gone".into()))
        );
    }
}
