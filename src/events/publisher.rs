use super::{ProcessedMessage, ProvisionerEvent};
use crate::constants::system;
use crate::reconciler::ConfigSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast publisher for provisioner events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<ProvisionerEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: ProvisionerEvent) {
        if self.sender.send(event).is_err() {
            trace!("Event published without subscribers");
        }
    }

    pub fn publish_reloaded(&self, configs: Arc<ConfigSet>) {
        self.publish(ProvisionerEvent::Reloaded { configs });
    }

    pub fn publish_processed(&self, processed: ProcessedMessage) {
        self.publish(ProvisionerEvent::Processed(processed));
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionerEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(system::EVENT_CHANNEL_CAPACITY)
    }
}
