use async_trait::async_trait;
use dabba_shared::models::events::OrderStatusChangedEvent;
use tokio::sync::broadcast;

/// Receives status changes after they are committed. Failures are logged by the
/// caller and never undo the change.
#[async_trait]
pub trait OrderEventPublisher: Send + Sync {
    async fn publish(&self, event: &OrderStatusChangedEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Fans status changes out to in-process subscribers (the admin live feed).
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<OrderStatusChangedEvent>,
}

impl BroadcastPublisher {
    pub fn new(tx: broadcast::Sender<OrderStatusChangedEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl OrderEventPublisher for BroadcastPublisher {
    async fn publish(&self, event: &OrderStatusChangedEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
