use async_trait::async_trait;
use dabba_order::events::OrderEventPublisher;
use dabba_shared::models::events::{OrderStatusChangedEvent, ORDER_STATUS_CHANGED_TOPIC};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{error, info};

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    /// Enqueue a record and return without waiting for the broker. The delivery
    /// report is logged from a background task.
    pub fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload);

        let delivery = self.producer.send_result(record).map_err(|(e, _record)| {
            error!(topic, key, error = %e, "Failed to enqueue event");
            e
        })?;

        let topic = topic.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(delivery)) => info!(
                    topic = %topic,
                    key = %key,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Event delivered"
                ),
                Ok(Err((e, _msg))) => error!(topic = %topic, key = %key, error = %e, "Failed to deliver event"),
                Err(_) => error!(topic = %topic, key = %key, "Event delivery cancelled"),
            }
        });
        Ok(())
    }
}

/// Publishes order status changes to Kafka, keyed by order id so a consumer
/// sees one order's changes in order.
pub struct KafkaPublisher {
    producer: EventProducer,
}

impl KafkaPublisher {
    pub fn new(producer: EventProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl OrderEventPublisher for KafkaPublisher {
    async fn publish(&self, event: &OrderStatusChangedEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let payload = serde_json::to_string(event)?;
        self.producer
            .publish(ORDER_STATUS_CHANGED_TOPIC, &event.order_id.to_string(), &payload)?;
        Ok(())
    }
}
