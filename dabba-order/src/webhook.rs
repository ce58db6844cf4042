//! Gateway webhook payloads and the closed set of events this service acts on.

use serde::Deserialize;
use uuid::Uuid;

pub const INTERNAL_ORDER_NOTE: &str = "internal_order_id";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: Option<String>,
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<Entity<PaymentEntity>>,
    pub order: Option<Entity<GatewayOrderEntity>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entity<T> {
    pub entity: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub order_id: Option<String>,
    pub status: Option<String>,
    pub amount: Option<i64>,
    pub error_description: Option<String>,
    /// An object when set; the gateway sends `[]` when empty
    #[serde(default)]
    pub notes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayOrderEntity {
    pub id: String,
    pub status: Option<String>,
    #[serde(default)]
    pub notes: serde_json::Value,
}

/// What a webhook says about one payment, with every way of finding the order.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentReport {
    pub gateway_order_ref: Option<String>,
    pub gateway_payment_ref: Option<String>,
    pub internal_order_id: Option<Uuid>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    PaymentCaptured(PaymentReport),
    PaymentFailed(PaymentReport),
    OrderPaid(PaymentReport),
    Ignored { event: String },
}

fn internal_order_id(notes: &serde_json::Value) -> Option<Uuid> {
    notes
        .get(INTERNAL_ORDER_NOTE)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

impl WebhookEnvelope {
    fn report(&self) -> PaymentReport {
        let payment = self.payload.payment.as_ref().map(|p| &p.entity);
        let order = self.payload.order.as_ref().map(|o| &o.entity);

        PaymentReport {
            gateway_order_ref: payment
                .and_then(|p| p.order_id.clone())
                .or_else(|| order.map(|o| o.id.clone())),
            gateway_payment_ref: payment.map(|p| p.id.clone()),
            internal_order_id: payment
                .and_then(|p| internal_order_id(&p.notes))
                .or_else(|| order.and_then(|o| internal_order_id(&o.notes))),
            failure_reason: payment.and_then(|p| p.error_description.clone()),
        }
    }

    pub fn classify(&self) -> GatewayEvent {
        match self.event.as_str() {
            "payment.captured" => GatewayEvent::PaymentCaptured(self.report()),
            "payment.failed" => GatewayEvent::PaymentFailed(self.report()),
            "order.paid" => GatewayEvent::OrderPaid(self.report()),
            other => GatewayEvent::Ignored { event: other.to_string() },
        }
    }
}
