use chrono::{DateTime, Utc};
use dabba_shared::Masked;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::OrderError;

/// Order status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    OutForDelivery,
    Delivered,
    Cancelled,
    PaymentFailed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::OutForDelivery,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::PaymentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::PaymentFailed => "payment_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// The permitted edges of the order state machine.
    ///
    /// `payment_failed -> confirmed` lets a capture that arrives after a failed
    /// attempt reconcile the order.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;
        match (*self, target) {
            (Pending, Confirmed) | (Pending, PaymentFailed) | (PaymentFailed, Confirmed) => true,
            (Confirmed, Preparing) | (Preparing, OutForDelivery) | (OutForDelivery, Delivered) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OrderError::Validation(vec![format!("unknown order status '{}'", s)]))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[serde(alias = "cod")]
    CashOnDelivery,
    Online,
    Gateway,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CashOnDelivery => "cash_on_delivery",
            PaymentMethod::Online => "online",
            PaymentMethod::Gateway => "gateway",
        }
    }

    /// Online and gateway orders are settled through the payment gateway.
    pub fn is_prepaid(&self) -> bool {
        !matches!(self, PaymentMethod::CashOnDelivery)
    }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash_on_delivery" | "cod" => Ok(PaymentMethod::CashOnDelivery),
            "online" => Ok(PaymentMethod::Online),
            "gateway" => Ok(PaymentMethod::Gateway),
            other => Err(OrderError::Validation(vec![format!("unknown payment method '{}'", other)])),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    /// Claimed by a refund that is in flight at the gateway
    Refunding,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunding => "refunding",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunding" => Ok(PaymentStatus::Refunding),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(OrderError::Validation(vec![format!("unknown payment status '{}'", other)])),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Delivery contact captured when the order is placed. Later profile edits do not touch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub name: String,
    pub phone: Masked<String>,
    pub address: String,
    pub instructions: Option<String>,
    pub location: Option<GeoPoint>,
}

/// A product line within an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub method: PaymentMethod,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub delivery_fee: Decimal,
    pub total: Decimal,
    pub payment_status: PaymentStatus,
    pub gateway_order_ref: Option<String>,
    pub gateway_payment_ref: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refund_ref: Option<String>,
    pub refunded_amount: Option<Decimal>,
}

/// A change to the payment sub-record, applied by the lifecycle engine.
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub gateway_order_ref: Option<String>,
    pub gateway_payment_ref: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refund_ref: Option<String>,
    pub refunded_amount: Option<Decimal>,
}

impl PaymentUpdate {
    pub fn captured(gateway_order_ref: Option<String>, gateway_payment_ref: String, paid_at: DateTime<Utc>) -> Self {
        Self {
            status: PaymentStatus::Completed,
            gateway_order_ref,
            gateway_payment_ref: Some(gateway_payment_ref),
            paid_at: Some(paid_at),
            refund_ref: None,
            refunded_amount: None,
        }
    }

    pub fn failed(gateway_payment_ref: Option<String>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            gateway_order_ref: None,
            gateway_payment_ref,
            paid_at: None,
            refund_ref: None,
            refunded_amount: None,
        }
    }

    pub fn refunded(refund_ref: String, amount: Decimal) -> Self {
        Self {
            status: PaymentStatus::Refunded,
            gateway_order_ref: None,
            gateway_payment_ref: None,
            paid_at: None,
            refund_ref: Some(refund_ref),
            refunded_amount: Some(amount),
        }
    }

    /// Moves the payment between `completed` and `refunding` without touching the refs.
    pub fn status_only(status: PaymentStatus) -> Self {
        Self {
            status,
            gateway_order_ref: None,
            gateway_payment_ref: None,
            paid_at: None,
            refund_ref: None,
            refunded_amount: None,
        }
    }

    /// Only links the gateway order, leaving the payment status as it is.
    pub fn linked(current: PaymentStatus, gateway_order_ref: String) -> Self {
        Self {
            status: current,
            gateway_order_ref: Some(gateway_order_ref),
            gateway_payment_ref: None,
            paid_at: None,
            refund_ref: None,
            refunded_amount: None,
        }
    }
}

impl Payment {
    pub(crate) fn apply(&mut self, update: PaymentUpdate) {
        self.payment_status = update.status;
        if update.gateway_order_ref.is_some() {
            self.gateway_order_ref = update.gateway_order_ref;
        }
        if update.gateway_payment_ref.is_some() {
            self.gateway_payment_ref = update.gateway_payment_ref;
        }
        if update.paid_at.is_some() {
            self.paid_at = update.paid_at;
        }
        if update.refund_ref.is_some() {
            self.refund_ref = update.refund_ref;
        }
        if update.refunded_amount.is_some() {
            self.refunded_amount = update.refunded_amount;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEntry {
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub note: Option<String>,
}

/// Append-only audit trail of every status an order has held.
///
/// Entries can only be added at the end, and a new entry never carries a
/// timestamp earlier than the one before it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StatusHistory(Vec<StatusEntry>);

impl StatusHistory {
    pub fn entries(&self) -> &[StatusEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&StatusEntry> {
        self.0.last()
    }

    pub(crate) fn append(&mut self, mut entry: StatusEntry) {
        if let Some(prev) = self.0.last() {
            if entry.timestamp < prev.timestamp {
                entry.timestamp = prev.timestamp;
            }
        }
        self.0.push(entry);
    }
}

/// Options carried by a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    pub note: Option<String>,
    /// Required when cancelling
    pub reason: Option<String>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    /// Payment change committed in the same write as the status change
    pub payment: Option<PaymentUpdate>,
}

impl TransitionOptions {
    pub fn with_note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Default::default()
        }
    }

    pub fn cancellation(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// The single source of truth for a customer's purchase.
///
/// Status, history, payment and terminal metadata are only writable inside this
/// crate; everything outside goes through [`crate::OrderManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub owner_id: String,
    pub customer: CustomerSnapshot,
    pub items: Vec<LineItem>,
    pub(crate) payment: Payment,
    pub(crate) status: OrderStatus,
    pub(crate) status_history: StatusHistory,
    pub(crate) estimated_delivery_time: Option<DateTime<Utc>>,
    pub(crate) delivered_at: Option<DateTime<Utc>>,
    pub(crate) cancelled_at: Option<DateTime<Utc>>,
    pub(crate) cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

/// Every stored field of an order, used by stores to rebuild a record.
#[derive(Debug, Clone)]
pub struct OrderParts {
    pub id: Uuid,
    pub owner_id: String,
    pub customer: CustomerSnapshot,
    pub items: Vec<LineItem>,
    pub payment: Payment,
    pub status: OrderStatus,
    pub status_history: Vec<StatusEntry>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub(crate) fn new(
        owner_id: String,
        customer: CustomerSnapshot,
        items: Vec<LineItem>,
        payment: Payment,
    ) -> Self {
        let now = Utc::now();
        let mut status_history = StatusHistory::default();
        status_history.append(StatusEntry {
            status: OrderStatus::Pending,
            timestamp: now,
            note: Some("Order placed".to_string()),
        });

        Self {
            id: Uuid::new_v4(),
            owner_id,
            customer,
            items,
            payment,
            status: OrderStatus::Pending,
            status_history,
            estimated_delivery_time: None,
            delivered_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn restore(parts: OrderParts) -> Self {
        Self {
            id: parts.id,
            owner_id: parts.owner_id,
            customer: parts.customer,
            items: parts.items,
            payment: parts.payment,
            status: parts.status,
            status_history: StatusHistory(parts.status_history),
            estimated_delivery_time: parts.estimated_delivery_time,
            delivered_at: parts.delivered_at,
            cancelled_at: parts.cancelled_at,
            cancellation_reason: parts.cancellation_reason,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment(&self) -> &Payment {
        &self.payment
    }

    pub fn history(&self) -> &StatusHistory {
        &self.status_history
    }

    pub fn estimated_delivery_time(&self) -> Option<DateTime<Utc>> {
        self.estimated_delivery_time
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_owned_by(&self, principal_id: &str) -> bool {
        self.owner_id == principal_id
    }

    /// Moves the order along one edge of the state machine and appends the
    /// matching history entry. Nothing is changed when the edge is not permitted.
    pub(crate) fn apply_transition(
        &mut self,
        target: OrderStatus,
        options: TransitionOptions,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        if !self.status.can_transition_to(target) {
            return Err(OrderError::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        let reason = options
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        if target == OrderStatus::Cancelled && reason.is_none() {
            return Err(OrderError::Validation(vec![
                "reason: a cancellation reason is required".to_string(),
            ]));
        }

        self.status = target;
        self.status_history.append(StatusEntry {
            status: target,
            timestamp: now,
            note: options.note.or_else(|| reason.clone()),
        });

        match target {
            OrderStatus::Delivered => self.delivered_at = Some(now),
            OrderStatus::Cancelled => {
                self.cancelled_at = Some(now);
                self.cancellation_reason = reason;
            }
            _ => {}
        }

        if let Some(eta) = options.estimated_delivery_time {
            self.estimated_delivery_time = Some(eta);
        }
        if let Some(update) = options.payment {
            self.payment.apply(update);
        }
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn apply_payment(&mut self, update: PaymentUpdate, now: DateTime<Utc>) {
        self.payment.apply(update);
        self.updated_at = now;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_order_is_pending_with_seeded_history() {
        let order = fixtures::order();
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.history().len(), 1);
        assert_eq!(order.history().entries()[0].status, OrderStatus::Pending);
    }

    #[test]
    fn test_permitted_edges() {
        use OrderStatus::*;
        let allowed = [
            (Pending, Confirmed),
            (Pending, PaymentFailed),
            (PaymentFailed, Confirmed),
            (Confirmed, Preparing),
            (Preparing, OutForDelivery),
            (OutForDelivery, Delivered),
            (Pending, Cancelled),
            (Confirmed, Cancelled),
            (Preparing, Cancelled),
            (OutForDelivery, Cancelled),
            (PaymentFailed, Cancelled),
        ];

        for from in OrderStatus::ALL {
            for to in OrderStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in OrderStatus::ALL {
            assert!(!OrderStatus::Delivered.can_transition_to(to));
            assert!(!OrderStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn test_rejected_transition_leaves_order_untouched() {
        let mut order = fixtures::order();
        let before = serde_json::to_value(&order).unwrap();

        let err = order
            .apply_transition(OrderStatus::Delivered, TransitionOptions::default(), Utc::now())
            .unwrap_err();

        assert!(matches!(err, OrderError::InvalidTransition { .. }));
        assert_eq!(serde_json::to_value(&order).unwrap(), before);
    }

    #[test]
    fn test_cancel_requires_reason() {
        let mut order = fixtures::order();
        let err = order
            .apply_transition(OrderStatus::Cancelled, TransitionOptions::cancellation("  "), Utc::now())
            .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.history().len(), 1);
    }

    #[test]
    fn test_history_timestamps_never_go_backwards() {
        let mut order = fixtures::order();
        let seeded = order.history().entries()[0].timestamp;

        order
            .apply_transition(OrderStatus::Confirmed, TransitionOptions::default(), seeded - Duration::seconds(30))
            .unwrap();

        assert_eq!(order.history().entries()[1].timestamp, seeded);
    }

    #[test]
    fn test_status_round_trips_through_wire_name() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
        assert!("shipped".parse::<OrderStatus>().is_err());
    }
}
