use chrono::Utc;
use dabba_shared::models::events::OrderStatusChangedEvent;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::events::OrderEventPublisher;
use crate::models::{Order, OrderStatus, PaymentStatus, PaymentUpdate, TransitionOptions};
use crate::repository::OrderRepository;
use crate::validation::NewOrder;

/// Manages order lifecycle and state transitions.
///
/// This is the only writer of an order's status, history and payment record.
/// Each write is a single conditional store operation, so a concurrent writer
/// either sees its change applied or gets a typed error, never a silent overwrite.
pub struct OrderManager {
    repo: Arc<dyn OrderRepository>,
    publishers: Vec<Arc<dyn OrderEventPublisher>>,
    auto_confirm_cash_on_delivery: bool,
}

impl OrderManager {
    pub fn new(repo: Arc<dyn OrderRepository>) -> Self {
        Self {
            repo,
            publishers: Vec::new(),
            auto_confirm_cash_on_delivery: false,
        }
    }

    /// Confirm cash-on-delivery orders as soon as they are placed.
    pub fn with_cash_on_delivery_auto_confirm(mut self, enabled: bool) -> Self {
        self.auto_confirm_cash_on_delivery = enabled;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn OrderEventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Validate and persist a new order in `pending`. Nothing is stored on failure.
    pub async fn create_order(&self, owner_id: &str, request: NewOrder) -> Result<Order, OrderError> {
        if owner_id.trim().is_empty() {
            return Err(OrderError::validation("owner: an authenticated principal is required"));
        }
        let valid = request.validate()?;
        let order = Order::new(owner_id.to_string(), valid.customer, valid.items, valid.payment);

        self.repo.insert(&order).await?;

        info!(
            order_id = %order.id,
            owner_id = %order.owner_id,
            method = order.payment.method.as_str(),
            total = %order.payment.total,
            "Order created"
        );

        if self.auto_confirm_cash_on_delivery && !order.payment.method.is_prepaid() {
            return self
                .transition(order.id, OrderStatus::Confirmed, TransitionOptions::with_note("Cash on delivery order confirmed"))
                .await;
        }
        Ok(order)
    }

    /// Move an order to `target`.
    ///
    /// Asking for the status the order already holds is a no-op that returns the
    /// current record without touching history.
    pub async fn transition(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        options: TransitionOptions,
    ) -> Result<Order, OrderError> {
        let mut order = self.load(order_id).await?;

        if order.status == target {
            debug!(order_id = %order_id, status = %target, "Transition is a no-op");
            return Ok(order);
        }

        let from = order.status;
        order.apply_transition(target, options, Utc::now())?;

        if !self.repo.save_transition(&order, from).await? {
            // Lost the race: someone moved the order since we read it.
            let current = self.load(order_id).await?;
            if current.status == target {
                debug!(order_id = %order_id, status = %target, "Concurrent writer reached the same status");
                return Ok(current);
            }
            warn!(
                order_id = %order_id,
                expected = %from,
                actual = %current.status,
                target = %target,
                "Transition lost a concurrent update"
            );
            return Err(OrderError::InvalidTransition {
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }

        info!(order_id = %order_id, from = %from, to = %target, "Order status changed");
        self.publish(&order, from).await;
        Ok(order)
    }

    /// Apply a payment change without moving the status, provided the stored
    /// payment is still in `expected`.
    pub async fn update_payment(
        &self,
        order_id: Uuid,
        expected: PaymentStatus,
        update: PaymentUpdate,
    ) -> Result<Order, OrderError> {
        let mut order = self.load(order_id).await?;
        let target = update.status;

        if order.payment.payment_status != expected {
            return Err(OrderError::InvalidTransition {
                from: format!("payment {}", order.payment.payment_status),
                to: format!("payment {}", target),
            });
        }

        order.apply_payment(update, Utc::now());

        if !self.repo.save_payment(&order, expected).await? {
            let current = self.load(order_id).await?;
            return Err(OrderError::InvalidTransition {
                from: format!("payment {}", current.payment.payment_status),
                to: format!("payment {}", target),
            });
        }

        info!(order_id = %order_id, from = %expected, to = %target, "Payment record updated");
        Ok(order)
    }

    async fn load(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.repo
            .get(order_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))
    }

    async fn publish(&self, order: &Order, from: OrderStatus) {
        if self.publishers.is_empty() {
            return;
        }
        let event = OrderStatusChangedEvent {
            order_id: order.id,
            owner_id: order.owner_id.clone(),
            from: from.to_string(),
            to: order.status.to_string(),
            note: order.status_history.last().and_then(|e| e.note.clone()),
            occurred_at: order.updated_at,
        };
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(&event).await {
                warn!(order_id = %order.id, error = %e, "Failed to publish order status event");
            }
        }
    }
}
