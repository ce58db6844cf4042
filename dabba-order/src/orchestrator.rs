use chrono::Utc;
use dabba_core::payment::{CreateGatewayOrder, GatewayError, GatewayOrder, GatewayRefund, PaymentGateway};
use dabba_core::{signature, to_minor_units};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::manager::OrderManager;
use crate::models::{Order, OrderStatus, PaymentStatus, PaymentUpdate, TransitionOptions};
use crate::repository::{OrderRepository, WebhookLedger};
use crate::webhook::{GatewayEvent, PaymentReport, WebhookEnvelope, INTERNAL_ORDER_NOTE};

/// Attempts made to settle a payment when concurrent writers keep moving the order.
const SETTLE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct GatewaySettings {
    /// Keys the checkout-callback signature
    pub key_secret: String,
    /// Keys the webhook body signature
    pub webhook_secret: String,
    pub currency: String,
    pub timeout: Duration,
}

/// Checkout callback sent by the client after the gateway's checkout completes.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutVerification {
    #[serde(alias = "orderId")]
    pub order_id: Uuid,
    #[serde(alias = "gatewayOrderRef", alias = "razorpay_order_id")]
    pub gateway_order_ref: String,
    #[serde(alias = "gatewayPaymentRef", alias = "razorpay_payment_id")]
    pub gateway_payment_ref: String,
    #[serde(alias = "razorpay_signature")]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Applied { order_id: Uuid, status: OrderStatus },
    Duplicate { event_id: String },
    UnknownOrder,
    Ignored { event: String },
}

#[derive(Debug, Clone)]
pub struct RefundReceipt {
    pub order: Order,
    pub refund: GatewayRefund,
}

/// Reconciles an order's payment record with what the gateway reports.
///
/// The checkout callback and the webhook both end in `settle_captured` /
/// `settle_failed`, so whichever arrives first decides the outcome and the
/// other finds nothing left to do.
pub struct PaymentOrchestrator {
    orders: Arc<OrderManager>,
    repo: Arc<dyn OrderRepository>,
    ledger: Arc<dyn WebhookLedger>,
    gateway: Arc<dyn PaymentGateway>,
    settings: GatewaySettings,
}

impl PaymentOrchestrator {
    pub fn new(
        orders: Arc<OrderManager>,
        repo: Arc<dyn OrderRepository>,
        ledger: Arc<dyn WebhookLedger>,
        gateway: Arc<dyn PaymentGateway>,
        settings: GatewaySettings,
    ) -> Self {
        Self { orders, repo, ledger, gateway, settings }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.settings.timeout)),
        }
    }

    async fn load(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.repo
            .get(order_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))
    }

    /// Create the gateway order a prepaid checkout pays against and link it to the order.
    pub async fn initialize_payment(
        &self,
        order_id: Uuid,
        principal_id: &str,
    ) -> Result<(Order, GatewayOrder), OrderError> {
        let order = self.load(order_id).await?;
        if !order.is_owned_by(principal_id) {
            return Err(OrderError::Forbidden(order_id.to_string()));
        }
        if !order.payment.method.is_prepaid() {
            return Err(OrderError::validation("payment.method: cash on delivery orders are not paid online"));
        }
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::PaymentFailed)
            || order.payment.payment_status == PaymentStatus::Completed
        {
            return Err(OrderError::InvalidTransition {
                from: order.status.to_string(),
                to: "awaiting payment".to_string(),
            });
        }

        let amount = to_minor_units(order.payment.total)
            .ok_or_else(|| OrderError::validation("payment.total: amount out of range"))?;
        let request = CreateGatewayOrder {
            order_id,
            amount,
            currency: self.settings.currency.clone(),
            receipt: format!("rcpt_{}", order_id.simple()),
            notes: HashMap::from([(INTERNAL_ORDER_NOTE.to_string(), order_id.to_string())]),
        };

        let gateway_order = self.bounded(self.gateway.create_order(&request)).await.map_err(|e| {
            error!(order_id = %order_id, error = %e, "Failed to create gateway order");
            OrderError::Gateway(e)
        })?;

        let current = order.payment.payment_status;
        let order = self
            .orders
            .update_payment(order_id, current, PaymentUpdate::linked(current, gateway_order.id.clone()))
            .await?;

        info!(order_id = %order_id, gateway_order_ref = %gateway_order.id, amount, "Gateway order created");
        Ok((order, gateway_order))
    }

    /// Checkout-callback verification.
    ///
    /// The callback must name the gateway order linked by `initialize_payment`.
    /// A valid signature confirms the order. A bad one marks a still-pending order
    /// `payment_failed` and always returns `InvalidSignature`.
    pub async fn verify_checkout(
        &self,
        request: &CheckoutVerification,
        principal_id: Option<&str>,
    ) -> Result<Order, OrderError> {
        let order = self.load(request.order_id).await?;
        if let Some(principal) = principal_id {
            if !order.is_owned_by(principal) {
                return Err(OrderError::Forbidden(order.id.to_string()));
            }
        }
        // Only a gateway order opened for this order can confirm it; cash on delivery
        // orders never have one.
        match order.payment.gateway_order_ref.as_deref() {
            Some(linked) if linked == request.gateway_order_ref => {}
            Some(_) => {
                return Err(OrderError::validation(format!(
                    "gateway_order_ref: does not match the gateway order linked to {}",
                    order.id
                )));
            }
            None => {
                return Err(OrderError::validation(format!(
                    "gateway_order_ref: no gateway order has been created for {}",
                    order.id
                )));
            }
        }
        if let Some(bound) = self.repo.find_by_gateway_order_ref(&request.gateway_order_ref).await? {
            if bound.id != order.id {
                warn!(
                    target: "security",
                    order_id = %order.id,
                    bound_order_id = %bound.id,
                    gateway_order_ref = %request.gateway_order_ref,
                    "Checkout callback names a gateway order bound to another order"
                );
                return Err(OrderError::validation(format!(
                    "gateway_order_ref: belongs to a different order than {}",
                    order.id
                )));
            }
        }

        let valid = signature::verify_checkout(
            &self.settings.key_secret,
            &request.gateway_order_ref,
            &request.gateway_payment_ref,
            &request.signature,
        );

        if !valid {
            warn!(
                target: "security",
                order_id = %order.id,
                gateway_order_ref = %request.gateway_order_ref,
                gateway_payment_ref = %request.gateway_payment_ref,
                "Checkout signature mismatch"
            );
            if order.status == OrderStatus::Pending {
                self.settle_failed(
                    order.id,
                    Some(request.gateway_payment_ref.clone()),
                    "checkout signature verification failed",
                )
                .await?;
            }
            return Err(OrderError::InvalidSignature);
        }

        self.settle_captured(
            order.id,
            Some(request.gateway_order_ref.clone()),
            request.gateway_payment_ref.clone(),
            "payment verified at checkout",
        )
        .await
    }

    /// Webhook verification over the exact bytes received.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
        event_id_header: Option<&str>,
    ) -> Result<WebhookOutcome, OrderError> {
        let valid = signature_header
            .map(|sig| signature::verify_webhook(&self.settings.webhook_secret, raw_body, sig))
            .unwrap_or(false);
        if !valid {
            warn!(
                target: "security",
                has_signature = signature_header.is_some(),
                body_len = raw_body.len(),
                "Webhook signature mismatch"
            );
            return Err(OrderError::InvalidSignature);
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| OrderError::validation(format!("body: malformed webhook payload: {}", e)))?;
        let event_id = event_id_header
            .map(str::to_string)
            .or_else(|| envelope.id.clone());

        if let Some(id) = &event_id {
            if !self.ledger.record(id, &envelope.event).await? {
                info!(event_id = %id, event = %envelope.event, "Duplicate webhook event, skipping");
                return Ok(WebhookOutcome::Duplicate { event_id: id.clone() });
            }
        }

        info!(event_id = ?event_id, event = %envelope.event, "Processing webhook");
        let result = self.dispatch(envelope.classify()).await;

        if let (Err(e), Some(id)) = (&result, &event_id) {
            warn!(event_id = %id, error = %e, "Webhook processing failed, releasing event for redelivery");
            if let Err(release_err) = self.ledger.release(id).await {
                error!(event_id = %id, error = %release_err, "Failed to release webhook event");
            }
        }
        result
    }

    async fn dispatch(&self, event: GatewayEvent) -> Result<WebhookOutcome, OrderError> {
        match event {
            GatewayEvent::PaymentCaptured(report) | GatewayEvent::OrderPaid(report) => {
                let Some(payment_ref) = report.gateway_payment_ref.clone() else {
                    warn!(?report, "Capture event without a payment reference");
                    return Ok(WebhookOutcome::UnknownOrder);
                };
                let Some(order) = self.correlate(&report).await? else {
                    return Ok(WebhookOutcome::UnknownOrder);
                };
                let order = self
                    .settle_captured(order.id, report.gateway_order_ref.clone(), payment_ref, "payment captured (webhook)")
                    .await?;
                Ok(WebhookOutcome::Applied { order_id: order.id, status: order.status })
            }
            GatewayEvent::PaymentFailed(report) => {
                let Some(order) = self.correlate(&report).await? else {
                    return Ok(WebhookOutcome::UnknownOrder);
                };
                let reason = report.failure_reason.as_deref().unwrap_or("payment failed (webhook)");
                let order = self.settle_failed(order.id, report.gateway_payment_ref.clone(), reason).await?;
                Ok(WebhookOutcome::Applied { order_id: order.id, status: order.status })
            }
            GatewayEvent::Ignored { event } => {
                debug!(event = %event, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored { event })
            }
        }
    }

    async fn correlate(&self, report: &PaymentReport) -> Result<Option<Order>, OrderError> {
        if let Some(gateway_ref) = &report.gateway_order_ref {
            if let Some(order) = self.repo.find_by_gateway_order_ref(gateway_ref).await? {
                return Ok(Some(order));
            }
        }
        if let Some(id) = report.internal_order_id {
            if let Some(order) = self.repo.get(id).await? {
                return Ok(Some(order));
            }
        }
        warn!(
            gateway_order_ref = ?report.gateway_order_ref,
            internal_order_id = ?report.internal_order_id,
            "Webhook does not match any order"
        );
        Ok(None)
    }

    /// Record a captured payment and confirm the order.
    async fn settle_captured(
        &self,
        order_id: Uuid,
        gateway_order_ref: Option<String>,
        payment_ref: String,
        note: &str,
    ) -> Result<Order, OrderError> {
        for _ in 0..SETTLE_ATTEMPTS {
            let order = self.load(order_id).await?;
            if matches!(
                order.payment.payment_status,
                PaymentStatus::Completed | PaymentStatus::Refunding | PaymentStatus::Refunded
            ) {
                debug!(order_id = %order_id, "Payment already settled");
                return Ok(order);
            }

            let update = PaymentUpdate::captured(gateway_order_ref.clone(), payment_ref.clone(), Utc::now());
            let attempt = match order.status {
                OrderStatus::Pending | OrderStatus::PaymentFailed => {
                    let options = TransitionOptions {
                        note: Some(note.to_string()),
                        payment: Some(update),
                        ..Default::default()
                    };
                    self.orders.transition(order_id, OrderStatus::Confirmed, options).await
                }
                status => {
                    if status == OrderStatus::Cancelled {
                        warn!(
                            order_id = %order_id,
                            gateway_payment_ref = %payment_ref,
                            "Payment captured for a cancelled order; refund required"
                        );
                    }
                    self.orders
                        .update_payment(order_id, order.payment.payment_status, update)
                        .await
                }
            };

            match attempt {
                Ok(order) if order.payment.payment_status == PaymentStatus::Completed => {
                    info!(order_id = %order_id, gateway_payment_ref = %payment_ref, "Payment captured");
                    return Ok(order);
                }
                // Someone else confirmed the order without recording the payment
                Ok(_) => continue,
                Err(OrderError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        let current = self.load(order_id).await?;
        Err(OrderError::InvalidTransition {
            from: current.status.to_string(),
            to: OrderStatus::Confirmed.to_string(),
        })
    }

    /// Record a failed payment. Only a pending order is moved to `payment_failed`;
    /// a failure reported after a capture is ignored.
    async fn settle_failed(
        &self,
        order_id: Uuid,
        payment_ref: Option<String>,
        reason: &str,
    ) -> Result<Order, OrderError> {
        let order = self.load(order_id).await?;
        if order.status != OrderStatus::Pending || order.payment.payment_status == PaymentStatus::Completed {
            debug!(order_id = %order_id, status = %order.status, "Payment failure does not change this order");
            return Ok(order);
        }

        let options = TransitionOptions {
            note: Some(reason.to_string()),
            payment: Some(PaymentUpdate::failed(payment_ref)),
            ..Default::default()
        };
        match self.orders.transition(order_id, OrderStatus::PaymentFailed, options).await {
            Ok(order) => {
                warn!(order_id = %order_id, reason, "Payment failed");
                Ok(order)
            }
            // The order moved on concurrently (captured or cancelled); keep that outcome.
            Err(OrderError::InvalidTransition { .. }) => self.load(order_id).await,
            Err(e) => Err(e),
        }
    }

    /// Refund a captured payment, fully or in part. The order status is not touched.
    pub async fn refund(&self, payment_ref: &str, amount: Option<Decimal>) -> Result<RefundReceipt, OrderError> {
        let order = self
            .repo
            .find_by_gateway_payment_ref(payment_ref)
            .await?
            .ok_or_else(|| OrderError::NotFound(payment_ref.to_string()))?;

        if order.payment.payment_status != PaymentStatus::Completed {
            return Err(OrderError::InvalidTransition {
                from: format!("payment {}", order.payment.payment_status),
                to: format!("payment {}", PaymentStatus::Refunded),
            });
        }

        let refund_amount = amount.unwrap_or(order.payment.total);
        if refund_amount <= Decimal::ZERO || refund_amount > order.payment.total {
            return Err(OrderError::validation(format!(
                "amount: must be greater than 0 and at most {}",
                order.payment.total
            )));
        }
        let minor = to_minor_units(refund_amount)
            .ok_or_else(|| OrderError::validation("amount: out of range"))?;
        let partial = amount.map(|_| minor);

        // Claim the payment before money moves; a concurrent refund fails the claim.
        let order = self
            .orders
            .update_payment(order.id, PaymentStatus::Completed, PaymentUpdate::status_only(PaymentStatus::Refunding))
            .await?;

        let refund = match self.bounded(self.gateway.refund(payment_ref, partial)).await {
            Ok(refund) => refund,
            Err(e) => {
                error!(
                    order_id = %order.id,
                    gateway_payment_ref = %payment_ref,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Refund failed"
                );
                if let Err(release_err) = self
                    .orders
                    .update_payment(order.id, PaymentStatus::Refunding, PaymentUpdate::status_only(PaymentStatus::Completed))
                    .await
                {
                    error!(order_id = %order.id, error = %release_err, "Failed to release refund claim");
                }
                return Err(OrderError::Gateway(e));
            }
        };

        let order = self
            .orders
            .update_payment(
                order.id,
                PaymentStatus::Refunding,
                PaymentUpdate::refunded(refund.id.clone(), refund_amount),
            )
            .await?;

        info!(order_id = %order.id, refund_ref = %refund.id, amount = %refund_amount, "Payment refunded");
        Ok(RefundReceipt { order, refund })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryOrderRepository, InMemoryWebhookLedger};
    use crate::validation::NewOrder;
    use dabba_core::payment::{MockFailure, MockPaymentGateway};
    use serde_json::json;

    const KEY_SECRET: &str = "key_secret_test";
    const WEBHOOK_SECRET: &str = "whsec_dabba_test";

    struct Harness {
        orchestrator: PaymentOrchestrator,
        orders: Arc<OrderManager>,
        repo: Arc<InMemoryOrderRepository>,
        gateway: Arc<MockPaymentGateway>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryOrderRepository::new());
        let orders = Arc::new(OrderManager::new(repo.clone()));
        let gateway = Arc::new(MockPaymentGateway::new());
        let orchestrator = PaymentOrchestrator::new(
            orders.clone(),
            repo.clone(),
            Arc::new(InMemoryWebhookLedger::new()),
            gateway.clone(),
            GatewaySettings {
                key_secret: KEY_SECRET.to_string(),
                webhook_secret: WEBHOOK_SECRET.to_string(),
                currency: "INR".to_string(),
                timeout: Duration::from_secs(2),
            },
        );
        Harness { orchestrator, orders, repo, gateway }
    }

    fn request(method: &str) -> NewOrder {
        serde_json::from_value(json!({
            "customer": {"name": "Asha Rao", "phone": "+91 98765 43210", "address": "12 MG Road"},
            "items": [{"product_id": "thali-01", "name": "Veg Thali", "unit_price": "10.00", "quantity": 2}],
            "payment": {"method": method, "subtotal": "20.00", "tax": "2.00", "delivery_fee": "3.00", "total": "25.00"}
        }))
        .unwrap()
    }

    fn callback(order_id: Uuid, gateway_order_ref: &str, payment_ref: &str, secret: &str) -> CheckoutVerification {
        let payload = signature::checkout_payload(gateway_order_ref, payment_ref);
        CheckoutVerification {
            order_id,
            gateway_order_ref: gateway_order_ref.to_string(),
            gateway_payment_ref: payment_ref.to_string(),
            signature: signature::sign(secret.as_bytes(), payload.as_bytes()),
        }
    }

    fn webhook_body(event: &str, gateway_order_ref: &str, payment_ref: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": event,
            "payload": {"payment": {"entity": {
                "id": payment_ref, "order_id": gateway_order_ref, "status": "captured", "amount": 2500
            }}}
        }))
        .unwrap()
    }

    fn sign_webhook(body: &[u8]) -> String {
        signature::sign(WEBHOOK_SECRET.as_bytes(), body)
    }

    async fn prepaid_order(h: &Harness) -> (Order, String) {
        let order = h.orders.create_order("user-1", request("online")).await.unwrap();
        let (_, gateway_order) = h.orchestrator.initialize_payment(order.id, "user-1").await.unwrap();
        (order, gateway_order.id)
    }

    #[tokio::test]
    async fn test_valid_callback_confirms_order() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;

        let verified = h
            .orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_29QQoUBi66xm2f", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();

        assert_eq!(verified.status(), OrderStatus::Confirmed);
        assert_eq!(verified.payment().payment_status, PaymentStatus::Completed);
        assert_eq!(verified.payment().gateway_payment_ref.as_deref(), Some("pay_29QQoUBi66xm2f"));
        assert!(verified.payment().paid_at.is_some());
        assert_eq!(verified.history().len(), 2);
    }

    #[tokio::test]
    async fn test_forged_callback_marks_payment_failed() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;

        let err = h
            .orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", "wrong_secret"), Some("user-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidSignature));

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::PaymentFailed);
        assert_eq!(stored.payment().payment_status, PaymentStatus::Failed);
        assert_eq!(stored.payment().total, order.payment().total);
        assert_eq!(stored.items.len(), order.items.len());
    }

    #[tokio::test]
    async fn test_forged_callback_cannot_downgrade_confirmed_order() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        h.orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_ok", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();

        let err = h
            .orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_evil", "wrong_secret"), Some("user-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidSignature));

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Confirmed);
        assert_eq!(stored.payment().gateway_payment_ref.as_deref(), Some("pay_ok"));
    }

    #[tokio::test]
    async fn test_callback_for_other_gateway_order_rejected() {
        let h = harness();
        let (order, _) = prepaid_order(&h).await;

        let err = h
            .orchestrator
            .verify_checkout(&callback(order.id, "order_someone_else", "pay_1", KEY_SECRET), Some("user-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));
        assert_eq!(h.repo.get(order.id).await.unwrap().unwrap().status(), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_paid_callback_cannot_be_replayed_on_another_order() {
        let h = harness();
        let (cheap, cheap_ref) = prepaid_order(&h).await;
        let paid = callback(cheap.id, &cheap_ref, "pay_cheap", KEY_SECRET);
        h.orchestrator.verify_checkout(&paid, Some("user-1")).await.unwrap();

        // Second online order that never opened a gateway order
        let pricey = h.orders.create_order("user-1", request("online")).await.unwrap();
        let replay = CheckoutVerification { order_id: pricey.id, ..paid.clone() };
        let err = h.orchestrator.verify_checkout(&replay, Some("user-1")).await.unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));

        // Once linked to its own gateway order, the foreign ref is still refused
        let (_, pricey_ref) = h.orchestrator.initialize_payment(pricey.id, "user-1").await.unwrap();
        assert_ne!(pricey_ref.id, cheap_ref);
        let err = h.orchestrator.verify_checkout(&replay, Some("user-1")).await.unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));

        let stored = h.repo.get(pricey.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Pending);
        assert_eq!(stored.payment().payment_status, PaymentStatus::Pending);
        assert_eq!(stored.payment().gateway_payment_ref, None);
    }

    #[tokio::test]
    async fn test_cash_on_delivery_order_cannot_be_confirmed_by_callback() {
        let h = harness();
        let order = h.orders.create_order("user-1", request("cash_on_delivery")).await.unwrap();

        let err = h
            .orchestrator
            .verify_checkout(&callback(order.id, "order_9A33XWu170gUtm", "pay_29QQoUBi66xm2f", KEY_SECRET), Some("user-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Pending);
        assert_eq!(stored.payment().payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_callback_by_non_owner_forbidden() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        let err = h
            .orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", KEY_SECRET), Some("user-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_webhook_capture_then_callback_is_idempotent() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;

        let body = webhook_body("payment.captured", &gateway_ref, "pay_1");
        let outcome = h
            .orchestrator
            .handle_webhook(&body, Some(&sign_webhook(&body)), Some("evt_1"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied { order_id: order.id, status: OrderStatus::Confirmed });

        let verified = h
            .orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();
        assert_eq!(verified.status(), OrderStatus::Confirmed);
        assert_eq!(verified.history().len(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_webhook_is_skipped() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        let body = webhook_body("payment.captured", &gateway_ref, "pay_1");
        let sig = sign_webhook(&body);

        h.orchestrator.handle_webhook(&body, Some(&sig), Some("evt_1")).await.unwrap();
        let second = h.orchestrator.handle_webhook(&body, Some(&sig), Some("evt_1")).await.unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate { event_id: "evt_1".to_string() });

        // A different event id for the same capture is a state-machine no-op
        let third = h.orchestrator.handle_webhook(&body, Some(&sig), Some("evt_2")).await.unwrap();
        assert_eq!(third, WebhookOutcome::Applied { order_id: order.id, status: OrderStatus::Confirmed });

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.history().len(), 2);
    }

    #[tokio::test]
    async fn test_tampered_webhook_rejected_without_effect() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        let body = webhook_body("payment.captured", &gateway_ref, "pay_1");
        let sig = sign_webhook(&body);

        let mut tampered = body.clone();
        let last = tampered.len() - 2;
        tampered[last] ^= 0x01;

        let err = h.orchestrator.handle_webhook(&tampered, Some(&sig), Some("evt_1")).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidSignature));
        let err = h.orchestrator.handle_webhook(&body, None, Some("evt_1")).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidSignature));

        assert_eq!(h.repo.get(order.id).await.unwrap().unwrap().status(), OrderStatus::Pending);

        // The rejected attempts did not burn the event id
        let outcome = h.orchestrator.handle_webhook(&body, Some(&sig), Some("evt_1")).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_webhook_failure_then_late_capture() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;

        let failed = webhook_body("payment.failed", &gateway_ref, "pay_declined");
        let outcome = h
            .orchestrator
            .handle_webhook(&failed, Some(&sign_webhook(&failed)), Some("evt_f"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied { order_id: order.id, status: OrderStatus::PaymentFailed });

        let captured = webhook_body("payment.captured", &gateway_ref, "pay_retry");
        h.orchestrator
            .handle_webhook(&captured, Some(&sign_webhook(&captured)), Some("evt_c"))
            .await
            .unwrap();

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        let statuses: Vec<_> = stored.history().entries().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![OrderStatus::Pending, OrderStatus::PaymentFailed, OrderStatus::Confirmed]);
        assert_eq!(stored.payment().gateway_payment_ref.as_deref(), Some("pay_retry"));
    }

    #[tokio::test]
    async fn test_unknown_and_ignored_events_are_acknowledged() {
        let h = harness();
        let body = webhook_body("payment.captured", "order_nobody", "pay_x");
        let outcome = h.orchestrator.handle_webhook(&body, Some(&sign_webhook(&body)), None).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::UnknownOrder);

        let body = br#"{"event":"refund.created","payload":{}}"#;
        let outcome = h.orchestrator.handle_webhook(body, Some(&sign_webhook(body)), None).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored { event: "refund.created".to_string() });
    }

    #[tokio::test]
    async fn test_refund_changes_only_payment_status() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        h.orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();

        let receipt = h.orchestrator.refund("pay_1", None).await.unwrap();
        assert_eq!(receipt.order.status(), OrderStatus::Confirmed);
        assert_eq!(receipt.order.payment().payment_status, PaymentStatus::Refunded);
        assert_eq!(receipt.order.payment().refunded_amount, Some(Decimal::from(25)));
        assert_eq!(receipt.order.history().len(), 2);

        // Second refund: payment is no longer captured
        let err = h.orchestrator.refund("pay_1", None).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
        assert_eq!(h.gateway.refund_count(), 1);
    }

    #[tokio::test]
    async fn test_refund_timeout_leaves_payment_completed() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        h.orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();

        h.gateway.fail_with(MockFailure::Timeout);
        let err = h.orchestrator.refund("pay_1", Some(Decimal::from(5))).await.unwrap_err();
        assert!(matches!(err, OrderError::Gateway(GatewayError::Timeout(_))));
        assert!(err.is_retryable());

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment().payment_status, PaymentStatus::Completed);
        assert_eq!(stored.payment().refund_ref, None);
    }

    #[tokio::test]
    async fn test_concurrent_refunds_reach_gateway_once() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        h.orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();

        h.gateway.respond_after(Duration::from_millis(100));
        let (a, b) = tokio::join!(
            h.orchestrator.refund("pay_1", Some(Decimal::from(10))),
            h.orchestrator.refund("pay_1", Some(Decimal::from(10))),
        );

        assert_eq!(h.gateway.refund_count(), 1);
        assert!(a.is_ok() != b.is_ok());
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment().payment_status, PaymentStatus::Refunded);
        assert_eq!(stored.payment().refunded_amount, Some(Decimal::from(10)));
    }

    #[tokio::test]
    async fn test_capture_during_refund_is_a_no_op() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        h.orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();
        h.orders
            .update_payment(order.id, PaymentStatus::Completed, PaymentUpdate::status_only(PaymentStatus::Refunding))
            .await
            .unwrap();

        let body = webhook_body("payment.captured", &gateway_ref, "pay_1");
        h.orchestrator.handle_webhook(&body, Some(&sign_webhook(&body)), Some("evt_late")).await.unwrap();

        let stored = h.repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment().payment_status, PaymentStatus::Refunding);
    }

    #[tokio::test]
    async fn test_refund_amount_bounds() {
        let h = harness();
        let (order, gateway_ref) = prepaid_order(&h).await;
        h.orchestrator
            .verify_checkout(&callback(order.id, &gateway_ref, "pay_1", KEY_SECRET), Some("user-1"))
            .await
            .unwrap();

        for bad in [Decimal::ZERO, Decimal::from(26)] {
            let err = h.orchestrator.refund("pay_1", Some(bad)).await.unwrap_err();
            assert!(matches!(err, OrderError::Validation(_)));
        }
        let err = h.orchestrator.refund("pay_unknown", None).await.unwrap_err();
        assert!(matches!(err, OrderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cash_on_delivery_cannot_open_gateway_order() {
        let h = harness();
        let order = h.orders.create_order("user-1", request("cash_on_delivery")).await.unwrap();
        let err = h.orchestrator.initialize_payment(order.id, "user-1").await.unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_initialize_payment_links_gateway_order() {
        let h = harness();
        let order = h.orders.create_order("user-1", request("gateway")).await.unwrap();
        let (linked, gateway_order) = h.orchestrator.initialize_payment(order.id, "user-1").await.unwrap();

        assert_eq!(gateway_order.amount, 2500);
        assert_eq!(gateway_order.currency, "INR");
        assert_eq!(linked.payment().gateway_order_ref.as_deref(), Some(gateway_order.id.as_str()));
        assert_eq!(linked.status(), OrderStatus::Pending);

        let err = h.orchestrator.initialize_payment(order.id, "user-2").await.unwrap_err();
        assert!(matches!(err, OrderError::Forbidden(_)));
    }
}
