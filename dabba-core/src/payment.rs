use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Request for a gateway-side order (the payment intent a checkout is opened against).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGatewayOrder {
    pub order_id: Uuid,
    /// Amount in minor units (paise/cents)
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String, // Provider's ID (e.g., order_9A33XWu170gUtm)
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub payment_id: String,
    pub amount: i64,
    pub status: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Payment gateway timed out after {0:?}")]
    Timeout(Duration),

    #[error("Payment gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Payment gateway unreachable: {0}")]
    Transport(String),

    #[error("Unexpected payment gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Timeouts, transport failures and 5xx answers may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout(_) | GatewayError::Transport(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500,
            GatewayError::InvalidResponse(_) => false,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a gateway order that the customer's checkout will pay against
    async fn create_order(&self, request: &CreateGatewayOrder) -> Result<GatewayOrder, GatewayError>;

    /// Refund a captured payment, fully when `amount` is `None`
    async fn refund(&self, payment_ref: &str, amount: Option<i64>) -> Result<GatewayRefund, GatewayError>;
}

/// Failure injected into the next call of a [`MockPaymentGateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    None,
    Timeout,
    Rejected,
}

/// In-process gateway for local runs and tests.
pub struct MockPaymentGateway {
    failure: std::sync::Mutex<MockFailure>,
    latency: std::sync::Mutex<Duration>,
    refunds: AtomicUsize,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self {
            failure: std::sync::Mutex::new(MockFailure::None),
            latency: std::sync::Mutex::new(Duration::ZERO),
            refunds: AtomicUsize::new(0),
        }
    }

    pub fn fail_with(&self, failure: MockFailure) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = failure;
        }
    }

    /// Delay every call by `latency` before answering.
    pub fn respond_after(&self, latency: Duration) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    async fn wait(&self) {
        let latency = self.latency.lock().map(|l| *l).unwrap_or(Duration::ZERO);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn refund_count(&self) -> usize {
        self.refunds.load(Ordering::SeqCst)
    }

    fn injected(&self) -> Result<(), GatewayError> {
        let failure = self.failure.lock().map(|f| *f).unwrap_or(MockFailure::None);
        match failure {
            MockFailure::None => Ok(()),
            MockFailure::Timeout => Err(GatewayError::Timeout(Duration::from_millis(1))),
            MockFailure::Rejected => Err(GatewayError::Rejected {
                status: 400,
                message: "BAD_REQUEST_ERROR".to_string(),
            }),
        }
    }
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_order(&self, request: &CreateGatewayOrder) -> Result<GatewayOrder, GatewayError> {
        self.wait().await;
        self.injected()?;
        Ok(GatewayOrder {
            // Encode the order id so repeated runs stay recognisable in logs
            id: format!("order_mock_{}", request.order_id.simple()),
            amount: request.amount,
            currency: request.currency.clone(),
            status: "created".to_string(),
            created_at: Utc::now(),
        })
    }

    async fn refund(&self, payment_ref: &str, amount: Option<i64>) -> Result<GatewayRefund, GatewayError> {
        self.wait().await;
        self.injected()?;
        let n = self.refunds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayRefund {
            id: format!("rfnd_mock_{}", n),
            payment_id: payment_ref.to_string(),
            amount: amount.unwrap_or(0),
            status: "processed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateGatewayOrder {
        CreateGatewayOrder {
            order_id: Uuid::new_v4(),
            amount: 2500,
            currency: "INR".to_string(),
            receipt: "rcpt_1".to_string(),
            notes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_creates_order() {
        let gateway = MockPaymentGateway::new();
        let req = request();
        let order = gateway.create_order(&req).await.unwrap();

        assert!(order.id.starts_with("order_mock_"));
        assert_eq!(order.amount, 2500);
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_with(MockFailure::Timeout);

        let err = gateway.refund("pay_1", None).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(gateway.refund_count(), 0);

        gateway.fail_with(MockFailure::Rejected);
        let err = gateway.create_order(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
