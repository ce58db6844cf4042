use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dabba_core::payment::{CreateGatewayOrder, GatewayError, GatewayOrder, GatewayRefund, PaymentGateway};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Razorpay Orders/Refunds API client (HTTP basic auth with the key pair).
#[derive(Clone)]
pub struct RazorpayGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct OrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    notes: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct RefundBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    created_at: i64,
}

#[derive(Deserialize)]
struct RefundResponse {
    id: String,
    payment_id: String,
    amount: i64,
    status: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    description: Option<String>,
}

impl RazorpayGateway {
    pub fn new(base_url: &str, key_id: &str, key_secret: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            key_secret: key_secret.to_string(),
            timeout,
        })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Calling payment gateway");

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let message = match resp.json::<ErrorResponse>().await {
                Ok(body) => body.error.description.unwrap_or_else(|| status.to_string()),
                Err(_) => status.to_string(),
            };
            warn!(url = %url, status = status.as_u16(), message = %message, "Payment gateway rejected request");
            return Err(GatewayError::Rejected { status: status.as_u16(), message });
        }

        resp.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.timeout)
            } else {
                GatewayError::InvalidResponse(e.to_string())
            }
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(&self, request: &CreateGatewayOrder) -> Result<GatewayOrder, GatewayError> {
        let body = OrderBody {
            amount: request.amount,
            currency: &request.currency,
            receipt: &request.receipt,
            notes: &request.notes,
        };
        let resp: OrderResponse = self.post("/v1/orders", &body).await?;

        let created_at = Utc
            .timestamp_opt(resp.created_at, 0)
            .single()
            .ok_or_else(|| GatewayError::InvalidResponse(format!("bad created_at {}", resp.created_at)))?;

        Ok(GatewayOrder {
            id: resp.id,
            amount: resp.amount,
            currency: resp.currency,
            status: resp.status,
            created_at,
        })
    }

    async fn refund(&self, payment_ref: &str, amount: Option<i64>) -> Result<GatewayRefund, GatewayError> {
        let path = format!("/v1/payments/{}/refund", payment_ref);
        let resp: RefundResponse = self.post(&path, &RefundBody { amount }).await?;

        Ok(GatewayRefund {
            id: resp.id,
            payment_id: resp.payment_id,
            amount: resp.amount,
            status: resp.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer, timeout: Duration) -> RazorpayGateway {
        RazorpayGateway::new(&server.uri(), "rzp_test_key", "key_secret_test", timeout).unwrap()
    }

    fn request() -> CreateGatewayOrder {
        CreateGatewayOrder {
            order_id: Uuid::new_v4(),
            amount: 2500,
            currency: "INR".to_string(),
            receipt: "rcpt_1".to_string(),
            notes: HashMap::from([("internal_order_id".to_string(), "abc".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_create_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({"amount": 2500, "currency": "INR", "notes": {"internal_order_id": "abc"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "order_9A33XWu170gUtm", "entity": "order", "amount": 2500,
                "currency": "INR", "receipt": "rcpt_1", "status": "created", "created_at": 1700000000
            })))
            .mount(&server)
            .await;

        let order = gateway(&server, Duration::from_secs(2)).create_order(&request()).await.unwrap();
        assert_eq!(order.id, "order_9A33XWu170gUtm");
        assert_eq!(order.amount, 2500);
        assert_eq!(order.created_at.timestamp(), 1700000000);
    }

    #[tokio::test]
    async fn test_rejection_carries_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/pay_1/refund"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": "BAD_REQUEST_ERROR", "description": "The payment has been fully refunded already"}
            })))
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_secs(2)).refund("pay_1", None).await.unwrap_err();
        match err {
            GatewayError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "The payment has been fully refunded already");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/pay_1/refund"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "rfnd_1", "payment_id": "pay_1", "amount": 500, "status": "processed"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_millis(50)).refund("pay_1", Some(500)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
