use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use dabba_order::WebhookOutcome;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";
pub const EVENT_ID_HEADER: &str = "x-razorpay-event-id";

/// Signature-authenticated, so it sits outside the session middleware and the rate limiter.
pub fn routes() -> Router<AppState> {
    Router::new().route("/payment/webhook", post(handle_gateway_webhook))
}

/// POST /payment/webhook
///
/// The body is taken as raw bytes: the signature covers exactly what was sent.
async fn handle_gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let event_id = headers.get(EVENT_ID_HEADER).and_then(|v| v.to_str().ok());

    let outcome = state.payments.handle_webhook(&body, signature, event_id).await?;

    let body = match outcome {
        WebhookOutcome::Applied { order_id, status } => {
            json!({"status": "processed", "order_id": order_id, "order_status": status})
        }
        WebhookOutcome::Duplicate { event_id } => json!({"status": "duplicate", "event_id": event_id}),
        WebhookOutcome::UnknownOrder => json!({"status": "unknown_order"}),
        WebhookOutcome::Ignored { event } => json!({"status": "ignored", "event": event}),
    };
    Ok(Json(body))
}
