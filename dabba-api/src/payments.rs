use axum::{
    extract::{rejection::JsonRejection, State},
    middleware,
    routing::post,
    Extension, Json, Router,
};
use dabba_order::{CheckoutVerification, Order};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::REFUND_PERMISSION;
use crate::middleware::{admin_auth_middleware, customer_auth_middleware, has_permission, AdminClaims, CustomerClaims};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreatePaymentOrderRequest {
    #[serde(alias = "orderId")]
    pub order_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PaymentOrderResponse {
    pub order_id: Uuid,
    pub gateway_order_ref: String,
    /// Minor units, as the checkout widget expects
    pub amount: i64,
    pub currency: String,
    pub key_id: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
    pub order: Order,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    #[serde(alias = "paymentRef")]
    pub payment_ref: String,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub refund_ref: String,
    pub amount: Option<Decimal>,
    pub order: Order,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let customer = Router::new()
        .route("/payment/create-order", post(create_payment_order))
        .route("/payment/verify", post(verify_payment))
        .route_layer(middleware::from_fn_with_state(state.clone(), customer_auth_middleware));

    let privileged = Router::new()
        .route("/payment/refund", post(refund_payment))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware));

    customer.merge(privileged)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /payment/create-order
async fn create_payment_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    payload: Result<Json<CreatePaymentOrderRequest>, JsonRejection>,
) -> Result<Json<PaymentOrderResponse>, AppError> {
    let Json(request) = payload?;
    let (order, gateway_order) = state.payments.initialize_payment(request.order_id, &claims.sub).await?;

    Ok(Json(PaymentOrderResponse {
        order_id: order.id,
        gateway_order_ref: gateway_order.id,
        amount: gateway_order.amount,
        currency: gateway_order.currency,
        key_id: state.gateway_key_id.clone(),
    }))
}

/// POST /payment/verify
async fn verify_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    payload: Result<Json<CheckoutVerification>, JsonRejection>,
) -> Result<Json<VerifyPaymentResponse>, AppError> {
    let Json(request) = payload?;
    let order = state.payments.verify_checkout(&request, Some(&claims.sub)).await?;
    Ok(Json(VerifyPaymentResponse { success: true, order }))
}

/// POST /payment/refund
async fn refund_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    payload: Result<Json<RefundRequest>, JsonRejection>,
) -> Result<Json<RefundResponse>, AppError> {
    if !has_permission(&claims, REFUND_PERMISSION) {
        return Err(AppError::Forbidden(format!("Missing permission {}", REFUND_PERMISSION)));
    }
    let Json(request) = payload?;
    if request.payment_ref.trim().is_empty() {
        return Err(AppError::validation("payment_ref: is required"));
    }

    let receipt = state.payments.refund(&request.payment_ref, request.amount).await?;
    tracing::info!(admin = %claims.sub, refund_ref = %receipt.refund.id, "Refund issued");

    Ok(Json(RefundResponse {
        refund_ref: receipt.refund.id,
        amount: receipt.order.payment().refunded_amount,
        order: receipt.order,
    }))
}
