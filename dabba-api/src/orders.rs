use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use dabba_order::{NewOrder, Order, OrderStatus, Page, TransitionOptions};
use serde::Deserialize;
use tracing::info;

use crate::error::AppError;
use crate::middleware::{customer_auth_middleware, CustomerClaims};
use crate::state::AppState;

/// Statuses from which a customer may still cancel; later on only the back office can.
const CUSTOMER_CANCELLABLE: [OrderStatus; 3] = [OrderStatus::Pending, OrderStatus::Confirmed, OrderStatus::PaymentFailed];

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/history", get(order_history))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route_layer(middleware::from_fn_with_state(state, customer_auth_middleware))
}

/// POST /orders
async fn create_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    payload: Result<Json<NewOrder>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let Json(request) = payload?;
    let order = state.orders.create_order(&claims.sub, request).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders/history?page=&limit=
async fn order_history(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Page<Order>>, AppError> {
    let Query(query) = query?;
    let page = state.page_request(query.page, query.limit);
    Ok(Json(state.queries.get_history(&claims.sub, page).await?))
}

/// GET /orders/{id}
async fn get_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Path(id): Path<String>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.queries.get_by_id(&id, Some(&claims.sub)).await?))
}

/// POST /orders/{id}/cancel
async fn cancel_order(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    Path(id): Path<String>,
    payload: Result<Json<CancelOrderRequest>, JsonRejection>,
) -> Result<Json<Order>, AppError> {
    let Json(request) = payload?;
    let order = state.queries.get_by_id(&id, Some(&claims.sub)).await?;

    if !CUSTOMER_CANCELLABLE.contains(&order.status()) {
        return Err(AppError::InvalidTransition(format!(
            "Order can no longer be cancelled by the customer once it is {}",
            order.status()
        )));
    }

    let reason = request.reason.unwrap_or_default();
    let order = state
        .orders
        .transition(order.id, OrderStatus::Cancelled, TransitionOptions::cancellation(reason))
        .await?;

    info!(order_id = %order.id, owner_id = %claims.sub, "Order cancelled by customer");
    Ok(Json(order))
}
