use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, patch},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use dabba_order::query::parse_order_id;
use dabba_order::{Order, OrderStatus, Page, TransitionOptions};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::error::AppError;
use crate::middleware::{admin_auth_middleware, AdminClaims};
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub note: Option<String>,
    pub reason: Option<String>,
    #[serde(alias = "estimatedDeliveryTime")]
    pub estimated_delivery_time: Option<DateTime<Utc>>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/orders", get(list_orders))
        .route("/admin/orders/events", get(order_events))
        .route("/admin/orders/{id}", get(get_order))
        .route("/admin/orders/{id}/status", patch(update_status))
        .route("/orders/{id}/status", patch(update_status))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}

// ============================================================================
// Order Handlers
// ============================================================================

/// GET /admin/orders?status=&page=&limit=
async fn list_orders(
    State(state): State<AppState>,
    query: Result<Query<ListOrdersQuery>, QueryRejection>,
) -> Result<Json<Page<Order>>, AppError> {
    let Query(query) = query?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<OrderStatus>)
        .transpose()?;
    let page = state.page_request(query.page, query.limit);
    Ok(Json(state.queries.list_all(status, page).await?))
}

/// GET /admin/orders/{id}
async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.queries.get_by_id(&id, None).await?))
}

/// PATCH /admin/orders/{id}/status
///
/// Every status write goes through the lifecycle engine, so illegal edges are
/// rejected here exactly as they are for payments.
async fn update_status(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> Result<Json<Order>, AppError> {
    let Json(request) = payload?;
    let order_id = parse_order_id(&id)?;
    let target: OrderStatus = request.status.parse()?;

    let options = TransitionOptions {
        note: request.note,
        reason: request.reason,
        estimated_delivery_time: request.estimated_delivery_time,
        payment: None,
    };
    let order = state.orders.transition(order_id, target, options).await?;

    info!(order_id = %order_id, status = %target, admin = %claims.sub, "Order status updated by admin");
    Ok(Json(order))
}

// ============================================================================
// Live Feed
// ============================================================================

/// GET /admin/orders/events
async fn order_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sse_tx.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => Event::default()
                .event("order_status_changed")
                .json_data(&event)
                .ok()
                .map(Ok),
            // Lagged subscribers skip what they missed
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
