use axum::{
    extract::{ConnectInfo, Request, State},
    http::Method,
    middleware::Next,
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod admin;
pub mod error;
pub mod middleware;
pub mod orders;
pub mod payments;
pub mod state;
pub mod webhooks;

use error::AppError;
pub use state::{AppState, AuthConfig, Backends};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    Router::new()
        .route("/health", get(health))
        .merge(orders::routes(state.clone()))
        .merge(admin::routes(state.clone()))
        .merge(payments::routes(state.clone()))
        .layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        // Added after the limiter so gateway redeliveries are never throttled
        .merge(webhooks::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(redis) = state.redis.clone() else {
        return Ok(next.run(req).await);
    };

    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let key = dabba_store::redis_repo::rate_limit_key(&ip, chrono::Utc::now());

    match redis.check_rate_limit(&key, state.business_rules.rate_limit_per_minute, 60).await {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) => {
            tracing::warn!(client = %ip, "Rate limit exceeded");
            Err(AppError::RateLimited)
        }
        Err(e) => {
            // Fail open
            tracing::warn!(error = %e, "Rate limiter unavailable");
            Ok(next.run(req).await)
        }
    }
}
