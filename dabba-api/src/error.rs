use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dabba_core::GatewayError;
use dabba_order::OrderError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Forbidden(String),
    Validation(Vec<String>),
    NotFound(String),
    InvalidTransition(String),
    InvalidSignature,
    GatewayTimeout(String),
    Gateway(String),
    Persistence(String),
    RateLimited,
    Anyhow(anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(vec![message.into()])
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg, Vec::new()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg, Vec::new()),
            AppError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "Request validation failed".to_string(),
                details,
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, Vec::new()),
            AppError::InvalidTransition(msg) => (StatusCode::CONFLICT, "INVALID_TRANSITION", msg, Vec::new()),
            AppError::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                "INVALID_SIGNATURE",
                "Payment signature verification failed".to_string(),
                Vec::new(),
            ),
            AppError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "GATEWAY_TIMEOUT", msg, Vec::new()),
            AppError::Gateway(msg) => (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR", msg, Vec::new()),
            AppError::Persistence(msg) => {
                tracing::error!(error = %msg, "Persistence error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PERSISTENCE_ERROR",
                    "Order store unavailable".to_string(),
                    Vec::new(),
                )
            }
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Rate limit exceeded".to_string(),
                Vec::new(),
            ),
            AppError::Anyhow(err) => {
                tracing::error!(error = ?err, "Internal Server Error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal Server Error".to_string(),
                    Vec::new(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
                "details": details,
            }
        }));

        (status, body).into_response()
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Validation(details) => AppError::Validation(details),
            OrderError::NotFound(id) => AppError::NotFound(format!("Order not found: {}", id)),
            OrderError::Forbidden(_) => AppError::Forbidden("You do not have access to this order".to_string()),
            e @ OrderError::InvalidTransition { .. } => AppError::InvalidTransition(e.to_string()),
            OrderError::InvalidSignature => AppError::InvalidSignature,
            OrderError::Gateway(e @ GatewayError::Timeout(_)) => AppError::GatewayTimeout(e.to_string()),
            OrderError::Gateway(e) => AppError::Gateway(e.to_string()),
            OrderError::Persistence(e) => AppError::Persistence(e.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::validation(format!("body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::validation(format!("query: {}", rejection.body_text()))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Anyhow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status_of(err: OrderError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_order_errors_map_to_status_codes() {
        assert_eq!(status_of(OrderError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(OrderError::NotFound("1".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(OrderError::Forbidden("1".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(OrderError::InvalidTransition { from: "delivered".into(), to: "preparing".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(OrderError::InvalidSignature), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(OrderError::Gateway(GatewayError::Timeout(Duration::from_secs(1)))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_of(OrderError::Gateway(GatewayError::Transport("reset".into()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(OrderError::Persistence(dabba_order::StoreError::Unavailable("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
