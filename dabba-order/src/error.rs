use dabba_core::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order store unavailable: {0}")]
    Unavailable(String),

    #[error("Order {0} already exists")]
    Duplicate(String),

    #[error("Stored order {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Order {0} belongs to another customer")]
    Forbidden(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: String,
        to: String,
    },

    #[error("Payment signature verification failed")]
    InvalidSignature,

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl OrderError {
    pub fn validation(message: impl Into<String>) -> Self {
        OrderError::Validation(vec![message.into()])
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrderError::Gateway(e) => e.is_retryable(),
            OrderError::Persistence(StoreError::Unavailable(_)) => true,
            _ => false,
        }
    }
}
