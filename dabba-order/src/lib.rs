pub mod error;
pub mod events;
pub mod manager;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod query;
pub mod repository;
pub mod validation;
pub mod webhook;

pub use error::{OrderError, StoreError, StoreResult};
pub use events::{BroadcastPublisher, OrderEventPublisher};
pub use manager::OrderManager;
pub use memory::{InMemoryOrderRepository, InMemoryWebhookLedger};
pub use models::{Order, OrderParts, OrderStatus, Payment, PaymentMethod, PaymentStatus, PaymentUpdate, StatusEntry, TransitionOptions};
pub use orchestrator::{CheckoutVerification, GatewaySettings, PaymentOrchestrator, RefundReceipt, WebhookOutcome};
pub use query::OrderQueryService;
pub use repository::{OrderRepository, Page, PageRequest, WebhookLedger};
pub use validation::NewOrder;
