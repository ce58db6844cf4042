use dabba_core::PaymentGateway;
use dabba_order::events::{BroadcastPublisher, OrderEventPublisher};
use dabba_order::repository::{OrderRepository, WebhookLedger};
use dabba_order::{GatewaySettings, OrderManager, OrderQueryService, PageRequest, PaymentOrchestrator};
use dabba_shared::models::events::OrderStatusChangedEvent;
use dabba_store::app_config::BusinessRules;
use dabba_store::RedisClient;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderManager>,
    pub queries: Arc<OrderQueryService>,
    pub payments: Arc<PaymentOrchestrator>,
    pub redis: Option<Arc<RedisClient>>,
    pub sse_tx: broadcast::Sender<OrderStatusChangedEvent>,
    pub auth: AuthConfig,
    pub business_rules: BusinessRules,
    /// Public gateway key handed to the checkout widget
    pub gateway_key_id: String,
}

/// Collaborators the API runs on. Production wires PostgreSQL and the live gateway;
/// tests wire the in-memory store and the mock gateway.
pub struct Backends {
    pub repo: Arc<dyn OrderRepository>,
    pub ledger: Arc<dyn WebhookLedger>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub publishers: Vec<Arc<dyn OrderEventPublisher>>,
}

impl AppState {
    pub fn new(
        backends: Backends,
        auth: AuthConfig,
        gateway_key_id: String,
        gateway: GatewaySettings,
        business_rules: BusinessRules,
    ) -> Self {
        let (sse_tx, _) = broadcast::channel(256);

        let mut manager = OrderManager::new(backends.repo.clone())
            .with_publisher(Arc::new(BroadcastPublisher::new(sse_tx.clone())))
            .with_cash_on_delivery_auto_confirm(business_rules.auto_confirm_cash_on_delivery);
        for publisher in backends.publishers {
            manager = manager.with_publisher(publisher);
        }
        let orders = Arc::new(manager);

        let payments = PaymentOrchestrator::new(
            orders.clone(),
            backends.repo.clone(),
            backends.ledger,
            backends.gateway,
            gateway,
        );

        Self {
            orders,
            queries: Arc::new(OrderQueryService::new(backends.repo)),
            payments: Arc::new(payments),
            redis: None,
            sse_tx,
            auth,
            business_rules,
            gateway_key_id,
        }
    }

    pub fn with_redis(mut self, redis: RedisClient) -> Self {
        self.redis = Some(Arc::new(redis));
        self
    }

    pub fn page_request(&self, page: Option<i64>, limit: Option<i64>) -> PageRequest {
        PageRequest::clamped(
            page,
            limit,
            self.business_rules.default_page_size,
            self.business_rules.max_page_size,
        )
    }
}
