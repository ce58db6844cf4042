use dabba_api::{app, AppState, AuthConfig, Backends};
use dabba_core::{MockPaymentGateway, PaymentGateway};
use dabba_order::events::OrderEventPublisher;
use dabba_order::repository::{OrderRepository, WebhookLedger};
use dabba_order::{GatewaySettings, InMemoryOrderRepository, InMemoryWebhookLedger};
use dabba_store::app_config::{Config, GatewayMode};
use dabba_store::{DbClient, EventProducer, KafkaPublisher, PgOrderRepository, PgWebhookLedger, RazorpayGateway, RedisClient};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dabba_api=debug,dabba_order=debug,dabba_store=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().expect("Failed to load config");
    tracing::info!("Starting Dabba API on port {}", config.server.port);

    // Order store
    let (repo, ledger): (Arc<dyn OrderRepository>, Arc<dyn WebhookLedger>) = match &config.database {
        Some(db) => {
            let client = DbClient::new(&db.url, db.max_connections)
                .await
                .expect("Failed to connect to Postgres");
            client.migrate().await.expect("Failed to run migrations");
            let repo: Arc<dyn OrderRepository> = Arc::new(PgOrderRepository::new(client.pool.clone()));
            let ledger: Arc<dyn WebhookLedger> = Arc::new(PgWebhookLedger::new(client.pool.clone()));
            (repo, ledger)
        }
        None => {
            tracing::warn!("No database configured; orders are kept in memory and lost on restart");
            let repo: Arc<dyn OrderRepository> = Arc::new(InMemoryOrderRepository::new());
            let ledger: Arc<dyn WebhookLedger> = Arc::new(InMemoryWebhookLedger::new());
            (repo, ledger)
        }
    };

    // Payment gateway
    let gateway: Arc<dyn PaymentGateway> = match config.gateway.mode {
        GatewayMode::Razorpay => Arc::new(
            RazorpayGateway::new(
                &config.gateway.base_url,
                &config.gateway.key_id,
                &config.gateway.key_secret,
                config.gateway.timeout(),
            )
            .expect("Failed to build payment gateway client"),
        ),
        GatewayMode::Mock => {
            tracing::warn!("Using the mock payment gateway");
            Arc::new(MockPaymentGateway::new())
        }
    };

    // Kafka Connection
    let mut publishers: Vec<Arc<dyn OrderEventPublisher>> = Vec::new();
    if let Some(kafka) = &config.kafka {
        let producer = EventProducer::new(&kafka.brokers).expect("Failed to create Kafka producer");
        publishers.push(Arc::new(KafkaPublisher::new(producer)));
    }

    let mut app_state = AppState::new(
        Backends { repo, ledger, gateway, publishers },
        AuthConfig { secret: config.auth.jwt_secret.clone() },
        config.gateway.key_id.clone(),
        GatewaySettings {
            key_secret: config.gateway.key_secret.clone(),
            webhook_secret: config.gateway.webhook_secret.clone(),
            currency: config.gateway.currency.clone(),
            timeout: config.gateway.timeout(),
        },
        config.business_rules.clone(),
    );

    // Redis Connection
    if let Some(redis) = &config.redis {
        let client = RedisClient::new(&redis.url).await.expect("Failed to connect to Redis");
        app_state = app_state.with_redis(client);
    }

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>()
    ).await.expect("Server error");
}
