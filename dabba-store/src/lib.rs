pub mod app_config;
pub mod database;
pub mod events;
pub mod gateway;
pub mod order_repo;
pub mod redis_repo;
pub mod webhook_ledger;

pub use database::DbClient;
pub use events::{EventProducer, KafkaPublisher};
pub use gateway::RazorpayGateway;
pub use order_repo::PgOrderRepository;
pub use redis_repo::RedisClient;
pub use webhook_ledger::PgWebhookLedger;
