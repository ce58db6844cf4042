use async_trait::async_trait;
use dabba_order::repository::WebhookLedger;
use dabba_order::{StoreError, StoreResult};
use sqlx::PgPool;
use tracing::debug;

/// Durable record of processed gateway events, shared by every API instance.
pub struct PgWebhookLedger {
    pool: PgPool,
}

impl PgWebhookLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLedger for PgWebhookLedger {
    async fn record(&self, event_id: &str, event_type: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_webhook_events (event_id, event_type) VALUES ($1, $2) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, event_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(event_id, "Webhook event released");
        Ok(())
    }
}
