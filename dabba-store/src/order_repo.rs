use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dabba_order::models::{CustomerSnapshot, LineItem, Order, OrderParts, OrderStatus, Payment, PaymentStatus, StatusEntry};
use dabba_order::repository::{OrderRepository, Page, PageRequest};
use dabba_order::{StoreError, StoreResult};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;

const ORDER_COLUMNS: &str = "id, owner_id, status, customer, items, payment_method, subtotal, tax, delivery_fee, total, \
     payment_status, gateway_order_ref, gateway_payment_ref, paid_at, refund_ref, refunded_amount, \
     estimated_delivery_time, delivered_at, cancelled_at, cancellation_reason, created_at, updated_at";

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    owner_id: String,
    status: String,
    customer: Json<CustomerSnapshot>,
    items: Json<Vec<LineItem>>,
    payment_method: String,
    subtotal: Decimal,
    tax: Decimal,
    delivery_fee: Decimal,
    total: Decimal,
    payment_status: String,
    gateway_order_ref: Option<String>,
    gateway_payment_ref: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    refund_ref: Option<String>,
    refunded_amount: Option<Decimal>,
    estimated_delivery_time: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    order_id: Uuid,
    status: String,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
}

fn db_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Duplicate(db.message().to_string());
        }
    }
    error!(error = %e, "Order store query failed");
    StoreError::Unavailable(e.to_string())
}

fn parse_field<T: std::str::FromStr>(id: Uuid, field: &str, raw: &str) -> StoreResult<T> {
    raw.parse().map_err(|_| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("unknown {} '{}'", field, raw),
    })
}

fn into_order(row: OrderRow, history: Vec<HistoryRow>) -> StoreResult<Order> {
    let id = row.id;
    let status_history = history
        .into_iter()
        .map(|h| {
            Ok(StatusEntry {
                status: parse_field(id, "status", &h.status)?,
                timestamp: h.recorded_at,
                note: h.note,
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

    if status_history.is_empty() {
        return Err(StoreError::Corrupt { id: id.to_string(), reason: "empty status history".to_string() });
    }

    Ok(Order::restore(OrderParts {
        id,
        owner_id: row.owner_id,
        customer: row.customer.0,
        items: row.items.0,
        payment: Payment {
            method: parse_field(id, "payment method", &row.payment_method)?,
            subtotal: row.subtotal,
            tax: row.tax,
            delivery_fee: row.delivery_fee,
            total: row.total,
            payment_status: parse_field(id, "payment status", &row.payment_status)?,
            gateway_order_ref: row.gateway_order_ref,
            gateway_payment_ref: row.gateway_payment_ref,
            paid_at: row.paid_at,
            refund_ref: row.refund_ref,
            refunded_amount: row.refunded_amount,
        },
        status: parse_field(id, "status", &row.status)?,
        status_history,
        estimated_delivery_time: row.estimated_delivery_time,
        delivered_at: row.delivered_at,
        cancelled_at: row.cancelled_at,
        cancellation_reason: row.cancellation_reason,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }))
}

impl PgOrderRepository {
    /// Read-only snapshot so an order row and its history agree with each other.
    async fn snapshot(&self) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        Ok(tx)
    }

    async fn fetch_one(&self, column: &str, value: &str) -> StoreResult<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE {} = $1 LIMIT 1", ORDER_COLUMNS, column);
        let mut tx = self.snapshot().await?;
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;

        let order = match row {
            Some(row) => Self::hydrate(&mut tx, vec![row]).await?.pop(),
            None => None,
        };
        tx.commit().await.map_err(db_error)?;
        Ok(order)
    }

    /// Attach histories to a batch of rows with one query, preserving row order.
    async fn hydrate(conn: &mut PgConnection, rows: Vec<OrderRow>) -> StoreResult<Vec<Order>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let history: Vec<HistoryRow> = sqlx::query_as(
            "SELECT order_id, status, note, recorded_at FROM order_status_history \
             WHERE order_id = ANY($1) ORDER BY order_id, id",
        )
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;

        let mut by_order: HashMap<Uuid, Vec<HistoryRow>> = HashMap::new();
        for entry in history {
            by_order.entry(entry.order_id).or_default().push(entry);
        }

        rows.into_iter()
            .map(|row| {
                let entries = by_order.remove(&row.id).unwrap_or_default();
                into_order(row, entries)
            })
            .collect()
    }

    async fn page(
        &self,
        filter: Option<(&str, String)>,
        request: PageRequest,
    ) -> StoreResult<Page<Order>> {
        let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM orders");
        let mut select: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {} FROM orders", ORDER_COLUMNS));
        if let Some((column, value)) = &filter {
            count.push(format!(" WHERE {} = ", column)).push_bind(value.clone());
            select.push(format!(" WHERE {} = ", column)).push_bind(value.clone());
        }
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset() as i64);

        let mut tx = self.snapshot().await?;
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;
        let rows: Vec<OrderRow> = select
            .build_query_as()
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;

        let orders = Self::hydrate(&mut tx, rows).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(Page::new(orders, total.max(0) as u64, request))
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn insert(&self, order: &Order) -> StoreResult<()> {
        let payment = order.payment();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let sql = format!(
            "INSERT INTO orders ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)",
            ORDER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(order.id)
            .bind(&order.owner_id)
            .bind(order.status().as_str())
            .bind(Json(&order.customer))
            .bind(Json(&order.items))
            .bind(payment.method.as_str())
            .bind(payment.subtotal)
            .bind(payment.tax)
            .bind(payment.delivery_fee)
            .bind(payment.total)
            .bind(payment.payment_status.as_str())
            .bind(&payment.gateway_order_ref)
            .bind(&payment.gateway_payment_ref)
            .bind(payment.paid_at)
            .bind(&payment.refund_ref)
            .bind(payment.refunded_amount)
            .bind(order.estimated_delivery_time())
            .bind(order.delivered_at())
            .bind(order.cancelled_at())
            .bind(order.cancellation_reason())
            .bind(order.created_at)
            .bind(order.updated_at())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        for entry in order.history().entries() {
            sqlx::query(
                "INSERT INTO order_status_history (order_id, status, note, recorded_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(order.id)
            .bind(entry.status.as_str())
            .bind(&entry.note)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
        let mut tx = self.snapshot().await?;
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;

        let order = match row {
            Some(row) => Self::hydrate(&mut tx, vec![row]).await?.pop(),
            None => None,
        };
        tx.commit().await.map_err(db_error)?;
        Ok(order)
    }

    async fn find_by_gateway_order_ref(&self, gateway_order_ref: &str) -> StoreResult<Option<Order>> {
        self.fetch_one("gateway_order_ref", gateway_order_ref).await
    }

    async fn find_by_gateway_payment_ref(&self, gateway_payment_ref: &str) -> StoreResult<Option<Order>> {
        self.fetch_one("gateway_payment_ref", gateway_payment_ref).await
    }

    async fn save_transition(&self, order: &Order, expected: OrderStatus) -> StoreResult<bool> {
        let payment = order.payment();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Conditional on the status we read; zero rows means another writer got there first.
        let result = sqlx::query(
            "UPDATE orders SET status = $2, payment_status = $3, gateway_order_ref = $4, gateway_payment_ref = $5, \
             paid_at = $6, refund_ref = $7, refunded_amount = $8, estimated_delivery_time = $9, delivered_at = $10, \
             cancelled_at = $11, cancellation_reason = $12, updated_at = $13 \
             WHERE id = $1 AND status = $14",
        )
        .bind(order.id)
        .bind(order.status().as_str())
        .bind(payment.payment_status.as_str())
        .bind(&payment.gateway_order_ref)
        .bind(&payment.gateway_payment_ref)
        .bind(payment.paid_at)
        .bind(&payment.refund_ref)
        .bind(payment.refunded_amount)
        .bind(order.estimated_delivery_time())
        .bind(order.delivered_at())
        .bind(order.cancelled_at())
        .bind(order.cancellation_reason())
        .bind(order.updated_at())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Ok(false);
        }

        if let Some(entry) = order.history().last() {
            sqlx::query(
                "INSERT INTO order_status_history (order_id, status, note, recorded_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(order.id)
            .bind(entry.status.as_str())
            .bind(&entry.note)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn save_payment(&self, order: &Order, expected: PaymentStatus) -> StoreResult<bool> {
        let payment = order.payment();
        let result = sqlx::query(
            "UPDATE orders SET payment_status = $2, gateway_order_ref = $3, gateway_payment_ref = $4, paid_at = $5, \
             refund_ref = $6, refunded_amount = $7, updated_at = $8 \
             WHERE id = $1 AND payment_status = $9",
        )
        .bind(order.id)
        .bind(payment.payment_status.as_str())
        .bind(&payment.gateway_order_ref)
        .bind(&payment.gateway_payment_ref)
        .bind(payment.paid_at)
        .bind(&payment.refund_ref)
        .bind(payment.refunded_amount)
        .bind(order.updated_at())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_owner(&self, owner_id: &str, page: PageRequest) -> StoreResult<Page<Order>> {
        self.page(Some(("owner_id", owner_id.to_string())), page).await
    }

    async fn list_all(&self, status: Option<OrderStatus>, page: PageRequest) -> StoreResult<Page<Order>> {
        self.page(status.map(|s| ("status", s.as_str().to_string())), page).await
    }
}
