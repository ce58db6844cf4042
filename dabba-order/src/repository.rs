use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Order, OrderStatus, PaymentStatus};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// A 1-based page window over a newest-first listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    /// Clamps raw query values: missing or non-positive values fall back to
    /// page 1 / `default_limit`, and `limit` never exceeds `max_limit`.
    pub fn clamped(page: Option<i64>, limit: Option<i64>, default_limit: u32, max_limit: u32) -> Self {
        let page = page.filter(|p| *p >= 1).unwrap_or(1).min(u32::MAX as i64) as u32;
        let limit = limit
            .filter(|l| *l >= 1)
            .unwrap_or(default_limit as i64)
            .min(max_limit.max(1) as i64) as u32;
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.limit as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: DEFAULT_PAGE_SIZE }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub orders: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(orders: Vec<T>, total: u64, request: PageRequest) -> Self {
        let limit = request.limit.max(1) as u64;
        Self {
            orders,
            total,
            page: request.page,
            limit: request.limit,
            total_pages: total.div_ceil(limit),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            orders: self.orders.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
            total_pages: self.total_pages,
        }
    }
}

/// Persistent collection of orders.
///
/// The two `save_*` methods are conditional writes: they only succeed when the
/// stored record still holds the expected state, and report a lost race as `Ok(false)`.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert(&self, order: &Order) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Order>>;

    async fn find_by_gateway_order_ref(&self, gateway_order_ref: &str) -> StoreResult<Option<Order>>;

    async fn find_by_gateway_payment_ref(&self, gateway_payment_ref: &str) -> StoreResult<Option<Order>>;

    /// Writes the new status, the newest history entry, payment and terminal
    /// metadata as one unit, provided the stored status is still `expected`.
    async fn save_transition(&self, order: &Order, expected: OrderStatus) -> StoreResult<bool>;

    /// Writes the payment sub-record, provided the stored payment status is still `expected`.
    async fn save_payment(&self, order: &Order, expected: PaymentStatus) -> StoreResult<bool>;

    async fn list_by_owner(&self, owner_id: &str, page: PageRequest) -> StoreResult<Page<Order>>;

    async fn list_all(&self, status: Option<OrderStatus>, page: PageRequest) -> StoreResult<Page<Order>>;
}

/// Record of webhook event ids that have already been taken for processing.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Returns `false` when the event id was already recorded.
    async fn record(&self, event_id: &str, event_type: &str) -> StoreResult<bool>;

    /// Releases an id whose processing failed so a redelivery is handled.
    async fn release(&self, event_id: &str) -> StoreResult<()>;
}
