use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{Order, OrderStatus, PaymentStatus};
use crate::repository::{OrderRepository, Page, PageRequest, WebhookLedger};

/// Process-local order store. Every conditional write runs under the write lock,
/// so check and swap are one step.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<Uuid, Order>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut orders: Vec<Order>, page: PageRequest) -> Page<Order> {
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    let total = orders.len() as u64;
    let window = orders
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .collect();
    Page::new(window, total, page)
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert(&self, order: &Order) -> StoreResult<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate(order.id.to_string()));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn find_by_gateway_order_ref(&self, gateway_order_ref: &str) -> StoreResult<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|o| o.payment.gateway_order_ref.as_deref() == Some(gateway_order_ref))
            .cloned())
    }

    async fn find_by_gateway_payment_ref(&self, gateway_payment_ref: &str) -> StoreResult<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|o| o.payment.gateway_payment_ref.as_deref() == Some(gateway_payment_ref))
            .cloned())
    }

    async fn save_transition(&self, order: &Order, expected: OrderStatus) -> StoreResult<bool> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(stored) if stored.status == expected => {
                *stored = order.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::Unavailable(format!("order {} vanished during write", order.id))),
        }
    }

    async fn save_payment(&self, order: &Order, expected: PaymentStatus) -> StoreResult<bool> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(stored) if stored.payment.payment_status == expected => {
                stored.payment = order.payment.clone();
                stored.updated_at = order.updated_at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::Unavailable(format!("order {} vanished during write", order.id))),
        }
    }

    async fn list_by_owner(&self, owner_id: &str, page: PageRequest) -> StoreResult<Page<Order>> {
        let orders = self.orders.read().await;
        let owned = orders.values().filter(|o| o.owner_id == owner_id).cloned().collect();
        Ok(newest_first(owned, page))
    }

    async fn list_all(&self, status: Option<OrderStatus>, page: PageRequest) -> StoreResult<Page<Order>> {
        let orders = self.orders.read().await;
        let matching = orders
            .values()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        Ok(newest_first(matching, page))
    }
}

#[derive(Default)]
pub struct InMemoryWebhookLedger {
    seen: RwLock<HashSet<String>>,
}

impl InMemoryWebhookLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookLedger for InMemoryWebhookLedger {
    async fn record(&self, event_id: &str, _event_type: &str) -> StoreResult<bool> {
        Ok(self.seen.write().await.insert(event_id.to_string()))
    }

    async fn release(&self, event_id: &str) -> StoreResult<()> {
        self.seen.write().await.remove(event_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fixtures, TransitionOptions};
    use chrono::Utc;

    #[tokio::test]
    async fn test_conditional_transition_write() {
        let repo = InMemoryOrderRepository::new();
        let order = fixtures::order();
        repo.insert(&order).await.unwrap();

        let mut confirmed = order.clone();
        confirmed
            .apply_transition(OrderStatus::Confirmed, TransitionOptions::default(), Utc::now())
            .unwrap();
        assert!(repo.save_transition(&confirmed, OrderStatus::Pending).await.unwrap());

        // A second writer that still believes the order is pending loses.
        let mut failed = order.clone();
        failed
            .apply_transition(OrderStatus::PaymentFailed, TransitionOptions::default(), Utc::now())
            .unwrap();
        assert!(!repo.save_transition(&failed, OrderStatus::Pending).await.unwrap());

        let stored = repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Confirmed);
        assert_eq!(stored.history().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = InMemoryOrderRepository::new();
        let order = fixtures::order();
        repo.insert(&order).await.unwrap();
        assert!(matches!(repo.insert(&order).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_ledger_records_once() {
        let ledger = InMemoryWebhookLedger::new();
        assert!(ledger.record("evt_1", "payment.captured").await.unwrap());
        assert!(!ledger.record("evt_1", "payment.captured").await.unwrap());

        ledger.release("evt_1").await.unwrap();
        assert!(ledger.record("evt_1", "payment.captured").await.unwrap());
    }
}
