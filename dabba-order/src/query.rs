use std::sync::Arc;
use uuid::Uuid;

use crate::error::OrderError;
use crate::models::{Order, OrderStatus};
use crate::repository::{OrderRepository, Page, PageRequest};

/// Read side for customers (ownership enforced) and the back office (all orders).
pub struct OrderQueryService {
    repo: Arc<dyn OrderRepository>,
}

pub fn parse_order_id(raw: &str) -> Result<Uuid, OrderError> {
    Uuid::parse_str(raw.trim()).map_err(|_| OrderError::validation(format!("id: '{}' is not a valid order id", raw)))
}

impl OrderQueryService {
    pub fn new(repo: Arc<dyn OrderRepository>) -> Self {
        Self { repo }
    }

    /// Loads an order. When `requesting_principal` is given it must own the order.
    pub async fn get_by_id(&self, raw_id: &str, requesting_principal: Option<&str>) -> Result<Order, OrderError> {
        let id = parse_order_id(raw_id)?;
        let order = self
            .repo
            .get(id)
            .await?
            .ok_or_else(|| OrderError::NotFound(id.to_string()))?;

        if let Some(principal) = requesting_principal {
            if !order.is_owned_by(principal) {
                return Err(OrderError::Forbidden(id.to_string()));
            }
        }
        Ok(order)
    }

    /// The owner's orders, newest first.
    pub async fn get_history(&self, owner_id: &str, page: PageRequest) -> Result<Page<Order>, OrderError> {
        Ok(self.repo.list_by_owner(owner_id, page).await?)
    }

    /// All orders for the back office, optionally narrowed to one status.
    pub async fn list_all(&self, status: Option<OrderStatus>, page: PageRequest) -> Result<Page<Order>, OrderError> {
        Ok(self.repo.list_all(status, page).await?)
    }
}
