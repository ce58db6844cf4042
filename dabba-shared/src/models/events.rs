use uuid::Uuid;

pub const ORDER_STATUS_CHANGED_TOPIC: &str = "order.status_changed";

/// Emitted after an order's status change has been committed.
///
/// Statuses are carried as their wire names (`pending`, `out_for_delivery`, ...)
/// so consumers do not need the order crate to read them.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct OrderStatusChangedEvent {
    pub order_id: Uuid,
    pub owner_id: String,
    pub from: String,
    pub to: String,
    pub note: Option<String>,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_wire_shape() {
        let event = OrderStatusChangedEvent {
            order_id: Uuid::nil(),
            owner_id: "user-1".to_string(),
            from: "pending".to_string(),
            to: "confirmed".to_string(),
            note: None,
            occurred_at: chrono::Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["from"], "pending");
        assert_eq!(value["to"], "confirmed");
        assert!(value["note"].is_null());
    }
}
