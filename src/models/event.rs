use serde::Serialize;
use uuid::Uuid;

pub const USER_CREATED: &str = "user.created";
pub const USER_DELETED: &str = "user.deleted";
pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_DELETED: &str = "order.deleted";

/// Every stream bootstrapped at startup.
pub const ALL_TOPICS: &[&str] = &[USER_CREATED, USER_DELETED, ORDER_CREATED, ORDER_DELETED];

/// Something the notifier can put on a stream.
pub trait DomainEvent: Serialize {
    fn topic(&self) -> &'static str;
    /// Partition/correlation key stored next to the payload.
    fn key(&self) -> String;
}

/// Emitted once, when a subject is first reconciled into a local profile.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedEvent {
    pub local_profile_id: Uuid,
    pub subject_id: String,
    pub email: Option<String>,
    pub username: String,
}

impl DomainEvent for UserCreatedEvent {
    fn topic(&self) -> &'static str {
        USER_CREATED
    }

    fn key(&self) -> String {
        self.subject_id.clone()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub order_id: Uuid,
    pub customer_id: String,
    pub product_id: i64,
    pub quantity: i32,
    pub total_amount: f64,
    pub status: String,
}

impl DomainEvent for OrderCreatedEvent {
    fn topic(&self) -> &'static str {
        ORDER_CREATED
    }

    fn key(&self) -> String {
        self.order_id.to_string()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderDeletedEvent {
    pub order_id: Uuid,
}

impl DomainEvent for OrderDeletedEvent {
    fn topic(&self) -> &'static str {
        ORDER_DELETED
    }

    fn key(&self) -> String {
        self.order_id.to_string()
    }
}
