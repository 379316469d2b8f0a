use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// DB row struct, status is stored as TEXT with a CHECK constraint.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub customer_id: String,
    pub product_id: i64,
    pub price: f64,
    pub quantity: i32,
    pub total_amount: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub product_id: i64,
    pub price: f64,
    pub quantity: i32,
    pub total_amount: f64,
    #[serde(default)]
    pub status: OrderStatus,
}

impl CreateOrderRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.quantity <= 0 {
            return Err("quantity must be greater than 0".into());
        }
        if self.price.is_nan() || self.price < 0.0 {
            return Err("price must be 0 or more".into());
        }
        if self.total_amount.is_nan() || self.total_amount < 0.0 {
            return Err("totalAmount must be 0 or more".into());
        }
        Ok(())
    }
}
