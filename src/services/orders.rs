use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        event::{OrderCreatedEvent, OrderDeletedEvent},
        order::{CreateOrderRequest, Order},
    },
    services::notifier::Notifier,
};

const ORDER_COLUMNS: &str =
    "id, customer_id, product_id, price, quantity, total_amount, status, created_at, updated_at";

pub struct OrderService {
    pool: PgPool,
    notifier: Arc<Notifier>,
}

impl OrderService {
    pub fn new(pool: PgPool, notifier: Arc<Notifier>) -> Self {
        Self { pool, notifier }
    }

    pub async fn create(&self, customer_id: &str, body: &CreateOrderRequest) -> AppResult<Order> {
        body.validate().map_err(AppError::Validation)?;

        let order = sqlx::query_as::<_, Order>(&format!(
            "INSERT INTO orders (customer_id, product_id, price, quantity, total_amount, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(customer_id)
        .bind(body.product_id)
        .bind(body.price)
        .bind(body.quantity)
        .bind(body.total_amount)
        .bind(body.status.to_string())
        .fetch_one(&self.pool)
        .await?;

        info!(order_id = %order.id, customer_id = %customer_id, "order created");
        self.notifier.publish_detached(created_event(&order));
        Ok(order)
    }

    pub async fn find(&self, id: Uuid) -> AppResult<Order> {
        sqlx::query_as::<_, Order>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {id} not found")))
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Order {id} not found")));
        }

        info!(order_id = %id, "order deleted");
        self.notifier.publish_detached(OrderDeletedEvent { order_id: id });
        Ok(())
    }
}

fn created_event(order: &Order) -> OrderCreatedEvent {
    OrderCreatedEvent {
        order_id: order.id,
        customer_id: order.customer_id.clone(),
        product_id: order.product_id,
        quantity: order.quantity,
        total_amount: order.total_amount,
        status: order.status.clone(),
    }
}
