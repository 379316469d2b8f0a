use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    middleware::auth::{AuthenticatedUser, ROLE_ADMIN},
    models::order::{CreateOrderRequest, Order},
    AppState,
};

/// The order is always placed for the caller; `customerId` is never taken from the body.
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateOrderRequest>,
) -> AppResult<(StatusCode, Json<Order>)> {
    let order = state.orders.create(user.subject()?, &body).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Customers only see their own orders; someone else's reads as not found.
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    let order = state.orders.find(id).await?;
    if !visible_to(&order, &user) {
        return Err(AppError::NotFound(format!("Order {id} not found")));
    }
    Ok(Json(order))
}

pub async fn delete_order(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    state.orders.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn visible_to(order: &Order, user: &AuthenticatedUser) -> bool {
    user.claims.has_any_role(&[ROLE_ADMIN]) || user.claims.subject() == Some(order.customer_id.as_str())
}
