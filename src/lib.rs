pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use sqlx::PgPool;

use config::Config;
use middleware::{
    auth::{require_admin, require_auth, require_customer},
    rate_limit::AttemptCounter,
};
use services::{
    claims::ClaimsValidator, identity::IdentityClient, orders::OrderService, reconciler::ProfileReconciler,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub login_attempts: Arc<dyn AttemptCounter>,
    pub config: Arc<Config>,
    pub identity: Arc<IdentityClient>,
    pub validator: Arc<ClaimsValidator>,
    pub reconciler: Arc<ProfileReconciler>,
    pub orders: Arc<OrderService>,
}

/// Every route of the service. Authenticated groups run
/// `require_auth` first, then their role check, then the handler.
pub fn router(state: AppState) -> Router {
    let authenticate = from_fn_with_state(state.validator.clone(), require_auth);

    let public = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        .route("/auth/login", post(routes::auth::login))
        .route("/auth/refresh", post(routes::auth::refresh))
        .route("/auth/register", post(routes::auth::register));

    let signed_in = Router::new()
        .route("/auth/profile", get(routes::auth::profile))
        .route("/auth/userinfo", get(routes::auth::userinfo))
        .route_layer(authenticate.clone());

    let customers = Router::new()
        .route("/orders", post(routes::orders::create_order))
        .route("/orders/{id}", get(routes::orders::get_order))
        .route_layer(from_fn(require_customer))
        .route_layer(authenticate.clone());

    let admins = Router::new()
        .route("/auth/users", get(routes::auth::list_users))
        .route("/orders/{id}", delete(routes::orders::delete_order))
        .route_layer(from_fn(require_admin))
        .route_layer(authenticate);

    Router::new()
        .merge(public)
        .merge(signed_in)
        .merge(customers)
        .merge(admins)
        .with_state(state)
}
