use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec};
use sqlx::PgPool;
use tracing::{info, warn};

lazy_static! {
    // ── Event counters ──────────────────────────────────────────────────────
    pub static ref LOGINS_COUNTER: CounterVec = register_counter_vec!(
        "authsync_logins_total",
        "Password grants by outcome",
        &["status"]
    ).unwrap();

    pub static ref ADMIN_GRANTS_COUNTER: CounterVec = register_counter_vec!(
        "authsync_admin_token_grants_total",
        "Admin token grants issued against the identity provider",
        &["status"]
    ).unwrap();

    pub static ref RECONCILE_COUNTER: CounterVec = register_counter_vec!(
        "authsync_reconciliations_total",
        "Profile reconciliations by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref NOTIFY_FAILURES_COUNTER: CounterVec = register_counter_vec!(
        "authsync_notify_failures_total",
        "Events that could not be handed to the broker",
        &["topic"]
    ).unwrap();

    pub static ref EVENTS_CONSUMED_COUNTER: CounterVec = register_counter_vec!(
        "authsync_events_consumed_total",
        "Stream entries read by the consumer group",
        &["topic"]
    ).unwrap();

    pub static ref JWKS_FETCHES_COUNTER: CounterVec = register_counter_vec!(
        "authsync_jwks_fetches_total",
        "Signing key set downloads by outcome",
        &["status"]
    ).unwrap();

    // ── Stored data ─────────────────────────────────────────────────────────
    pub static ref PROFILES_GAUGE: Gauge = register_gauge!(
        "authsync_profiles_active_total",
        "Active local profiles"
    ).unwrap();

    pub static ref ORDERS_GAUGE: GaugeVec = register_gauge_vec!(
        "authsync_orders_total",
        "Orders by status",
        &["status"]
    ).unwrap();
}

/// Registers every family so a scrape lists them before their first update.
pub fn register_all() {
    lazy_static::initialize(&LOGINS_COUNTER);
    lazy_static::initialize(&ADMIN_GRANTS_COUNTER);
    lazy_static::initialize(&RECONCILE_COUNTER);
    lazy_static::initialize(&NOTIFY_FAILURES_COUNTER);
    lazy_static::initialize(&EVENTS_CONSUMED_COUNTER);
    lazy_static::initialize(&JWKS_FETCHES_COUNTER);
    lazy_static::initialize(&PROFILES_GAUGE);
    lazy_static::initialize(&ORDERS_GAUGE);
}

/// Spawn the background gauge collector (refreshes every 5 minutes).
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = collect(&pool).await {
                warn!(error = %e, "metrics collection failed");
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
        }
    });
}

async fn collect(pool: &PgPool) -> anyhow::Result<()> {
    let profiles: i64 = sqlx::query_scalar("SELECT COUNT(*)::BIGINT FROM profiles WHERE is_active = TRUE")
        .fetch_one(pool)
        .await?;
    PROFILES_GAUGE.set(profiles as f64);

    let orders: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*)::BIGINT FROM orders GROUP BY status")
            .fetch_all(pool)
            .await?;
    ORDERS_GAUGE.reset();
    for (status, count) in &orders {
        ORDERS_GAUGE.with_label_values(&[status.as_str()]).set(*count as f64);
    }

    info!(profiles, order_statuses = orders.len(), "metrics collected");
    Ok(())
}
