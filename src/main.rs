use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use redis::Client as RedisClient;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authsync_api::{
    config::Config,
    db,
    middleware::rate_limit::RedisAttemptCounter,
    services::{
        claims::ClaimsValidator,
        consumer::EventConsumer,
        identity::IdentityClient,
        metrics,
        notifier::{bootstrap_streams, Notifier, RedisStreamPublisher, StreamBootstrap},
        orders::OrderService,
        profile_store::PgProfileStore,
        reconciler::ProfileReconciler,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    info!(realm = %config.keycloak.realm, issuer = %config.keycloak.issuer(), "configuration loaded");

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let redis_client = RedisClient::open(config.redis_url.as_str())?;
    let mut redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Redis connected");

    for (topic, outcome) in bootstrap_streams(&mut redis_conn, &config.event_consumer_group).await {
        if let StreamBootstrap::Failed(reason) = outcome {
            warn!(%topic, %reason, "continuing without stream bootstrap");
        }
    }

    if config.event_consumer_enabled {
        let consumer_conn = redis_client.get_multiplexed_async_connection().await?;
        EventConsumer::new(
            consumer_conn,
            config.event_consumer_group.clone(),
            config.event_consumer_name.clone(),
        )
        .start();
    }

    let publisher = Arc::new(RedisStreamPublisher::new(redis_conn.clone(), config.event_stream_maxlen));
    let notifier = Arc::new(Notifier::new(publisher, config.notify_timeout));

    let identity = Arc::new(IdentityClient::new(config.keycloak.clone(), config.idp_timeout)?);
    let validator = Arc::new(ClaimsValidator::from_config(&config)?);
    let reconciler = Arc::new(ProfileReconciler::new(
        Arc::new(PgProfileStore::new(pool.clone())),
        notifier.clone(),
    ));
    let orders = Arc::new(OrderService::new(pool.clone(), notifier));

    metrics::register_all();
    metrics::start(pool.clone());

    let state = AppState {
        db: pool,
        login_attempts: Arc::new(RedisAttemptCounter::new(redis_conn)),
        config: config.clone(),
        identity,
        validator,
        reconciler,
        orders,
    };

    // Localhost is always allowed for development; other origins come from config.
    let allowed = config.cors_origins.clone();
    let cors_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(o) = origin.to_str() else {
            return false;
        };
        o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") || allowed.iter().any(|a| a == o)
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ]))
        .allow_origin(cors_origin);

    let app = authsync_api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    info!("authsync API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
