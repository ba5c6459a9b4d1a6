use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use common_database::{get_pool_with_timeouts, DatabaseTimeouts, DEFAULT_TIMEOUTS};
use common_redis::RedisClient;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::idempotency::IdempotencyService;
use crate::ingest::Ingestor;
use crate::router::router;
use crate::signals::SignalUpdater;
use crate::store::PostgresStore;

pub const APP_NAME: &str = "event-ingestion";

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let timeouts = DatabaseTimeouts {
        statement_timeout: config.pg_statement_timeout.0,
        acquire_timeout: config.pg_acquire_timeout.0,
        ..DEFAULT_TIMEOUTS
    };
    let pool = get_pool_with_timeouts(
        &config.database_url,
        config.max_pg_connections,
        APP_NAME,
        timeouts,
    )
    .await
    .context("failed to create postgres pool")?;

    if config.run_migrations {
        info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
    }

    let redis_client = RedisClient::with_config(
        config.redis_url.clone(),
        Some(config.redis_response_timeout.0),
        Some(config.redis_connection_timeout.0),
    )
    .await
    .context("failed to create redis client")?;

    let idempotency = Arc::new(IdempotencyService::new(
        Arc::new(redis_client),
        config.pending_ttl(),
        config.done_ttl(),
    ));

    let store = Arc::new(PostgresStore::new(pool));
    // The worker exits once every updater handle is dropped, i.e. after the server stops
    let (signals, _signal_worker) = SignalUpdater::start(
        store.clone(),
        config.signal_timeout.0,
        config.signal_queue_capacity,
        config.signal_max_in_flight,
    );

    let ingestor = Arc::new(Ingestor::new(
        store,
        idempotency,
        signals,
        config.ingestor_config(),
    ));
    let app = router(ingestor, config.export_prometheus);

    info!(
        bind = %config.bind(),
        policy = config.reservation_unavailable_policy.as_str(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server failed")?;

    Ok(())
}
