//! AAA service - main entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use aaa_service::config::AppConfig;
use aaa_service::services::{AcceptAllOtpVerifier, PolicyDocument, RedisRevocationStore};
use aaa_service::store::PgStore;
use aaa_service::{Stores, build_router, build_state, db};
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting aaa-service"
    );

    // PostgreSQL-backed stores
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("PostgreSQL connection pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let pg = Arc::new(PgStore::new(pool));

    // Redis-backed revocation tombstones
    let revocations = Arc::new(RedisRevocationStore::new(&config.redis.url).await?);

    // Service-authorization policy
    let policy = match &config.policy_file {
        Some(path) => PolicyDocument::load(path).map_err(|e| anyhow::anyhow!("{}", e))?,
        None => {
            tracing::warn!("SERVICE_POLICY_FILE not set; no services are authorized");
            PolicyDocument::empty()
        }
    };

    let stores = Stores {
        catalog: pg.clone(),
        principals: pg.clone(),
        audit: pg.clone(),
        tokens: pg.clone(),
        revocations: revocations.clone(),
    };

    let sweep_interval = Duration::from_secs(config.cache.sweep_interval_seconds);
    let retention_days = config.audit.retention_days;
    let port = config.common.port;

    let (state, audit_writer) = build_state(
        config,
        stores,
        policy,
        Arc::new(AcceptAllOtpVerifier),
    );

    // Background tasks: cache sweeper, audit retention, policy reload.
    let shutdown = CancellationToken::new();
    let sweeper = state
        .cache
        .clone()
        .spawn_sweeper(sweep_interval, shutdown.clone());
    let retention = state.audit.spawn_retention(retention_days, shutdown.clone());
    #[cfg(unix)]
    let policy_reload = state
        .engine
        .authorizer()
        .clone()
        .spawn_sighup_reload(shutdown.clone());

    let app = build_router(state.clone())?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("HTTP server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop background tasks, then drain the audit pipeline: dropping the
    // state releases the last sink clone so the writer can exit.
    shutdown.cancel();
    let _ = sweeper.await;
    let _ = retention.await;
    #[cfg(unix)]
    let _ = policy_reload.await;

    drop(state);
    audit_writer.join().await;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
