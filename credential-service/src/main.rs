use credential_service::{
    build_router,
    config::{AuthConfig, StoreBackend},
    db::{self, MemoryStore, PgStore, StoreProvider},
    services::LogNotifier,
    utils::SystemClock,
    AppState,
};
use service_core::{error::AppError, observability::logging::init_tracing};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AuthConfig::from_env()?;
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    let store = open_store(&config).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    let state = AppState::new(
        config.clone(),
        store,
        Arc::new(SystemClock),
        Arc::new(LogNotifier),
    );
    let app = build_router(state).await?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        %addr,
        "Credential service ready"
    );

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_stop())
    .await?;

    tracing::info!("Credential service stopped");
    Ok(())
}

async fn open_store(config: &AuthConfig) -> Result<Arc<dyn StoreProvider>, AppError> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database).await?;
            db::run_migrations(&pool).await?;
            tracing::info!("Postgres store ready");
            Ok(Arc::new(PgStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("In-memory store selected; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(unix)]
async fn wait_for_stop() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM unavailable; stopping on Ctrl+C only");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_stop() {
    ctrl_c().await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl+C received"),
        Err(err) => {
            tracing::error!(error = %err, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await
        }
    }
}
