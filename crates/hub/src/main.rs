use std::sync::Arc;

use anyhow::Context;
use tessera_hub::{
    app::{build_router, AppContext},
    auth::{jwt::JwtAccessTokenService, upgrade::UpgradeAuthenticator},
    config::{HubConfig, LogFormat},
    db::{migrations::run_migrations, pool::PoolConfig},
    hub::{router::EventRouter, sweeper::spawn_lock_sweeper, Hub},
    membership::WorkspaceMembershipStore,
    metrics::HubMetrics,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("TESSERA_HUB_JWT_SECRET not set; using the development-only secret");
    }

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid hub JWT secret")?,
    );
    let membership = match config.database_url.as_deref() {
        Some(database_url) => {
            WorkspaceMembershipStore::connect(database_url, PoolConfig::from(&config)).await?
        }
        None => {
            warn!("TESSERA_HUB_DATABASE_URL not set; using in-memory workspace membership");
            WorkspaceMembershipStore::in_memory()
        }
    };
    if config.run_migrations {
        match membership.pool() {
            Some(pool) => {
                run_migrations(pool).await?;
                info!("applied hub membership migrations");
            }
            None => warn!("TESSERA_HUB_RUN_MIGRATIONS ignored without a database"),
        }
    }

    let metrics = Arc::new(HubMetrics::default());
    let hub = Hub::new(config.lock_timeout, Arc::clone(&metrics));
    let events = EventRouter::detached();
    events.install(hub.clone());
    let sweeper = spawn_lock_sweeper(hub.clone(), config.lock_sweep_interval);

    let authenticator =
        UpgradeAuthenticator::new(Arc::clone(&jwt_service), membership, config.dev_auth_bypass);
    if authenticator.dev_auth_bypass() {
        warn!("development auth bypass enabled; tokenless websocket upgrades are accepted");
    }
    let lock_timeout_secs = hub.locks().timeout().num_seconds();
    let app = build_router(AppContext { hub, events, jwt_service, authenticator, metrics });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind hub listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        lock_timeout_secs,
        lock_sweep_interval_secs = config.lock_sweep_interval.as_secs(),
        "starting collaboration hub"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("hub server exited unexpectedly");
    sweeper.abort();

    served
}

fn init_tracing(config: &HubConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!(error = %signal_error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                error!(error = %signal_error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
