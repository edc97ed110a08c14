use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use crate::config::HubConfig;

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { min_connections: 2, max_connections: 20, acquire_timeout: Duration::from_secs(10) }
    }
}

impl From<&HubConfig> for PoolConfig {
    fn from(config: &HubConfig) -> Self {
        Self {
            min_connections: config.db_min_connections.min(config.db_max_connections),
            max_connections: config.db_max_connections.max(1),
            acquire_timeout: config.db_acquire_timeout,
        }
    }
}

pub async fn create_pg_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse hub PostgreSQL connection options")?;
    ensure_postgres_tls(&connect_options)?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to hub PostgreSQL")
}

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("hub PostgreSQL health check failed")?;

    Ok(())
}

// Remote databases must use TLS; loopback connections may skip it.
fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    if LOOPBACK_HOSTS.contains(&options.get_host()) {
        return Ok(());
    }

    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "hub PostgreSQL connection must require TLS; got sslmode={mode:?}. Set sslmode=require (or stricter)."
        ),
    }
}
