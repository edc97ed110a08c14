// Hub server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEV_JWT_SECRET: &str = "tessera_local_development_jwt_secret_must_be_32_chars";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LOCK_SWEEP_INTERVAL_SECS: u64 = 15;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core hub configuration.
///
/// Constructed via [`HubConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with the token issuer.
    pub jwt_secret: String,
    /// PostgreSQL connection string for workspace membership lookups.
    pub database_url: Option<String>,
    /// Apply the bundled membership schema migrations at startup.
    pub run_migrations: bool,
    /// Accept unauthenticated upgrades that carry plain identity parameters.
    pub dev_auth_bypass: bool,
    /// Age after which an unrenewed frame lock is force-released.
    pub lock_timeout: Duration,
    /// How often the lock sweeper runs.
    pub lock_sweep_interval: Duration,
    /// Log filter directive used when `RUST_LOG` is not set.
    pub log_filter: String,
    pub log_format: LogFormat,
    pub db_min_connections: u32,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
}

impl HubConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TESSERA_HUB_HOST` | `0.0.0.0` |
    /// | `TESSERA_HUB_PORT` | `8080` |
    /// | `TESSERA_HUB_JWT_SECRET` | dev-only placeholder |
    /// | `TESSERA_HUB_DATABASE_URL` | *(none, in-memory membership)* |
    /// | `TESSERA_HUB_RUN_MIGRATIONS` | `false` |
    /// | `TESSERA_HUB_DEV_AUTH_BYPASS` | `false` |
    /// | `TESSERA_HUB_LOCK_TIMEOUT_SECS` | `60` |
    /// | `TESSERA_HUB_LOCK_SWEEP_INTERVAL_SECS` | `15` |
    /// | `TESSERA_HUB_LOG_FILTER` | `info` |
    /// | `TESSERA_HUB_LOG_FORMAT` | `text` |
    /// | `TESSERA_HUB_DB_MIN_CONNECTIONS` | `2` |
    /// | `TESSERA_HUB_DB_MAX_CONNECTIONS` | `20` |
    /// | `TESSERA_HUB_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TESSERA_HUB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = parse_or(&env, "TESSERA_HUB_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("TESSERA_HUB_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url =
            env("TESSERA_HUB_DATABASE_URL").ok().filter(|value| !value.trim().is_empty());

        let run_migrations =
            env("TESSERA_HUB_RUN_MIGRATIONS").map(|value| parse_flag(&value)).unwrap_or(false);
        let dev_auth_bypass = env("TESSERA_HUB_DEV_AUTH_BYPASS")
            .map(|value| parse_flag(&value))
            .unwrap_or(false);

        let lock_timeout_secs = positive_or(
            parse_or(&env, "TESSERA_HUB_LOCK_TIMEOUT_SECS", DEFAULT_LOCK_TIMEOUT_SECS),
            DEFAULT_LOCK_TIMEOUT_SECS,
        );
        let lock_sweep_interval_secs = positive_or(
            parse_or(&env, "TESSERA_HUB_LOCK_SWEEP_INTERVAL_SECS", DEFAULT_LOCK_SWEEP_INTERVAL_SECS),
            DEFAULT_LOCK_SWEEP_INTERVAL_SECS,
        );

        let log_filter = env("TESSERA_HUB_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("TESSERA_HUB_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            run_migrations,
            dev_auth_bypass,
            lock_timeout: Duration::from_secs(lock_timeout_secs),
            lock_sweep_interval: Duration::from_secs(lock_sweep_interval_secs),
            log_filter,
            log_format,
            db_min_connections: parse_or(
                &env,
                "TESSERA_HUB_DB_MIN_CONNECTIONS",
                DEFAULT_DB_MIN_CONNECTIONS,
            ),
            db_max_connections: parse_or(
                &env,
                "TESSERA_HUB_DB_MAX_CONNECTIONS",
                DEFAULT_DB_MAX_CONNECTIONS,
            ),
            db_acquire_timeout: Duration::from_secs(parse_or(
                &env,
                "TESSERA_HUB_DB_ACQUIRE_TIMEOUT_SECS",
                DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
            )),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

fn positive_or(value: u64, default: u64) -> u64 {
    if value == 0 {
        default
    } else {
        value
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
