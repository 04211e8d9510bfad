use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format '{}', expected text or json", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Admin JSON API listener.
    pub admin_bind: SocketAddr,
    /// Forward-auth listener.
    pub auth_bind: SocketAddr,
    /// Postgres URL, or `memory://` for the in-process store.
    pub database_url: String,
    pub db_max_conn: u32,
    /// Header carrying the acting user on admin requests.
    pub user_header: String,
    /// Development only: treat every admin request as this user.
    pub debug_impersonate: Option<String>,
    /// keyID cache lifetime. Zero disables the cache.
    pub cache_ttl: Duration,
    pub stats_buffer: usize,
    pub stats_interval: Duration,
    pub store_timeout: Duration,
    pub store_retries: u32,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            auth_bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
            database_url: "memory://".into(),
            db_max_conn: 10,
            user_header: "X-User".into(),
            debug_impersonate: None,
            cache_ttl: Duration::from_secs(15),
            stats_buffer: 2048,
            stats_interval: Duration::from_secs(5),
            store_timeout: Duration::from_millis(5000),
            store_retries: 3,
            log_format: LogFormat::Text,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|name| std::env::var(name).ok())
}

/// Build a config from an arbitrary variable source. Unset variables take
/// their defaults; set but unparsable ones are an error.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let defaults = Config::default();

    let var = |name: &str| {
        lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    fn typed<T>(name: &str, raw: Option<String>, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match raw {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("invalid value for {}: '{}'", name, raw)),
        }
    }

    let debug_impersonate = var("DEBUG_IMPERSONATE");
    if debug_impersonate.is_some() {
        let env_mode = var("TOKENGATE_ENV")
            .or(var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!("DEBUG_IMPERSONATE must not be set in production");
        }
    }

    let stats_interval_secs: u64 = typed(
        "STATS_INTERVAL_SECS",
        var("STATS_INTERVAL_SECS"),
        defaults.stats_interval.as_secs(),
    )?;
    if stats_interval_secs == 0 {
        anyhow::bail!("STATS_INTERVAL_SECS must be at least 1");
    }

    Ok(Config {
        admin_bind: typed("ADMIN_BIND", var("ADMIN_BIND"), defaults.admin_bind)?,
        auth_bind: typed("AUTH_BIND", var("AUTH_BIND"), defaults.auth_bind)?,
        database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
        db_max_conn: typed("DB_MAX_CONN", var("DB_MAX_CONN"), defaults.db_max_conn)?,
        user_header: var("USER_HEADER").unwrap_or(defaults.user_header),
        debug_impersonate,
        cache_ttl: Duration::from_secs(typed(
            "CACHE_TTL_SECS",
            var("CACHE_TTL_SECS"),
            defaults.cache_ttl.as_secs(),
        )?),
        stats_buffer: typed("STATS_BUFFER", var("STATS_BUFFER"), defaults.stats_buffer)?,
        stats_interval: Duration::from_secs(stats_interval_secs),
        store_timeout: Duration::from_millis(typed(
            "STORE_TIMEOUT_MS",
            var("STORE_TIMEOUT_MS"),
            defaults.store_timeout.as_millis() as u64,
        )?),
        store_retries: typed("STORE_RETRIES", var("STORE_RETRIES"), defaults.store_retries)?,
        log_format: typed("LOG_FORMAT", var("LOG_FORMAT"), defaults.log_format)?,
    })
}
