use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

pub const QUERY_LIMIT: i64 = 10_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub api_key: Option<String>,
    pub registry_path: PathBuf,
    pub default_limit: i64,
    pub max_limit: i64,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    featureserv_listen_addr: Option<String>,
    #[serde(default)]
    featureserv_listen_host: Option<String>,
    #[serde(default)]
    featureserv_listen_port: Option<u16>,
    #[serde(default)]
    featureserv_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    featureserv_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    featureserv_api_key: Option<String>,
    #[serde(default)]
    featureserv_registry_path: Option<PathBuf>,
    #[serde(default = "default_limit")]
    featureserv_default_limit: i64,
    #[serde(default = "default_max_limit")]
    featureserv_max_limit: i64,
    #[serde(default = "default_timeout_secs")]
    featureserv_request_timeout_secs: u64,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_limit() -> i64 {
    QUERY_LIMIT
}

const fn default_max_limit() -> i64 {
    QUERY_LIMIT
}

const fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse FEATURESERV_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.featureserv_listen_addr,
            raw.featureserv_listen_host,
            raw.featureserv_listen_port,
        )?;

        let database_url = raw
            .featureserv_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("FEATURESERV_DATABASE_URL or DATABASE_URL must be set")?;

        let registry_path = raw
            .featureserv_registry_path
            .unwrap_or_else(|| PathBuf::from("services.json"));

        let default_limit = raw.featureserv_default_limit.max(1);

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.featureserv_max_pool_size,
            pg_ssl_root_cert: non_empty(raw.pgsslrootcert),
            pg_ssl_cert: non_empty(raw.pgsslcert),
            pg_ssl_key: non_empty(raw.pgsslkey),
            api_key: non_empty(raw.featureserv_api_key),
            registry_path,
            default_limit,
            max_limit: raw.featureserv_max_limit.max(default_limit),
            request_timeout: Duration::from_secs(raw.featureserv_request_timeout_secs.max(1)),
        })
    }

    /// Clamps a client supplied limit; zero or absent means the default.
    pub fn effective_limit(&self, requested: Option<i64>) -> i64 {
        match requested {
            Some(limit) if limit > 0 => limit.min(self.max_limit),
            _ => self.default_limit,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid FEATURESERV_LISTEN_ADDR value")?
            .next()
            .context("FEATURESERV_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        database_url: "postgres://example/db".to_string(),
        max_pool_size: 1,
        pg_ssl_root_cert: None,
        pg_ssl_cert: None,
        pg_ssl_key: None,
        api_key: None,
        registry_path: PathBuf::from("services.json"),
        default_limit: QUERY_LIMIT,
        max_limit: QUERY_LIMIT,
        request_timeout: Duration::from_secs(30),
    }
}
