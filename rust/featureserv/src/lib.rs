pub mod catalog;
pub mod classify;
pub mod config;
pub mod db;
pub mod edits;
pub mod error;
pub mod geometry;
pub mod models;
pub mod query;
pub mod registry;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod where_clause;

use crate::{config::AppConfig, server::Server};

/// Starts the feature service from `FEATURESERV_*` environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
