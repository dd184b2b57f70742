//! Process-level error type unifying every lower crate's error for the
//! CLI's `anyhow::Result` boundary, following the reference `ClientError`
//! composition over a narrower system error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DcpError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Store(#[from] dcp_store::StoreError),

    #[error(transparent)]
    Bus(#[from] dcp_bus::BusError),

    #[error(transparent)]
    Engine(#[from] dcp_engine::EngineError),

    #[error("unknown bus provider '{0}'")]
    UnknownBusProvider(String),
}
