//! `dcp`: the data control plane's process entrypoint. One binary, one
//! subcommand per independent loop, following the reference `tasker-mcp`
//! binary's tracing-first bootstrap.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dcp::Engine;
use dcp_engine::config::{DcpConfig, ReceiverMode};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Coordination core for the on-prem-to-object-storage ingest pipeline.
#[derive(Parser)]
#[command(name = "dcp", author, version, about)]
struct Cli {
    /// Directory holding `base.toml` and `<env>.toml`.
    #[arg(long, env = "DCP_CONFIG_DIR", default_value = "config")]
    config_dir: String,

    /// Environment-specific config overlay name.
    #[arg(long, env = "DCP_ENV", default_value = "development")]
    env: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the completion-message receiver.
    Receiver {
        #[arg(long, value_enum)]
        mode: Option<CliReceiverMode>,
    },
    /// Runs the unqueued-task queuer.
    Queuer,
    /// Runs the retired-project resource cleaner.
    Cleaner,
    /// Runs the log-export driver.
    LogExport,
    /// Runs every loop under one runtime. Default for local/dev use.
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliReceiverMode {
    Single,
    RoundRobin,
}

impl From<CliReceiverMode> for ReceiverMode {
    fn from(mode: CliReceiverMode) -> Self {
        match mode {
            CliReceiverMode::Single => ReceiverMode::Single,
            CliReceiverMode::RoundRobin => ReceiverMode::RoundRobin,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dcp=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = DcpConfig::load(&cli.config_dir, &cli.env)?;
    let engine = Engine::bootstrap(config).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    match cli.command {
        Command::Receiver { mode } => engine.run_receiver(mode.map(Into::into), cancel).await,
        Command::Queuer => engine.run_queuer(cancel).await,
        Command::Cleaner => engine.run_cleaner(cancel).await,
        Command::LogExport => {
            let (_notifier, notifications) = dcp_engine::terminal_notify_channel();
            engine.run_log_export(notifications, cancel).await;
        }
        Command::All => engine.run_all(cancel).await,
    }

    Ok(())
}
