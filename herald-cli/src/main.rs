use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use herald_broker::BrokerKind;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod sample;

use config::{ConfigLoader, RawHeraldConfig};

#[derive(Parser)]
#[command(name = "herald", about = "Publish and consume CloudEvents over Kafka")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ./herald.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Broker implementation
    #[arg(long, global = true, value_enum)]
    broker: Option<BrokerArg>,

    /// Kafka bootstrap servers, comma separated
    #[arg(long, global = true, value_delimiter = ',')]
    bootstrap: Option<Vec<String>>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BrokerArg {
    Memory,
    Kafka,
}

impl From<BrokerArg> for BrokerKind {
    fn from(arg: BrokerArg) -> Self {
        match arg {
            BrokerArg::Memory => BrokerKind::Memory,
            BrokerArg::Kafka => BrokerKind::Kafka,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configuration
    Config(commands::config::ConfigArgs),
    /// Send and receive sample records through an in-memory broker
    Demo(commands::demo::DemoArgs),
    /// Consume records and log them
    Listen(commands::listen::ListenArgs),
    /// Publish a sample record periodically
    Send(commands::send::SendArgs),
}

impl Cli {
    fn overrides(&self) -> RawHeraldConfig {
        let mut raw = RawHeraldConfig::default();
        raw.broker.kind = self.broker.map(BrokerKind::from);
        raw.broker.brokers = self.bootstrap.clone();
        raw
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let overrides = cli.overrides();
    let explicit = cli.config.as_deref();

    match cli.command {
        Commands::Config(args) => commands::config::run(args, explicit, overrides),
        Commands::Demo(args) => {
            let config = ConfigLoader::load(explicit, overrides)?;
            commands::demo::run(args, config, shutdown_on_ctrl_c()).await
        }
        Commands::Listen(args) => {
            let config = ConfigLoader::load(explicit, overrides)?;
            commands::listen::run(args, config, shutdown_on_ctrl_c()).await
        }
        Commands::Send(args) => {
            let config = ConfigLoader::load(explicit, overrides)?;
            commands::send::run(args, config, shutdown_on_ctrl_c()).await
        }
    }
}

/// Cancel the returned token on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
        token.cancel();
    });
    cancel
}
