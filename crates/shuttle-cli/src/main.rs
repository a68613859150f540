//! shuttle - job queue command line
//!
//! # Usage
//!
//! ```bash
//! # In-memory walkthrough: priorities, delays, retries
//! shuttle demo --jobs 5 --failures 2
//!
//! # Against RabbitMQ (built with `--features amqp`)
//! shuttle push --delay 10 '{"name":"shuttle"}'
//! shuttle listen
//! shuttle run
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

#[cfg(feature = "amqp")]
mod amqp;
mod demo;

#[derive(Parser)]
#[command(name = "shuttle", version, about = "Broker-agnostic job queue")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push, consume and retry jobs against an in-memory broker
    Demo(demo::DemoArgs),

    /// Push one job
    #[cfg(feature = "amqp")]
    Push(amqp::PushArgs),

    /// Consume jobs until Ctrl-C
    #[cfg(feature = "amqp")]
    Listen(amqp::ConnectArgs),

    /// Consume every visible job, then exit
    #[cfg(feature = "amqp")]
    Run(amqp::ConnectArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Demo(args) => demo::run(args).await,
        #[cfg(feature = "amqp")]
        Commands::Push(args) => amqp::push(args).await,
        #[cfg(feature = "amqp")]
        Commands::Listen(args) => amqp::listen(args).await,
        #[cfg(feature = "amqp")]
        Commands::Run(args) => amqp::run(args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}
