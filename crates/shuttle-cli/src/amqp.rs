use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use shuttle_core::impls::{AmqpBroker, AmqpConfig};
use shuttle_core::{
    HandlerError, JobContext, JobHandler, Queue, QueueConfig, QueueIdentity, RetryPolicy,
};
use tokio::sync::watch;
use tracing::info;

#[derive(Args)]
pub struct ConnectArgs {
    #[arg(long, env = "SHUTTLE_AMQP_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "SHUTTLE_AMQP_PORT", default_value_t = 5672)]
    port: u16,

    #[arg(long, env = "SHUTTLE_AMQP_USER", default_value = "guest")]
    user: String,

    #[arg(long, env = "SHUTTLE_AMQP_PASSWORD", default_value = "guest", hide_env_values = true)]
    password: String,

    #[arg(long, env = "SHUTTLE_VHOST", default_value = "/")]
    vhost: String,

    #[arg(long, env = "SHUTTLE_QUEUE", default_value = "queue")]
    queue: String,

    #[arg(long, env = "SHUTTLE_EXCHANGE", default_value = "exchange")]
    exchange: String,

    /// Attempts per job, including the first
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,

    /// Idle window in milliseconds before `run` exits
    #[arg(long, default_value_t = 1_000)]
    idle_ms: u64,
}

#[derive(Args)]
pub struct PushArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Time to run in seconds
    #[arg(long, default_value_t = 300)]
    ttr: u64,

    /// Delay in seconds before the job becomes visible
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Job payload, passed to the handler as-is
    payload: String,
}

impl ConnectArgs {
    fn queue(&self) -> Result<Queue<AmqpBroker>> {
        let config = QueueConfig {
            idle_timeout_ms: self.idle_ms,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            ..QueueConfig::default()
        };
        let amqp = AmqpConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
        };
        let identity = QueueIdentity::new(&self.queue, &self.exchange, &self.vhost);
        let broker = AmqpBroker::new(amqp, identity);
        Queue::builder(broker)
            .config(config)
            .build()
            .context("invalid queue configuration")
    }
}

/// Prints each payload to stdout.
struct PrintHandler;

#[async_trait]
impl JobHandler for PrintHandler {
    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> Result<(), HandlerError> {
        println!(
            "attempt {} (ttr {}s): {}",
            ctx.attempt,
            ctx.ttr.as_secs(),
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }
}

pub async fn push(args: PushArgs) -> Result<()> {
    let queue = args.connect.queue()?;
    queue
        .scope(async {
            queue
                .job(args.payload.as_bytes())
                .ttr(Duration::from_secs(args.ttr))
                .delay(Duration::from_secs(args.delay))
                .push()
                .await
        })
        .await?;
    println!("pushed to {}", args.connect.queue);
    Ok(())
}

pub async fn listen(args: ConnectArgs) -> Result<()> {
    let queue = args.queue()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping after the current job");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = queue
        .scope(async { queue.listen(&PrintHandler, shutdown_rx).await })
        .await?;
    println!(
        "processed={} succeeded={} failed={}",
        summary.processed, summary.succeeded, summary.failed
    );
    Ok(())
}

pub async fn run(args: ConnectArgs) -> Result<()> {
    let queue = args.queue()?;
    let summary = queue.scope(async { queue.run(&PrintHandler).await }).await?;
    println!(
        "processed={} succeeded={} failed={}",
        summary.processed, summary.succeeded, summary.failed
    );
    Ok(())
}
