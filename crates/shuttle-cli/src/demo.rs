use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde::{Deserialize, Serialize};
use shuttle_core::impls::InMemoryTubeServer;
use shuttle_core::typed::{Handler, Task, TaskRegistry};
use shuttle_core::{HandlerError, JobContext, Queue, RetryPolicy};
use tracing::info;

const TUBE: &str = "demo";

#[derive(Args)]
pub struct DemoArgs {
    /// Number of jobs to push
    #[arg(long, default_value_t = 3)]
    jobs: u32,

    /// Failures to inject before the handler starts succeeding
    #[arg(long, default_value_t = 2)]
    failures: u32,

    /// Attempts per job, including the first
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Delay in seconds for the last job
    #[arg(long, default_value_t = 1)]
    delay: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
}

impl Task for Hello {
    const NAME: &'static str = "demo.hello.v1";
}

struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn handle(&self, ctx: &JobContext, task: Hello) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }

        let id = ctx.job_id.map(|id| id.to_string()).unwrap_or_default();
        println!("Hello, {}! ({id}, attempt {})", task.name, ctx.attempt);
        Ok(())
    }
}

pub async fn run(args: DemoArgs) -> Result<()> {
    let server = InMemoryTubeServer::new();
    let queue = Queue::builder(server.connect(TUBE))
        .retry(RetryPolicy::exponential(
            args.max_attempts,
            Duration::from_secs(1),
            2.0,
        ))
        .idle_timeout(Duration::from_secs(args.delay + 3))
        .build()
        .context("invalid demo configuration")?;

    let mut registry = TaskRegistry::new();
    registry.register::<Hello, _>(HelloHandler::new(args.failures))?;

    for i in 0..args.jobs {
        let payload = shuttle_core::typed::encode_task(&Hello {
            name: format!("shuttle #{i}"),
        })?;
        // later jobs are more urgent; the last one is also delayed
        let mut job = queue.job(payload).priority(args.jobs - i);
        if i + 1 == args.jobs {
            job = job.delay(Duration::from_secs(args.delay));
        }
        let id = job.push().await?;
        info!(job_id = ?id.map(|id| id.to_string()), "pushed");
    }
    println!("queued: {:?}", server.stats(TUBE).await);

    let summary = queue.scope(async { queue.run(&registry).await }).await?;
    println!(
        "processed={} succeeded={} failed={}",
        summary.processed, summary.succeeded, summary.failed
    );
    println!("final: {:?}", server.stats(TUBE).await);
    Ok(())
}
