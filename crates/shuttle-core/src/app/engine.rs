//! Queue - ブローカー非依存のジョブキューエンジン
//!
//! # 設計原則
//! - エンジンは `Broker` 能力だけを見る（具体的なトランスポート型を知らない）
//! - 遅延はブローカーに押し下げる（native delay か staging queue）。プロセス内タイマーなし
//! - prefetch = 1: 完了順 = 配送順。停止要求は配送と配送の間でだけ確認する
//! - 能力のない操作は I/O の前に `UnsupportedFeature` で失敗する
//! - consumer は listen / run のどの終了経路でも cancel してから返す
//!
//! # ジョブの状態遷移（エンジンから見えるもの）
//! ```text
//! NEW -> PUBLISHED -> (DELAYED -> VISIBLE) -> RESERVED -> DONE
//!                                                      -> FAILED -> RESERVED (retry)
//!                                                      -> FAILED -> DEAD
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::builder::QueueBuilder;
use crate::app::config::QueueConfig;
use crate::app::handler::{JobContext, JobHandler};
use crate::domain::{Envelope, JobId, JobStatus, QueueError, QueueIdentity};
use crate::ports::{Broker, BrokerError, Consumer, Delivery, Message, Route};
use crate::typed::{Task, encode_task};

/// At most one unacknowledged delivery per consumer.
pub const PREFETCH: u16 = 1;

/// Longest delay a push (or a retry backoff) may ask for.
///
/// Staging queues carry the delay as `x-message-ttl`, a 32-bit millisecond
/// count; whole seconds below that bound.
pub const MAX_DELAY: Duration = Duration::from_secs(u32::MAX as u64 / 1_000);

/// Longest TTR a push may ask for (beanstalk carries it as 32-bit seconds).
pub const MAX_TTR: Duration = Duration::from_secs(u32::MAX as u64);

/// One push: payload plus routing options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub payload: Vec<u8>,
    /// Falls back to `QueueConfig::default_ttr_secs`.
    pub ttr: Option<Duration>,
    pub delay: Duration,
    pub priority: Option<u32>,
}

impl PushRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ttr: None,
            delay: Duration::ZERO,
            priority: None,
        }
    }
}

/// Fluent push: `queue.job(payload).ttr(..).delay(..).priority(..).push()`.
#[must_use = "a job is only queued once `push()` is awaited"]
pub struct PushBuilder<'q, B: Broker> {
    queue: &'q Queue<B>,
    request: PushRequest,
}

impl<B: Broker> PushBuilder<'_, B> {
    pub fn ttr(mut self, ttr: Duration) -> Self {
        self.request.ttr = Some(ttr);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.request.delay = delay;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.request.priority = Some(priority);
        self
    }

    pub async fn push(self) -> Result<Option<JobId>, QueueError> {
        self.queue.push(self.request).await
    }
}

/// Counters returned when `listen` or `run` stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    /// Handler failures (retried or not) and undecodable messages.
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, succeeded: bool) {
        self.processed += 1;
        if succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Queue engine bound to one broker connection.
pub struct Queue<B: Broker> {
    broker: B,
    config: QueueConfig,
}

impl<B: Broker> Queue<B> {
    pub fn new(broker: B, config: QueueConfig) -> Self {
        Self { broker, config }
    }

    pub fn builder(broker: B) -> QueueBuilder<B> {
        QueueBuilder::new(broker)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// The queue this engine declares, publishes to and consumes from.
    pub fn identity(&self) -> &QueueIdentity {
        self.broker.identity()
    }

    pub fn job(&self, payload: impl Into<Vec<u8>>) -> PushBuilder<'_, B> {
        PushBuilder {
            queue: self,
            request: PushRequest::new(payload),
        }
    }

    pub async fn push(&self, request: PushRequest) -> Result<Option<JobId>, QueueError> {
        if request.priority.is_some() && !self.broker.capabilities().priority {
            return Err(QueueError::UnsupportedFeature("job priority"));
        }
        let ttr = whole_secs(request.ttr.unwrap_or_else(|| self.config.default_ttr()));
        if ttr.is_zero() {
            return Err(QueueError::InvalidRequest("ttr must be positive".into()));
        }
        if ttr > MAX_TTR {
            return Err(QueueError::InvalidRequest(format!(
                "ttr of {}s exceeds the maximum of {}s",
                ttr.as_secs(),
                MAX_TTR.as_secs()
            )));
        }
        if whole_secs(request.delay) > MAX_DELAY {
            return Err(QueueError::InvalidRequest(format!(
                "delay of {}s exceeds the maximum of {}s",
                request.delay.as_secs(),
                MAX_DELAY.as_secs()
            )));
        }

        let envelope = Envelope::new(ttr, request.payload);
        let mut message = Message::persistent(envelope.encode(), ttr);
        message.priority = request.priority;
        let route = self.route_for(request.delay, &mut message).await?;

        let job_id = self.broker.publish(&route, message).await?;
        debug!(
            queue = %self.identity().queue,
            %route,
            delay_secs = request.delay.as_secs(),
            job_id = ?job_id.map(|id| id.to_string()),
            "job pushed"
        );
        Ok(job_id)
    }

    /// Push a typed task as a JSON payload.
    pub async fn push_task<T: Task>(&self, task: &T) -> Result<Option<JobId>, QueueError> {
        let payload = encode_task(task)?;
        self.push(PushRequest::new(payload)).await
    }

    /// Consume until `shutdown` turns true (or its sender is dropped), the
    /// consumer is cancelled, or the transport fails.
    ///
    /// Shutdown is only observed between deliveries; a running handler always
    /// finishes and its delivery is settled first.
    pub async fn listen<H>(
        &self,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        self.broker.ensure_topology().await?;
        let mut consumer = self.broker.consume(PREFETCH).await?;
        info!(queue = %self.identity().queue, "listening");

        let result = self
            .listen_loop(handler, consumer.as_mut(), &mut shutdown)
            .await;
        let summary = self.finish(consumer.as_mut(), result).await?;
        info!(
            queue = %self.identity().queue,
            processed = summary.processed,
            failed = summary.failed,
            "listener stopped"
        );
        Ok(summary)
    }

    /// Process every visible job, returning once nothing arrives within the
    /// configured idle window.
    pub async fn run<H>(&self, handler: &H) -> Result<RunSummary, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        self.broker.ensure_topology().await?;
        let mut consumer = self.broker.consume(PREFETCH).await?;

        let result = self.run_loop(handler, consumer.as_mut()).await;
        let summary = self.finish(consumer.as_mut(), result).await?;
        debug!(queue = %self.identity().queue, ?summary, "queue drained");
        Ok(summary)
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatus, QueueError> {
        if !self.broker.capabilities().status {
            return Err(QueueError::UnsupportedFeature("status"));
        }
        Ok(self.broker.status(id).await?)
    }

    /// Delete a job that has not completed. `false` when it was not found.
    pub async fn remove(&self, id: &JobId) -> Result<bool, QueueError> {
        if !self.broker.capabilities().remove {
            return Err(QueueError::UnsupportedFeature("remove"));
        }
        let removed = self.broker.remove(id).await?;
        debug!(job_id = %id, removed, "remove");
        Ok(removed)
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.broker.close().await?;
        Ok(())
    }

    /// Run `work` and close the broker afterwards, whatever the outcome.
    ///
    /// ```ignore
    /// queue.scope(async { queue.job("hello").push().await }).await?;
    /// ```
    pub async fn scope<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<QueueError>,
    {
        let result = work.await;
        let closed = self.close().await;
        match (result, closed) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    async fn route_for(&self, delay: Duration, message: &mut Message) -> Result<Route, QueueError> {
        if delay.is_zero() {
            return Ok(self.broker.ensure_topology().await?);
        }
        if self.broker.capabilities().native_delay {
            message.delay = Some(delay);
            return Ok(self.broker.ensure_topology().await?);
        }
        Ok(self.broker.ensure_delay_topology(delay).await?)
    }

    async fn listen_loop<H>(
        &self,
        handler: &H,
        consumer: &mut dyn Consumer,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunSummary, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        let mut summary = RunSummary::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = consumer.next() => next?,
            };
            let Some(delivery) = next else {
                info!(queue = %self.identity().queue, "consumer cancelled by broker");
                break;
            };
            summary.record(self.process(handler, delivery).await?);
        }
        Ok(summary)
    }

    async fn run_loop<H>(
        &self,
        handler: &H,
        consumer: &mut dyn Consumer,
    ) -> Result<RunSummary, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        let idle = self.config.idle_timeout();
        let mut summary = RunSummary::default();
        while let Ok(next) = tokio::time::timeout(idle, consumer.next()).await {
            let Some(delivery) = next? else {
                break;
            };
            summary.record(self.process(handler, delivery).await?);
        }
        Ok(summary)
    }

    /// Cancel the consumer so the broker stops pushing to it, keeping the
    /// loop's own error when both fail.
    async fn finish(
        &self,
        consumer: &mut dyn Consumer,
        result: Result<RunSummary, QueueError>,
    ) -> Result<RunSummary, QueueError> {
        let cancelled = consumer.cancel().await;
        match (result, cancelled) {
            (Err(err), Err(cancel_err)) => {
                debug!(error = %cancel_err, "consumer cancel failed after an error");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
            (Ok(summary), Ok(())) => Ok(summary),
        }
    }

    /// Handle one delivery and settle it. `Ok(true)` when the handler succeeded.
    async fn process<H>(&self, handler: &H, delivery: Delivery) -> Result<bool, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        let tag = delivery.tag;
        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%tag, error = %err, "rejecting undecodable message");
                settle(self.broker.nack(tag, false).await)?;
                return Ok(false);
            }
        };

        let ctx = JobContext {
            job_id: delivery.job_id,
            ttr: envelope.ttr,
            attempt: delivery.attempt.max(1),
        };
        let job_id = ctx.job_id.map(|id| id.to_string()).unwrap_or_default();

        let started = Instant::now();
        let result = handler.handle(&ctx, &envelope.payload).await;
        let elapsed = started.elapsed();
        if !ctx.ttr.is_zero() && elapsed > ctx.ttr {
            warn!(
                %job_id,
                ttr_secs = ctx.ttr.as_secs(),
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "handler exceeded its ttr"
            );
        }

        match result {
            Ok(()) => {
                settle(self.broker.ack(tag).await)?;
                debug!(%job_id, attempt = ctx.attempt, "job done");
                Ok(true)
            }
            Err(err) if self.config.retry.should_retry(ctx.attempt) => {
                let delay = self.config.retry.next_delay(ctx.attempt).min(MAX_DELAY);
                warn!(
                    %job_id,
                    attempt = ctx.attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %err,
                    "job failed, scheduling retry"
                );
                self.republish(envelope, ctx.attempt + 1, delay).await?;
                settle(self.broker.ack(tag).await)?;
                Ok(false)
            }
            Err(err) => {
                error!(%job_id, attempt = ctx.attempt, error = %err, "job failed");
                settle(self.broker.nack(tag, false).await)?;
                Ok(false)
            }
        }
    }

    async fn republish(
        &self,
        envelope: Envelope,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut message = Message::persistent(envelope.encode(), envelope.ttr);
        message.attempt = attempt;
        let route = self.route_for(delay, &mut message).await?;
        self.broker.publish(&route, message).await?;
        Ok(())
    }
}

/// A delivery the broker no longer holds (reservation lapsed, connection
/// replaced) is already back in circulation; settling it is a no-op.
fn settle(result: Result<(), BrokerError>) -> Result<(), QueueError> {
    match result {
        Err(BrokerError::UnknownDelivery(tag)) => {
            warn!(%tag, "delivery no longer held by this connection");
            Ok(())
        }
        other => Ok(other?),
    }
}

fn whole_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs() + u64::from(d.subsec_nanos() > 0))
}
