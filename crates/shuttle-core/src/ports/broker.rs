//! Broker port - メッセージブローカーの能力インターフェース
//!
//! エンジンは具体的なトランスポート型を一切見ません。
//! AMQP, beanstalk 風の tube, テスト用の in-memory 実装はすべてこの trait を実装します。
//!
//! # 設計原則
//! - 1 エンジン = 1 接続 = 1 チャネル（スレッド間で共有しない）
//! - 接続は最初の操作で遅延オープンし、`close()` は冪等
//! - prefetch = 1 の規律は Consumer 側で保証する（ack/nack 前に 2 件目を渡さない）
//! - 能力がない操作は `BrokerError::Unsupported` を即座に返す（黙って無視しない）

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{JobId, JobStatus, QueueIdentity};

/// What a backend can do beyond plain publish/consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Ordered delivery by per-job priority.
    pub priority: bool,
    /// `status(id)` introspection.
    pub status: bool,
    /// `remove(id)` of a waiting job.
    pub remove: bool,
    /// Per-message delay without staging topology.
    pub native_delay: bool,
    /// `publish` reports a backend-assigned [`JobId`].
    pub job_ids: bool,
}

/// Where a message is published: exchange plus routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Opaque delivery token, scoped to the connection that delivered it.
///
/// `scope` lets a backend tell tags of a replaced channel apart from live
/// ones; the raw tag alone is only unique per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag {
    scope: u64,
    raw: u64,
}

impl DeliveryTag {
    pub fn new(raw: u64) -> Self {
        Self::scoped(0, raw)
    }

    pub fn scoped(scope: u64, raw: u64) -> Self {
        Self { scope, raw }
    }

    pub fn scope(self) -> u64 {
        self.scope
    }

    pub fn raw(self) -> u64 {
        self.raw
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope == 0 {
            write!(f, "#{}", self.raw)
        } else {
            write!(f, "#{}.{}", self.scope, self.raw)
        }
    }
}

/// One message handed to [`Broker::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Encoded envelope.
    pub body: Vec<u8>,
    /// Survive a broker restart.
    pub persistent: bool,
    pub priority: Option<u32>,
    /// Only honoured by backends with `native_delay`.
    pub delay: Option<Duration>,
    /// Reservation timeout for backends that enforce one.
    pub ttr: Duration,
    /// 1-based attempt number carried as message metadata.
    pub attempt: u32,
}

impl Message {
    pub fn persistent(body: Vec<u8>, ttr: Duration) -> Self {
        Self {
            body,
            persistent: true,
            priority: None,
            delay: None,
            ttr,
            attempt: 1,
        }
    }
}

/// A message delivered to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    pub job_id: Option<JobId>,
    pub attempt: u32,
    pub redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    ConfigurationConflict(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("{0}")]
    Transport(String),
}

/// Stream of deliveries for one consumer.
///
/// `next()` must be cancel-safe: dropping the future before it resolves must
/// not lose a message.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `None` means the consumer was cancelled.
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError>;

    /// Stop the broker from handing this consumer more deliveries.
    ///
    /// Idempotent. Deliveries already received stay unsettled and must still
    /// be acked or nacked; `next()` returns `None` afterwards.
    async fn cancel(&mut self) -> Result<(), BrokerError>;
}

/// Capability contract every transport satisfies.
#[async_trait]
pub trait Broker: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Queue this connection declares, publishes to and consumes from.
    fn identity(&self) -> &QueueIdentity;

    /// Declare main queue, exchange and binding. Returns the main route.
    async fn ensure_topology(&self) -> Result<Route, BrokerError>;

    /// Declare the staging queue for `delay` and return its route.
    ///
    /// Backends with `native_delay` never need staging topology.
    async fn ensure_delay_topology(&self, delay: Duration) -> Result<Route, BrokerError> {
        let _ = delay;
        Err(BrokerError::Unsupported("delay topology"))
    }

    async fn publish(&self, route: &Route, message: Message)
        -> Result<Option<JobId>, BrokerError>;

    /// Start consuming the main queue with at most `prefetch` unacked deliveries.
    async fn consume(&self, prefetch: u16) -> Result<Box<dyn Consumer>, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn status(&self, id: &JobId) -> Result<JobStatus, BrokerError> {
        let _ = id;
        Err(BrokerError::Unsupported("status"))
    }

    /// Delete a job that has not completed. Returns whether it existed.
    async fn remove(&self, id: &JobId) -> Result<bool, BrokerError> {
        let _ = id;
        Err(BrokerError::Unsupported("remove"))
    }

    /// Release channel and connection. Idempotent, fine to call when never opened.
    async fn close(&self) -> Result<(), BrokerError>;
}
