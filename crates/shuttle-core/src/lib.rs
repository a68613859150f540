//! shuttle-core
//!
//! Broker-agnostic job queue: at-least-once delivery with delayed execution,
//! retry and pluggable backend semantics.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, job status, errors）
//! - **ports**: 抽象化レイヤー（Broker, Consumer, Clock, IdGenerator）
//! - **app**: キューエンジン（Queue, QueueBuilder, JobHandler, RetryPolicy, WorkerGroup）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TaskRegistry）
//! - **impls**: Broker の実装（InMemoryAmqp, InMemoryTube, `amqp` feature で lapin アダプター）
//!
//! # 使用例
//! ```ignore
//! let server = InMemoryTubeServer::new();
//! let queue = Queue::builder(server.connect("default")).build()?;
//!
//! let id = queue.job("hello").delay(Duration::from_secs(5)).push().await?;
//! let summary = queue.run(&handler).await?;
//! queue.close().await?;
//! ```

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{
    BuildError, JobContext, JobHandler, PushRequest, Queue, QueueBuilder, QueueConfig,
    RetryPolicy, RunSummary, WorkerGroup,
};
pub use crate::domain::{Envelope, HandlerError, JobId, JobStatus, QueueError, QueueIdentity};
pub use crate::ports::{Broker, BrokerError, Capabilities};
