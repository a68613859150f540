//! QueueBuilder - エンジンの構築と起動時検証
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: おかしな設定はジョブを流す前に弾く
//! - 開発体験の改善（明確なエラーメッセージ）

use std::time::Duration;

use crate::app::config::QueueConfig;
use crate::app::engine::Queue;
use crate::app::retry::RetryPolicy;
use crate::ports::Broker;

/// QueueBuilder は Queue を構築
///
/// # 使用例
/// ```ignore
/// let queue = Queue::builder(broker)
///     .default_ttr(Duration::from_secs(60))
///     .retry(RetryPolicy::exponential(3, Duration::from_secs(5), 2.0))
///     .build()?;
/// ```
pub struct QueueBuilder<B: Broker> {
    broker: B,
    config: QueueConfig,
}

/// BuildError は構築時の設定エラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("{0} name must not be empty")]
    EmptyName(&'static str),

    #[error("default ttr must be at least one second")]
    ZeroTtr,

    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
}

impl<B: Broker> QueueBuilder<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            config: QueueConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_ttr(mut self, ttr: Duration) -> Self {
        self.config.default_ttr_secs = ttr.as_secs();
        self
    }

    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.config.idle_timeout_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> Result<Queue<B>, BuildError> {
        // 宣言されるのはブローカー側の identity なので、そちらを検証する
        let identity = self.broker.identity();
        if identity.queue.is_empty() {
            return Err(BuildError::EmptyName("queue"));
        }
        if identity.is_routed() {
            if identity.exchange.is_empty() {
                return Err(BuildError::EmptyName("exchange"));
            }
            if identity.vhost.is_empty() {
                return Err(BuildError::EmptyName("vhost"));
            }
        }
        let config = &self.config;
        if config.default_ttr_secs == 0 {
            return Err(BuildError::ZeroTtr);
        }
        let retry = &config.retry;
        if retry.max_attempts == 0 {
            return Err(BuildError::InvalidRetry("max_attempts must be at least 1".into()));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(BuildError::InvalidRetry(format!(
                "multiplier {} must be a finite number >= 1",
                retry.multiplier
            )));
        }
        Ok(Queue::new(self.broker, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueIdentity;
    use crate::impls::{InMemoryAmqpServer, InMemoryTubeServer};

    fn builder() -> QueueBuilder<crate::impls::InMemoryTubeBroker> {
        QueueBuilder::new(InMemoryTubeServer::new().connect("default"))
    }

    #[test]
    fn test_build_success() {
        let queue = builder()
            .default_ttr(Duration::from_secs(60))
            .retry(RetryPolicy::exponential(3, Duration::from_secs(1), 2.0))
            .build()
            .unwrap();
        assert_eq!(queue.config().default_ttr_secs, 60);
        assert_eq!(queue.config().retry.max_attempts, 3);
    }

    #[test]
    fn test_build_rejects_empty_queue_name() {
        let result = QueueBuilder::new(InMemoryTubeServer::new().connect("")).build();
        assert!(matches!(result, Err(BuildError::EmptyName("queue"))));

        let server = InMemoryAmqpServer::new();
        let result = QueueBuilder::new(server.connect(QueueIdentity::new("", "", "/")))
            .config(QueueConfig::default())
            .build();
        assert!(matches!(result, Err(BuildError::EmptyName("queue"))));
    }

    #[test]
    fn test_build_validates_the_identity_the_broker_declares() {
        let server = InMemoryAmqpServer::new();
        let result = QueueBuilder::new(server.connect(QueueIdentity::new("mail", "", "/"))).build();
        assert!(matches!(result, Err(BuildError::EmptyName("exchange"))));

        let result = QueueBuilder::new(server.connect(QueueIdentity::new("mail", "mail-ex", "")))
            .build();
        assert!(matches!(result, Err(BuildError::EmptyName("vhost"))));

        let queue = QueueBuilder::new(server.connect(QueueIdentity::new("mail", "mail-ex", "/")))
            .build()
            .unwrap();
        assert_eq!(queue.identity().queue, "mail");
    }

    #[test]
    fn test_build_rejects_sub_second_ttr() {
        let result = builder().default_ttr(Duration::from_millis(500)).build();
        assert!(matches!(result, Err(BuildError::ZeroTtr)));
    }

    #[test]
    fn test_build_rejects_bad_retry() {
        let result = builder()
            .retry(RetryPolicy::exponential(0, Duration::from_secs(1), 2.0))
            .build();
        assert!(matches!(result, Err(BuildError::InvalidRetry(_))));

        let result = builder()
            .retry(RetryPolicy::exponential(2, Duration::from_secs(1), 0.5))
            .build();
        assert!(matches!(result, Err(BuildError::InvalidRetry(_))));
    }
}
