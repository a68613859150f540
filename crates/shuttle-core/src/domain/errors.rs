//! Errors - エンジン表面のエラー型と分類
//!
//! # 分類
//! - BrokerUnavailable: トランスポート障害（listen ループは終了、外部の supervisor が再起動）
//! - UnsupportedFeature: バックエンドが持たない機能（恒久的、リトライ無意味）
//! - ConfigurationConflict: 既存トポロジーとの不一致（起動時に致命的）
//! - HandlerFailure: ジョブ自体の失敗（ack/nack の判断材料、ループは止めない）

use crate::domain::envelope::EnvelopeError;
use crate::ports::broker::BrokerError;

/// Error returned by queue engine operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("{0} is not supported by this backend")]
    UnsupportedFeature(&'static str),

    #[error("topology conflict: {0}")]
    ConfigurationConflict(String),

    #[error("job handler failed: {0}")]
    HandlerFailure(#[from] HandlerError),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error("invalid push request: {0}")]
    InvalidRequest(String),

    #[error("task payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl QueueError {
    /// Capability limitations are permanent; callers should not retry them.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            QueueError::UnsupportedFeature(_)
                | QueueError::ConfigurationConflict(_)
                | QueueError::InvalidRequest(_)
        )
    }
}

impl From<BrokerError> for QueueError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) => QueueError::BrokerUnavailable(msg),
            BrokerError::Unsupported(what) => QueueError::UnsupportedFeature(what),
            BrokerError::ConfigurationConflict(msg) => QueueError::ConfigurationConflict(msg),
            other => QueueError::Broker(other.to_string()),
        }
    }
}

/// Failure reported by job logic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
