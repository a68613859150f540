//! JobHandler - ユーザーのジョブロジックを呼び出す契約
//!
//! # 学習ポイント
//! - `async_trait` による object-safe な async trait（`Arc<dyn JobHandler>` で共有）
//! - TTR は助言的: エンジンは値を渡し、超過したら警告ログを出すだけ（強制終了しない）
//! - 戻り値の Ok / Err が ack / retry / reject の判断材料になる

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{HandlerError, JobId};

/// What the engine knows about the job being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// Only backends with `Capabilities::job_ids` report one.
    pub job_id: Option<JobId>,
    pub ttr: Duration,
    /// 1-based.
    pub attempt: u32,
}

/// User job logic.
///
/// # 使用例
/// ```ignore
/// struct SendMail;
///
/// #[async_trait]
/// impl JobHandler for SendMail {
///     async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> Result<(), HandlerError> {
///         deliver(payload).await.map_err(|e| HandlerError::new(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: JobHandler + ?Sized> JobHandler for Arc<H> {
    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> Result<(), HandlerError> {
        (**self).handle(ctx, payload).await
    }
}
