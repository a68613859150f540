//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::app::handler::JobContext;
use crate::domain::HandlerError;

/// Handler は Task を実行する
///
/// # 使用例
/// ```ignore
/// struct SendMailHandler;
///
/// #[async_trait]
/// impl Handler<SendMail> for SendMailHandler {
///     async fn handle(&self, ctx: &JobContext, task: SendMail) -> Result<(), HandlerError> {
///         mailer.send(&task.to).await.map_err(|e| HandlerError::new(e.to_string()))
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<SendMail>` は `SendMail` しか受け取れない
/// - コンパイル時に Task と Handler の対応が保証される
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: &JobContext, task: T) -> Result<(), HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<T> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        ctx: &JobContext,
        data: serde_json::Value,
    ) -> Result<(), HandlerError>;

    fn task_name(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        ctx: &JobContext,
        data: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let task: T = serde_json::from_value(data)
            .map_err(|e| HandlerError::new(format!("{}: json decode: {e}", T::NAME)))?;
        self.handler.handle(ctx, task).await
    }

    fn task_name(&self) -> &'static str {
        T::NAME
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use async_trait::async_trait;

    use super::Handler;
    use crate::app::handler::JobContext;
    use crate::domain::HandlerError;
    use crate::typed::task::fixtures::{ResizeImage, SendMail};

    pub struct ResizeImageHandler;

    #[async_trait]
    impl Handler<ResizeImage> for ResizeImageHandler {
        async fn handle(&self, _ctx: &JobContext, task: ResizeImage) -> Result<(), HandlerError> {
            if task.width == 0 {
                return Err(HandlerError::new("width must be positive"));
            }
            Ok(())
        }
    }

    pub struct SendMailHandler;

    #[async_trait]
    impl Handler<SendMail> for SendMailHandler {
        async fn handle(&self, _ctx: &JobContext, _task: SendMail) -> Result<(), HandlerError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::fixtures::ResizeImageHandler;
    use super::*;
    use crate::typed::task::fixtures::ResizeImage;

    fn ctx() -> JobContext {
        JobContext {
            job_id: None,
            ttr: Duration::from_secs(30),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let typed_handler = TypedHandler::<ResizeImage, _>::new(ResizeImageHandler);
        assert_eq!(typed_handler.task_name(), "image.resize.v1");

        typed_handler
            .handle_dyn(&ctx(), json!({ "width": 100 }))
            .await
            .unwrap();

        let err = typed_handler
            .handle_dyn(&ctx(), json!({ "width": 0 }))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "width must be positive");
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_wrong_shape() {
        let typed_handler = TypedHandler::<ResizeImage, _>::new(ResizeImageHandler);
        let err = typed_handler
            .handle_dyn(&ctx(), json!({ "height": 1 }))
            .await
            .unwrap_err();
        assert!(err.message().starts_with("image.resize.v1: json decode"));
    }
}
