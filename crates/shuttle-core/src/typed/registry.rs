//! TaskRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権
//!
//! TaskRegistry 自身が `JobHandler` なので、そのまま `Queue::listen` に渡せます。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::{Task, decode_task_payload};
use crate::app::handler::{JobContext, JobHandler};
use crate::domain::HandlerError;

/// TaskRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register::<SendMail, _>(SendMailHandler)?;
/// registry.ensure_registered(&["mail.send.v1"])?;
/// queue.listen(&registry, shutdown).await?;
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

/// RegistryError は TaskRegistry の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Missing task handlers: {0:?}. These tasks were expected but not registered.")]
    Missing(Vec<String>),
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let name = T::NAME.to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers
            .insert(name, Arc::new(TypedHandler::<T, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered task names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fail fast when an expected task has no handler.
    pub fn ensure_registered(&self, expected: &[&str]) -> Result<(), RegistryError> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|name| !self.handlers.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Missing(missing))
        }
    }
}

#[async_trait]
impl JobHandler for TaskRegistry {
    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> Result<(), HandlerError> {
        let decoded = decode_task_payload(payload)
            .map_err(|e| HandlerError::new(format!("invalid task payload: {e}")))?;
        let handler = self.get(&decoded.task).ok_or_else(|| {
            HandlerError::new(format!("no handler registered for task '{}'", decoded.task))
        })?;
        debug!(task = %decoded.task, attempt = ctx.attempt, "dispatching task");
        handler.handle_dyn(ctx, decoded.data).await
    }
}
