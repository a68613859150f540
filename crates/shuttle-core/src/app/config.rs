//! QueueConfig - エンジンの設定
//!
//! 設定ファイルの読み込みは扱いません。serde で Deserialize できる構造体と
//! Default だけを提供し、CLI や呼び出し側が値を詰めます。
//!
//! キュー名 / exchange / vhost はここには置きません。ブローカー接続が持つ
//! `QueueIdentity` だけが宣言・publish・consume の対象を決めます。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;

/// TTR used when a push does not set one.
pub const DEFAULT_TTR_SECS: u64 = 300;

/// How long `run()` waits for a delivery before deciding the queue is drained.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_ttr_secs: u64,
    pub idle_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_ttr_secs: DEFAULT_TTR_SECS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn default_ttr(&self) -> Duration {
        Duration::from_secs(self.default_ttr_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
