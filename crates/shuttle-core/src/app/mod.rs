//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてキューエンジンを実装します。
//!
//! # 主要コンポーネント
//! - **Queue**: push / listen / run / status / remove / close
//! - **QueueBuilder**: エンジンの構築と起動時検証
//! - **JobHandler**: ユーザーのジョブロジックの呼び出し契約
//! - **RetryPolicy**: 失敗したジョブの再実行判断
//! - **WorkerGroup**: 複数エンジンの起動と停止

pub mod builder;
pub mod config;
pub mod engine;
pub mod handler;
pub mod retry;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, QueueBuilder};
pub use self::config::QueueConfig;
pub use self::engine::{MAX_DELAY, MAX_TTR, PREFETCH, PushBuilder, PushRequest, Queue, RunSummary};
pub use self::handler::{JobContext, JobHandler};
pub use self::retry::RetryPolicy;
pub use self::worker::WorkerGroup;
