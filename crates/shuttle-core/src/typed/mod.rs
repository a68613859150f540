//! Typed - 型付き Task API
//!
//! このモジュールは task 名の typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! エンジンから見ると TaskRegistry は 1 つの `JobHandler` にすぎません。

pub mod handler;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::handler::{DynHandler, Handler, TypedHandler};
pub use self::registry::{RegistryError, TaskRegistry};
pub use self::task::{Task, TaskPayload, decode_task_payload, encode_task};
