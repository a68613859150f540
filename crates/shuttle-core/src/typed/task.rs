//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)
//!
//! 型付きジョブのペイロードは `{"task": NAME, "data": ...}` という JSON です。
//! エンベロープから見ればただのバイト列なので、ブローカーは何も知りません。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Task は task 名と型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendMail {
///     to: String,
/// }
///
/// impl Task for SendMail {
///     const NAME: &'static str = "mail.send.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: push 時のエンコードのため
/// - `DeserializeOwned`: handler に渡す前のデコードのため
/// - `Send + Sync + 'static`: Arc に格納してワーカー間で共有するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// # 命名規約
    /// - `{domain}.{action}.v{major}`
    /// - 例: `billing.charge.v1`
    const NAME: &'static str;
}

#[derive(Serialize)]
struct Outgoing<'a, T> {
    task: &'a str,
    data: &'a T,
}

/// Decoded but not yet typed payload.
#[derive(Debug, Deserialize)]
pub struct TaskPayload {
    pub task: String,
    pub data: serde_json::Value,
}

pub fn encode_task<T: Task>(task: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Outgoing {
        task: T::NAME,
        data: task,
    })
}

pub fn decode_task_payload(payload: &[u8]) -> Result<TaskPayload, serde_json::Error> {
    serde_json::from_slice(payload)
}
