//! Impls - Broker port の実装
//!
//! # 含まれる実装
//! - **InMemoryAmqp**: AMQP のセマンティクスを模した開発・テスト用ブローカー
//! - **InMemoryTube**: beanstalk 風の優先度付き tube（priority / status / remove / 遅延を持つ）
//! - **AmqpBroker**: lapin による本番用アダプター（`amqp` feature）

pub mod amqp_memory;
pub mod tube_memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use self::amqp_memory::{InMemoryAmqpBroker, InMemoryAmqpServer, QueueArgs};
pub use self::tube_memory::{DEFAULT_PRIORITY, InMemoryTubeBroker, InMemoryTubeServer, TubeStats};

#[cfg(feature = "amqp")]
pub use self::amqp::{AmqpBroker, AmqpConfig};
