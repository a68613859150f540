//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! エンジンはこの trait 群だけに依存し、ブローカーの実装詳細は impls 側に閉じ込めます。

pub mod broker;
pub mod clock;
pub mod id_generator;

pub use self::broker::{
    Broker, BrokerError, Capabilities, Consumer, Delivery, DeliveryTag, Message, Route,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
