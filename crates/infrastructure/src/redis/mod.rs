//! Redis 适配器
//!
//! 提供 Pub/Sub broker 和基于 sorted set 的延迟队列。

pub mod delay_queue;
pub mod error;
pub mod pubsub;

// 重新导出
pub use delay_queue::*;
pub use error::*;
pub use pubsub::*;
