//! 基础设施层实现。
//!
//! 提供 PostgreSQL 存储、Redis broker 与延迟队列、WebSocket 传输等适配器，
//! 实现应用层定义的接口。

pub mod builder;
pub mod migrations;
pub mod redis;
pub mod repository;
pub mod retry;
pub mod websocket;

pub use builder::{Infrastructure, InfrastructureError};
pub use migrations::MIGRATOR;
pub use crate::redis::{QueuedJob, RedisChatBroker, RedisDelayQueue, RedisError};
pub use repository::{create_pg_pool, PgStore};
pub use retry::{retry_async, Backoff, RetryPolicy};
pub use websocket::{ws_router, WebSocketTransport, WsSink, WsSource, USER_ID_HEADER};
