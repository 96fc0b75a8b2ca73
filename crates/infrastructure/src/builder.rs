use std::sync::Arc;
use std::time::Duration;

use config::AppConfig;
use redis::{aio::ConnectionManager, Client};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::{
    migrations::MIGRATOR,
    redis::{RedisChatBroker, RedisDelayQueue},
    repository::{create_pg_pool, PgStore},
    retry::{retry_async, RetryPolicy},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

fn transient_sqlx(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
    )
}

fn transient_redis(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_timeout()
}

/// 启动时建立的全部外部连接
#[derive(Clone)]
pub struct Infrastructure {
    pub pool: PgPool,
    pub store: Arc<PgStore>,
    pub broker: Arc<RedisChatBroker>,
    pub delay_queue: Arc<RedisDelayQueue>,
}

impl Infrastructure {
    /// 连接 PostgreSQL 并执行迁移，再连接 Redis；连接失败按重试策略退避
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let policy = RetryPolicy::from(&config.retry);

        let acquire_timeout = Duration::from_secs(config.database.acquire_timeout_secs);
        let pool = retry_async("postgres", &policy, transient_sqlx, || {
            create_pg_pool(
                &config.database.url,
                config.database.max_connections,
                acquire_timeout,
            )
        })
        .await?;
        MIGRATOR.run(&pool).await?;
        info!(max_connections = config.database.max_connections, "数据库连接池已就绪");

        let client = Client::open(config.redis.url.as_str())?;
        let manager = retry_async("redis", &policy, transient_redis, || {
            ConnectionManager::new(client.clone())
        })
        .await?;
        info!("Redis 连接已就绪");

        let broker = Arc::new(RedisChatBroker::new(client, manager.clone()));
        let delay_queue = Arc::new(RedisDelayQueue::new(manager, config.delay_queue.clone()));

        Ok(Self {
            store: Arc::new(PgStore::new(pool.clone())),
            pool,
            broker,
            delay_queue,
        })
    }

    pub async fn shutdown(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retried() {
        assert!(transient_sqlx(&sqlx::Error::PoolTimedOut));
        assert!(!transient_sqlx(&sqlx::Error::RowNotFound));

        let refused = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(transient_redis(&refused));
        let bad_url = redis::RedisError::from((redis::ErrorKind::InvalidClientConfig, "bad url"));
        assert!(!transient_redis(&bad_url));
    }
}
