//! Redis Pub/Sub 实现的 broker
//!
//! 发布走共享的 `ConnectionManager`；每个订阅独占一条 pub/sub 连接，
//! 流被 drop 时连接关闭，订阅随之释放。

use application::{BrokerError, BrokerStream, ChatBroker};
use async_trait::async_trait;
use domain::EventEnvelope;
use futures_util::{future, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, warn};

use crate::redis::{RedisError, RedisResult};

#[derive(Clone)]
pub struct RedisChatBroker {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisChatBroker {
    pub fn new(client: Client, publisher: ConnectionManager) -> Self {
        Self { client, publisher }
    }

    /// 单独创建一个 broker（测试和工具用）
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = Client::open(url).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self::new(client, publisher))
    }

    async fn publish_raw(&self, channel: &str, payload: String) -> RedisResult<u64> {
        let mut conn = self.publisher.clone();
        conn.publish(channel, payload)
            .await
            .map_err(|e| RedisError::PublishError {
                message: format!("发布到 {} 失败: {}", channel, e),
            })
    }

    async fn subscribe_raw(&self, channel: &str) -> RedisResult<BrokerStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| RedisError::SubscribeError {
                message: format!("订阅 {} 失败: {}", channel, e),
            })?;

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let decoded = decode(&channel, &msg);
            future::ready(decoded)
        });
        Ok(stream.boxed())
    }
}

// 无法解析的消息只记录日志，不中断订阅
fn decode(channel: &str, msg: &redis::Msg) -> Option<Result<EventEnvelope, BrokerError>> {
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(channel = %channel, error = %err, "无法读取 Redis 消息内容，已丢弃");
            return None;
        }
    };
    match EventEnvelope::from_json(&payload) {
        Ok(envelope) => Some(Ok(envelope)),
        Err(err) => {
            warn!(channel = %channel, error = %err, "无法解析事件信封，已丢弃");
            None
        }
    }
}

#[async_trait]
impl ChatBroker for RedisChatBroker {
    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        let payload = envelope.to_json().map_err(RedisError::from)?;
        let receivers = self.publish_raw(channel, payload).await?;
        debug!(channel = %channel, event = %envelope.event, receivers, "事件已发布");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError> {
        let stream = self.subscribe_raw(channel).await?;
        debug!(channel = %channel, "已订阅 Redis 频道");
        Ok(stream)
    }
}
