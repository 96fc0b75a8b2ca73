use async_trait::async_trait;
use domain::EventEnvelope;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// 订阅得到的事件流；流被 drop 时对应的 broker 订阅随之释放
pub type BrokerStream = BoxStream<'static, Result<EventEnvelope, BrokerError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

impl BrokerError {
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish(message.into())
    }
}

/// 发布/订阅 broker
#[async_trait]
pub trait ChatBroker: Send + Sync {
    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError>;
}

/// 提交之后的实时推送：失败只记录日志，不影响已经持久化的状态
pub async fn publish_best_effort(broker: &dyn ChatBroker, channel: &str, envelope: &EventEnvelope) {
    if let Err(err) = broker.publish(channel, envelope).await {
        tracing::warn!(
            channel = %channel,
            event = %envelope.event,
            error = %err,
            "实时推送失败，持久化状态不受影响"
        );
    }
}
