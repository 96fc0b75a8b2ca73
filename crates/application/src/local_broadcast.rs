// 进程内 broker 实现，每个频道一个 tokio broadcast 通道
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use domain::EventEnvelope;
use futures_util::{future, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::broker::{BrokerError, BrokerStream, ChatBroker};

pub struct LocalChatBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<EventEnvelope>>>,
    capacity: usize,
}

impl LocalChatBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// 当前订阅某个频道的监听者数量
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<EventEnvelope>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalChatBroker {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl ChatBroker for LocalChatBroker {
    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        let mut channels = self.lock();
        let Some(sender) = channels.get(channel) else {
            return Ok(());
        };
        if sender.receiver_count() == 0 {
            channels.remove(channel);
            return Ok(());
        }
        sender
            .send(envelope.clone())
            .map_err(|err| BrokerError::publish(err.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError> {
        let receiver = self
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let channel = channel.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            future::ready(match item {
                Ok(envelope) => Some(Ok(envelope)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %channel, skipped, "订阅者处理过慢，丢弃了部分事件");
                    None
                }
            })
        });
        Ok(stream.boxed())
    }
}
