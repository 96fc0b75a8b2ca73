//! 延迟队列抽象
//!
//! 每个任务携带自己的到期时间进入等待区，到期后转入就绪队列，
//! 消费者手动确认；处理失败的任务带延迟重新入队。

use std::time::Duration;

use async_trait::async_trait;
use domain::{ChatId, ScheduledMessage, ScheduledMessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ApplicationError;

/// 投递到延迟队列的定时消息任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub scheduled_message_id: ScheduledMessageId,
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl From<&ScheduledMessage> for ScheduledJob {
    fn from(message: &ScheduledMessage) -> Self {
        Self {
            scheduled_message_id: message.id,
            chat_id: message.chat_id,
            author_id: message.author_id,
            content: message.content.as_str().to_string(),
            scheduled_at: message.scheduled_send_at,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// 队列不可达，可重试
    #[error("queue connection failed: {0}")]
    Connection(String),
    /// 任务本身无法被接受，需要修正输入
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("queue rejected job: {0}")]
    Publish(String),
}

#[async_trait]
pub trait DelayQueue: Send + Sync {
    async fn enqueue(&self, job: &ScheduledJob, delay: Duration) -> Result<(), QueueError>;
}

/// 队列消费端回调
///
/// 返回 `Ok` 即确认；返回 `Err` 时任务延迟后重新投递，
/// 达到最大处理次数后调用 `abandon` 并确认丢弃。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: ScheduledJob) -> Result<(), ApplicationError>;

    /// 任务重试次数用尽，即将从队列中移除
    async fn abandon(&self, _job: ScheduledJob, _reason: String) -> Result<(), ApplicationError> {
        Ok(())
    }
}

/// `send_at - now`，已经到期时为零
pub fn delay_until(send_at: Timestamp, now: Timestamp) -> Duration {
    let delta = send_at - now;
    if delta.is_positive() {
        Duration::try_from(delta).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn delay_is_clamped_at_zero() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            delay_until(now + time::Duration::seconds(5), now),
            Duration::from_secs(5)
        );
        assert_eq!(delay_until(now - time::Duration::seconds(5), now), Duration::ZERO);
    }

    #[test]
    fn job_serializes_with_wire_field_names() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let job = ScheduledJob {
            scheduled_message_id: ScheduledMessageId::new(3),
            chat_id: ChatId::new(7),
            author_id: UserId::new(9),
            content: "reminder".into(),
            scheduled_at: now,
            created_at: now,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["scheduled_message_id"], 3);
        assert_eq!(value["chat_id"], 7);
        assert_eq!(value["scheduled_at"], "2023-11-14T22:13:20Z");
    }
}
