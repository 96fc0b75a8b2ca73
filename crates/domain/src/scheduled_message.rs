//! 定时消息及其状态机
//!
//! ```text
//! Pending --claim--> Processing --ok--> Sent
//! Pending --claim--> Processing --err-> Failed
//! Pending --cancel----------------------> Canceled
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageContent, ScheduledMessageId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledMessageStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Canceled,
}

impl ScheduledMessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// 终态：Sent / Failed / Canceled
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Canceled)
    }

    /// Pending -> Failed 只用于入队失败
    pub fn can_transition_to(self, next: Self) -> bool {
        use ScheduledMessageStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Canceled)
                | (Pending, Failed)
                | (Processing, Sent)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for ScheduledMessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduledMessageStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(DomainError::validation_error(
                "status",
                format!("unknown scheduled message status '{other}'"),
            )),
        }
    }
}

/// 持久化的定时消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: ScheduledMessageId,
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub content: MessageContent,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_send_at: Timestamp,
    pub status: ScheduledMessageStatus,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

impl ScheduledMessage {
    /// 在内存中执行一次状态迁移，非法迁移返回错误
    pub fn transition(
        &mut self,
        next: ScheduledMessageStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.error_message = error_message;
        self.updated_at = at;
        Ok(())
    }
}

/// 新建定时消息（状态固定为 Pending）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScheduledMessage {
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub content: MessageContent,
    pub scheduled_send_at: Timestamp,
    pub created_at: Timestamp,
}

impl NewScheduledMessage {
    /// 发送时间必须严格晚于 `now`
    pub fn new(
        chat_id: ChatId,
        author_id: UserId,
        content: MessageContent,
        scheduled_send_at: Timestamp,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        if scheduled_send_at <= now {
            return Err(DomainError::validation_error(
                "scheduled_send_at",
                "scheduled in the past",
            ));
        }
        Ok(Self {
            chat_id,
            author_id,
            content,
            scheduled_send_at,
            created_at: now,
        })
    }

    pub fn into_scheduled(self, id: ScheduledMessageId) -> ScheduledMessage {
        ScheduledMessage {
            id,
            chat_id: self.chat_id,
            author_id: self.author_id,
            content: self.content,
            scheduled_send_at: self.scheduled_send_at,
            status: ScheduledMessageStatus::Pending,
            error_message: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}
