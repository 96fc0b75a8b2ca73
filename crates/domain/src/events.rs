//! 实时事件
//!
//! 客户端连接与 broker 频道上传输的都是同一种信封：
//! `{"event": "<name>", "data": {...}}`。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;
use crate::read_cursor::ReadCursor;
use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

/// 聊天频道名：`chat:{id}`
pub fn chat_channel(chat_id: ChatId) -> String {
    format!("chat:{chat_id}")
}

/// 用户私有频道名：`user:{id}`
pub fn user_channel(user_id: UserId) -> String {
    format!("user:{user_id}")
}

/// 所有已知事件名（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // 客户端 -> 服务端
    NewMessage,
    ReadMessage,
    GetUnreadCounts,
    // broker -> 会话
    MessageSent,
    ReadStatusUpdated,
    NewChatSent,
    // 服务端 -> 客户端
    UndeliveredMessagesSent,
    UnreadCountsSent,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::NewMessage,
        EventKind::ReadMessage,
        EventKind::GetUnreadCounts,
        EventKind::MessageSent,
        EventKind::ReadStatusUpdated,
        EventKind::NewChatSent,
        EventKind::UndeliveredMessagesSent,
        EventKind::UnreadCountsSent,
        EventKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::ReadMessage => "read_message",
            EventKind::GetUnreadCounts => "get_unread_counts",
            EventKind::MessageSent => "message_sent",
            EventKind::ReadStatusUpdated => "read_status_updated",
            EventKind::NewChatSent => "new_chat_sent",
            EventKind::UndeliveredMessagesSent => "undelivered_messages_sent",
            EventKind::UnreadCountsSent => "unread_counts_sent",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 未知事件名
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported event '{0}'")]
pub struct UnknownEvent(pub String);

impl FromStr for EventKind {
    type Err = UnknownEvent;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownEvent(value.to_string()))
    }
}

/// 事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    pub fn new<T: Serialize>(kind: EventKind, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: kind.as_str().to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn kind(&self) -> Result<EventKind, UnknownEvent> {
        self.event.parse()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// `new_message`：客户端发送消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreate {
    pub chat_id: ChatId,
    pub content: String,
}

/// `read_message`：客户端推进已读游标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStatusUpdate {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// `get_unread_counts`：缺省 `chat_ids` 表示用户所在的全部聊天
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnreadCountsRequest {
    #[serde(default)]
    pub chat_ids: Option<Vec<ChatId>>,
}

/// `message_sent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSentPayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: Timestamp,
}

impl From<&Message> for MessageSentPayload {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id,
            chat_id: message.chat_id,
            user_id: message.author_id,
            content: message.content.as_str().to_string(),
            sent_at: message.sent_at,
        }
    }
}

/// `read_status_updated`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStatusPayload {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub last_read_message_id: MessageId,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: Timestamp,
}

impl ReadStatusPayload {
    /// 游标尚未前进过时返回 None
    pub fn from_cursor(cursor: &ReadCursor) -> Option<Self> {
        cursor.last_read_message_id.map(|last| Self {
            chat_id: cursor.chat_id,
            user_id: cursor.user_id,
            last_read_message_id: last,
            read_at: cursor.read_at,
        })
    }
}

/// `new_chat_sent`：通过用户频道通知其加入了新聊天，其余字段原样转发
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChatPayload {
    pub chat_id: ChatId,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

/// `undelivered_messages_sent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndeliveredMessagesPayload {
    pub messages: Vec<MessageSentPayload>,
}

/// `unread_counts_sent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCountsPayload {
    pub counts: BTreeMap<ChatId, u64>,
}

/// `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}
