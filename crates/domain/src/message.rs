use std::collections::BTreeSet;

use crate::value_objects::{ChatId, MessageContent, MessageId, Timestamp, UserId};

/// 已提交的聊天消息，创建后不可变。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub content: MessageContent,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: Timestamp,
}

/// 尚未持久化的消息草稿，id 由存储分配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub content: MessageContent,
    pub sent_at: Timestamp,
}

impl NewMessage {
    pub fn new(
        chat_id: ChatId,
        author_id: UserId,
        content: MessageContent,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            chat_id,
            author_id,
            content,
            sent_at,
        }
    }

    /// 接收者 = 参与者去重后排除作者本人
    pub fn recipients(&self, participants: &[UserId]) -> Vec<UserId> {
        participants
            .iter()
            .copied()
            .filter(|user| *user != self.author_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            chat_id: self.chat_id,
            author_id: self.author_id,
            content: self.content,
            sent_at: self.sent_at,
        }
    }
}
