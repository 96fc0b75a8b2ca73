use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

/// 消息投递状态追踪
/// 对应数据库表：message_deliveries
///
/// 每条消息对每个非作者参与者恰有一行，与消息在同一事务中创建。
/// 已读必然已送达。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub chat_id: ChatId,
    pub is_delivered: bool,
    pub is_read: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<Timestamp>,
}

impl DeliveryRecord {
    /// 创建新的投递记录（未送达、未读）
    pub fn pending(message_id: MessageId, recipient_id: UserId, chat_id: ChatId) -> Self {
        Self {
            message_id,
            recipient_id,
            chat_id,
            is_delivered: false,
            is_read: false,
            delivered_at: None,
            read_at: None,
        }
    }

    /// 标记已送达，返回本次调用是否真正改变了状态
    pub fn mark_delivered(&mut self, at: Timestamp) -> bool {
        if self.is_delivered {
            return false;
        }
        self.is_delivered = true;
        self.delivered_at = Some(at);
        true
    }

    /// 标记已读，同时保证已送达
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        if self.is_read {
            return false;
        }
        self.mark_delivered(at);
        self.is_read = true;
        self.read_at = Some(at);
        true
    }
}
