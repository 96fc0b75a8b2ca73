use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

/// 每个 (chat, user) 的已读游标，只能单调前进。
/// 对应数据库表：chat_read_status
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReadCursor {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub last_read_message_id: Option<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: Timestamp,
}

impl ReadCursor {
    /// 尚未读过任何消息的游标
    pub fn empty(chat_id: ChatId, user_id: UserId, at: Timestamp) -> Self {
        Self {
            chat_id,
            user_id,
            last_read_message_id: None,
            read_at: at,
        }
    }

    /// `upto` 必须严格大于当前游标
    pub fn ensure_can_advance(&self, upto: MessageId) -> Result<(), DomainError> {
        match self.last_read_message_id {
            Some(current) if upto <= current => Err(DomainError::CursorRegression {
                current: Some(current),
                requested: upto,
            }),
            _ => Ok(()),
        }
    }

    pub fn advance(&mut self, upto: MessageId, at: Timestamp) -> Result<(), DomainError> {
        self.ensure_can_advance(upto)?;
        self.last_read_message_id = Some(upto);
        self.read_at = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn cursor_only_moves_forward() {
        let now = OffsetDateTime::now_utc();
        let mut cursor = ReadCursor::empty(ChatId::new(1), UserId::new(2), now);

        cursor.advance(MessageId::new(5), now).unwrap();
        assert_eq!(cursor.last_read_message_id, Some(MessageId::new(5)));

        let err = cursor.advance(MessageId::new(5), now).unwrap_err();
        assert!(matches!(err, DomainError::CursorRegression { .. }));
        assert!(cursor.advance(MessageId::new(3), now).is_err());

        cursor.advance(MessageId::new(9), now).unwrap();
        assert_eq!(cursor.last_read_message_id, Some(MessageId::new(9)));
    }
}
