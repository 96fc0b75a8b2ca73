use std::collections::HashMap;

use async_trait::async_trait;
use domain::{
    ChatId, Message, MessageId, NewMessage, NewScheduledMessage, ReadCursor, RepositoryError,
    ScheduledMessage, ScheduledMessageId, ScheduledMessageStatus, Timestamp, UserId,
};

/// 聊天成员关系（由外部聊天管理服务维护）
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// 聊天不存在时返回 `None`
    async fn participants(&self, chat_id: ChatId)
        -> Result<Option<Vec<UserId>>, RepositoryError>;

    /// 用户当前所在的全部聊天
    async fn chats_of(&self, user_id: UserId) -> Result<Vec<ChatId>, RepositoryError>;

    async fn is_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .participants(chat_id)
            .await?
            .is_some_and(|participants| participants.contains(&user_id)))
    }
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    // 在同一个事务中写入消息和每个接收者的投递记录，失败时两者都不落库
    async fn create_with_deliveries(
        &self,
        message: NewMessage,
        recipients: &[UserId],
    ) -> Result<Message, RepositoryError>;
}

/// `mark_read` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 游标已前进，`rows` 为本次翻转为已读的投递记录数
    Advanced { cursor: ReadCursor, rows: u64 },
    /// 请求的位置不大于当前游标，未做任何修改
    Stale { current: Option<MessageId> },
    /// 请求的位置超过聊天中最新的消息，未做任何修改
    BeyondLatest { latest: Option<MessageId> },
}

#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    /// 批量插入投递记录，全部成功或全部失败
    async fn create_deliveries(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
        recipients: &[UserId],
    ) -> Result<u64, RepositoryError>;

    /// 单条条件更新：把用户所有未送达的记录置为已送达，返回对应消息（按 id 升序）
    async fn mark_delivered_for_user(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// 单条记录的条件更新，返回是否真正发生了变化
    async fn mark_delivered(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError>;

    /// 在一个事务中持有游标行锁，翻转 `<= upto` 的未读记录并推进游标；
    /// `upto` 必须是聊天中已存在的位置
    async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        upto: MessageId,
        at: Timestamp,
    ) -> Result<ReadOutcome, RepositoryError>;

    /// 只返回存在未读记录的聊天
    async fn unread_counts(
        &self,
        user_id: UserId,
        chat_ids: &[ChatId],
    ) -> Result<HashMap<ChatId, u64>, RepositoryError>;
}

#[async_trait]
pub trait ScheduledMessageRepository: Send + Sync {
    async fn create(&self, message: NewScheduledMessage)
        -> Result<ScheduledMessage, RepositoryError>;

    async fn find(
        &self,
        id: ScheduledMessageId,
    ) -> Result<Option<ScheduledMessage>, RepositoryError>;

    /// 作者在某个聊天中未取消的定时消息
    async fn list_active(
        &self,
        chat_id: ChatId,
        author_id: UserId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;

    /// 条件状态迁移：只有当前状态属于 `from` 时才更新，否则返回 `None`
    async fn transition(
        &self,
        id: ScheduledMessageId,
        from: &[ScheduledMessageStatus],
        to: ScheduledMessageStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> Result<Option<ScheduledMessage>, RepositoryError>;
}
