use std::collections::BTreeMap;
use std::sync::Arc;

use domain::{ChatId, DomainError, Message, MessageId, ReadStatusPayload, RepositoryError, UserId};

use crate::{
    clock::Clock,
    error::ApplicationError,
    repository::{ChatDirectory, DeliveryRepository, ReadOutcome},
};

pub struct DeliveryServiceDependencies {
    pub directory: Arc<dyn ChatDirectory>,
    pub deliveries: Arc<dyn DeliveryRepository>,
    pub clock: Arc<dyn Clock>,
}

/// 投递服务：维护每个接收者的送达/已读状态、已读游标和未读计数
pub struct DeliveryService {
    deps: DeliveryServiceDependencies,
}

impl DeliveryService {
    pub fn new(deps: DeliveryServiceDependencies) -> Self {
        Self { deps }
    }

    /// 批量创建投递记录，全部成功或全部失败
    pub async fn create_deliveries(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
        recipients: &[UserId],
    ) -> Result<u64, ApplicationError> {
        if recipients.is_empty() {
            return Ok(0);
        }
        let created = self
            .deps
            .deliveries
            .create_deliveries(message_id, chat_id, recipients)
            .await?;
        Ok(created)
    }

    /// 重连补发：把所有未送达的记录置为已送达，并返回这些消息
    ///
    /// 单条条件更新完成，紧接着的第二次调用返回空列表。
    pub async fn mark_delivered_on_reconnect(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Message>, ApplicationError> {
        let now = self.deps.clock.now();
        let messages = self
            .deps
            .deliveries
            .mark_delivered_for_user(user_id, now)
            .await?;

        if !messages.is_empty() {
            tracing::debug!(user_id = %user_id, count = messages.len(), "重连补发未送达消息");
        }
        Ok(messages)
    }

    /// 实时推送写出之后确认单条记录已送达
    pub async fn acknowledge_live_delivery(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<bool, ApplicationError> {
        let now = self.deps.clock.now();
        Ok(self
            .deps
            .deliveries
            .mark_delivered(message_id, user_id, now)
            .await?)
    }

    /// 推进已读游标；`upto` 不大于当前游标时返回冲突错误，
    /// 超过聊天最新消息时返回校验错误
    pub async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        upto: MessageId,
    ) -> Result<ReadStatusPayload, ApplicationError> {
        if !self.deps.directory.is_participant(chat_id, user_id).await? {
            return Err(DomainError::NotChatParticipant { chat_id, user_id }.into());
        }

        let now = self.deps.clock.now();
        match self
            .deps
            .deliveries
            .mark_read(chat_id, user_id, upto, now)
            .await?
        {
            ReadOutcome::Advanced { cursor, rows } => {
                tracing::debug!(
                    chat_id = %chat_id,
                    user_id = %user_id,
                    upto = %upto,
                    rows,
                    "已读游标前进"
                );
                ReadStatusPayload::from_cursor(&cursor).ok_or_else(|| {
                    ApplicationError::Repository(RepositoryError::storage(
                        "read cursor advanced without a message id",
                    ))
                })
            }
            ReadOutcome::Stale { current } => Err(DomainError::CursorRegression {
                current,
                requested: upto,
            }
            .into()),
            ReadOutcome::BeyondLatest { latest } => {
                tracing::debug!(
                    chat_id = %chat_id,
                    user_id = %user_id,
                    upto = %upto,
                    latest = ?latest,
                    "已读位置超过最新消息"
                );
                Err(DomainError::validation_error(
                    "message_id",
                    format!("message {upto} does not exist in chat {chat_id}"),
                )
                .into())
            }
        }
    }

    /// 每个请求的聊天都有一项，没有未读时为 0
    pub async fn unread_counts(
        &self,
        user_id: UserId,
        chat_ids: &[ChatId],
    ) -> Result<BTreeMap<ChatId, u64>, ApplicationError> {
        let found = self
            .deps
            .deliveries
            .unread_counts(user_id, chat_ids)
            .await?;

        Ok(chat_ids
            .iter()
            .map(|chat_id| (*chat_id, found.get(chat_id).copied().unwrap_or(0)))
            .collect())
    }
}
