use std::sync::Arc;

use domain::{
    chat_channel, ChatId, DomainError, EventEnvelope, EventKind, Message, MessageContent,
    MessageSentPayload, NewMessage, UserId,
};

use crate::{
    broker::{publish_best_effort, ChatBroker},
    clock::Clock,
    error::ApplicationError,
    repository::{ChatDirectory, MessageRepository},
};

pub struct MessageDispatchDependencies {
    pub directory: Arc<dyn ChatDirectory>,
    pub messages: Arc<dyn MessageRepository>,
    pub broker: Arc<dyn ChatBroker>,
    pub clock: Arc<dyn Clock>,
}

/// 消息分发流水线：校验 -> 单事务持久化 -> 提交后推送 `message_sent`
pub struct MessageDispatchService {
    deps: MessageDispatchDependencies,
}

impl MessageDispatchService {
    pub fn new(deps: MessageDispatchDependencies) -> Self {
        Self { deps }
    }

    pub async fn dispatch(
        &self,
        author_id: UserId,
        chat_id: ChatId,
        content: impl Into<String>,
    ) -> Result<Message, ApplicationError> {
        let content = MessageContent::new(content)?;

        let participants = self
            .deps
            .directory
            .participants(chat_id)
            .await?
            .filter(|participants| !participants.is_empty())
            .ok_or_else(|| DomainError::validation_error("chat_id", "chat not found"))?;

        if !participants.contains(&author_id) {
            return Err(DomainError::NotChatParticipant {
                chat_id,
                user_id: author_id,
            }
            .into());
        }

        let draft = NewMessage::new(chat_id, author_id, content, self.deps.clock.now());
        let recipients = draft.recipients(&participants);
        let message = self
            .deps
            .messages
            .create_with_deliveries(draft, &recipients)
            .await?;

        tracing::info!(
            chat_id = %chat_id,
            message_id = %message.id,
            recipients = recipients.len(),
            "消息已提交"
        );

        // 事务已提交，推送失败不回滚
        match EventEnvelope::new(EventKind::MessageSent, &MessageSentPayload::from(&message)) {
            Ok(envelope) => {
                publish_best_effort(self.deps.broker.as_ref(), &chat_channel(chat_id), &envelope)
                    .await
            }
            Err(err) => tracing::warn!(
                message_id = %message.id,
                error = %err,
                "message_sent 事件序列化失败"
            ),
        }

        Ok(message)
    }
}
