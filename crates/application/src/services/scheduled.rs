//! 定时消息用例与延迟任务处理
//!
//! 状态机的每一次迁移都是一条条件更新，`cancel` 与任务认领并发时
//! 恰好只有一方成功。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    ChatId, DomainError, MessageContent, NewScheduledMessage, ScheduledMessage,
    ScheduledMessageId, ScheduledMessageStatus, Timestamp, UserId,
};

use crate::{
    clock::Clock,
    error::ApplicationError,
    queue::{delay_until, DelayQueue, JobHandler, ScheduledJob},
    repository::{ChatDirectory, ScheduledMessageRepository},
    services::dispatch::MessageDispatchService,
};

use ScheduledMessageStatus::{Canceled, Failed, Pending, Processing, Sent};

pub struct ScheduledMessageServiceDependencies {
    pub directory: Arc<dyn ChatDirectory>,
    pub scheduled: Arc<dyn ScheduledMessageRepository>,
    pub queue: Arc<dyn DelayQueue>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub chat_id: ChatId,
    pub author_id: UserId,
    pub content: String,
    pub send_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct UpdateScheduledRequest {
    pub scheduled_message_id: ScheduledMessageId,
    pub chat_id: ChatId,
    pub requester_id: UserId,
    pub content: String,
    pub send_at: Timestamp,
}

/// 定时消息的创建、修改、取消与查询入口
///
/// 不直接对客户端暴露，由外部的路由层（HTTP 等）在完成身份认证后调用。
pub struct ScheduledMessageService {
    deps: ScheduledMessageServiceDependencies,
}

impl ScheduledMessageService {
    pub fn new(deps: ScheduledMessageServiceDependencies) -> Self {
        Self { deps }
    }

    /// 写入 Pending 记录并投递延迟任务
    ///
    /// 发送时间不晚于当前时间时直接拒绝，不写库也不入队。
    pub async fn schedule(
        &self,
        request: ScheduleRequest,
    ) -> Result<ScheduledMessage, ApplicationError> {
        let now = self.deps.clock.now();
        let content = MessageContent::new(request.content)?;
        let draft = NewScheduledMessage::new(
            request.chat_id,
            request.author_id,
            content,
            request.send_at,
            now,
        )?;
        self.ensure_participant(request.chat_id, request.author_id)
            .await?;

        let scheduled = self.deps.scheduled.create(draft).await?;
        let job = ScheduledJob::from(&scheduled);
        let delay = delay_until(scheduled.scheduled_send_at, now);

        if let Err(queue_error) = self.deps.queue.enqueue(&job, delay).await {
            tracing::error!(
                scheduled_message_id = %scheduled.id,
                error = %queue_error,
                "延迟任务入队失败"
            );
            // 没有任务的 Pending 记录永远不会被处理
            if let Err(err) = self
                .deps
                .scheduled
                .transition(
                    scheduled.id,
                    &[Pending],
                    Failed,
                    Some(queue_error.to_string()),
                    self.deps.clock.now(),
                )
                .await
            {
                tracing::error!(
                    scheduled_message_id = %scheduled.id,
                    error = %err,
                    "入队失败后无法标记 FAILED"
                );
            }
            return Err(queue_error.into());
        }

        tracing::info!(
            scheduled_message_id = %scheduled.id,
            chat_id = %scheduled.chat_id,
            delay_ms = delay.as_millis() as u64,
            "定时消息已排期"
        );
        Ok(scheduled)
    }

    /// 只有作者本人可以取消，且只能从 Pending 取消
    pub async fn cancel(
        &self,
        scheduled_message_id: ScheduledMessageId,
        chat_id: ChatId,
        requester_id: UserId,
    ) -> Result<ScheduledMessage, ApplicationError> {
        self.ensure_participant(chat_id, requester_id).await?;

        let existing = self
            .deps
            .scheduled
            .find(scheduled_message_id)
            .await?
            .filter(|message| message.chat_id == chat_id)
            .ok_or_else(|| {
                DomainError::resource_not_found(
                    "scheduled_message",
                    scheduled_message_id.to_string(),
                )
            })?;

        if existing.author_id != requester_id {
            return Err(DomainError::permission_denied("cancel scheduled message").into());
        }
        if existing.status != Pending {
            return Err(DomainError::IllegalTransition {
                from: existing.status,
                to: Canceled,
            }
            .into());
        }

        let canceled = self
            .deps
            .scheduled
            .transition(
                scheduled_message_id,
                &[Pending],
                Canceled,
                None,
                self.deps.clock.now(),
            )
            .await?;

        match canceled {
            Some(message) => {
                tracing::info!(scheduled_message_id = %message.id, "定时消息已取消");
                Ok(message)
            }
            // 在读取与更新之间被任务认领了
            None => {
                let current = self
                    .deps
                    .scheduled
                    .find(scheduled_message_id)
                    .await?
                    .map(|message| message.status)
                    .unwrap_or(Processing);
                Err(DomainError::IllegalTransition {
                    from: current,
                    to: Canceled,
                }
                .into())
            }
        }
    }

    /// 先取消再重新排期，返回 (已取消的旧记录, 新记录)
    ///
    /// 新内容和新时间在取消之前校验；若取消成功而重新排期失败，
    /// 旧记录保持 CANCELED，不会自动恢复。
    pub async fn update(
        &self,
        request: UpdateScheduledRequest,
    ) -> Result<(ScheduledMessage, ScheduledMessage), ApplicationError> {
        let now = self.deps.clock.now();
        let content = MessageContent::new(request.content.clone())?;
        NewScheduledMessage::new(
            request.chat_id,
            request.requester_id,
            content,
            request.send_at,
            now,
        )?;

        let canceled = self
            .cancel(
                request.scheduled_message_id,
                request.chat_id,
                request.requester_id,
            )
            .await?;

        let rescheduled = self
            .schedule(ScheduleRequest {
                chat_id: request.chat_id,
                author_id: request.requester_id,
                content: request.content,
                send_at: request.send_at,
            })
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    scheduled_message_id = %canceled.id,
                    error = %err,
                    "重新排期失败，原定时消息保持取消状态"
                );
            })?;

        Ok((canceled, rescheduled))
    }

    /// 请求者在某个聊天中未取消的定时消息
    pub async fn list(
        &self,
        chat_id: ChatId,
        requester_id: UserId,
    ) -> Result<Vec<ScheduledMessage>, ApplicationError> {
        self.ensure_participant(chat_id, requester_id).await?;
        Ok(self
            .deps
            .scheduled
            .list_active(chat_id, requester_id)
            .await?)
    }

    async fn ensure_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        if self.deps.directory.is_participant(chat_id, user_id).await? {
            Ok(())
        } else {
            Err(DomainError::NotChatParticipant { chat_id, user_id }.into())
        }
    }
}

pub struct ScheduledMessageWorkerDependencies {
    pub scheduled: Arc<dyn ScheduledMessageRepository>,
    pub dispatch: Arc<MessageDispatchService>,
    pub clock: Arc<dyn Clock>,
}

/// 到期任务的处理器，对重复投递幂等
pub struct ScheduledMessageWorker {
    deps: ScheduledMessageWorkerDependencies,
}

impl ScheduledMessageWorker {
    pub fn new(deps: ScheduledMessageWorkerDependencies) -> Self {
        Self { deps }
    }

    async fn finish(
        &self,
        id: ScheduledMessageId,
        to: ScheduledMessageStatus,
        error_message: Option<String>,
    ) {
        match self
            .deps
            .scheduled
            .transition(id, &[Processing], to, error_message, self.deps.clock.now())
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(scheduled_message_id = %id, status = %to, "状态已被其他处理者修改"),
            Err(err) => tracing::error!(
                scheduled_message_id = %id,
                status = %to,
                error = %err,
                "CRITICAL: 无法写入定时消息的最终状态"
            ),
        }
    }
}

#[async_trait]
impl JobHandler for ScheduledMessageWorker {
    async fn handle(&self, job: ScheduledJob) -> Result<(), ApplicationError> {
        let id = job.scheduled_message_id;

        // 读取失败交给队列重新投递
        let Some(current) = self.deps.scheduled.find(id).await? else {
            tracing::warn!(scheduled_message_id = %id, "定时消息不存在，跳过");
            return Ok(());
        };

        match current.status {
            Canceled | Sent | Failed => {
                tracing::debug!(scheduled_message_id = %id, status = %current.status, "已是终态，跳过");
                return Ok(());
            }
            Processing => {
                // 上一次处理中断，无法判断是否已经发出，不再重复发送
                tracing::warn!(scheduled_message_id = %id, "检测到中断的处理，标记为失败");
                self.finish(id, Failed, Some("processing interrupted".to_string()))
                    .await;
                return Ok(());
            }
            Pending => {}
        }

        let claimed = self
            .deps
            .scheduled
            .transition(id, &[Pending], Processing, None, self.deps.clock.now())
            .await?;
        let Some(claimed) = claimed else {
            tracing::debug!(scheduled_message_id = %id, "认领失败，已被取消或被其他处理者认领");
            return Ok(());
        };

        match self
            .deps
            .dispatch
            .dispatch(claimed.author_id, claimed.chat_id, claimed.content.as_str())
            .await
        {
            Ok(message) => {
                tracing::info!(
                    scheduled_message_id = %id,
                    message_id = %message.id,
                    "定时消息已发送"
                );
                self.finish(id, Sent, None).await;
            }
            Err(err) => {
                tracing::warn!(scheduled_message_id = %id, error = %err, "定时消息发送失败");
                self.finish(id, Failed, Some(err.to_string())).await;
            }
        }
        Ok(())
    }

    /// 尽力把仍未结束的定时消息标记为失败
    async fn abandon(&self, job: ScheduledJob, reason: String) -> Result<(), ApplicationError> {
        let id = job.scheduled_message_id;
        let failed = self
            .deps
            .scheduled
            .transition(
                id,
                &[Pending, Processing],
                Failed,
                Some(reason),
                self.deps.clock.now(),
            )
            .await?;
        match failed {
            Some(_) => tracing::warn!(scheduled_message_id = %id, "重试次数用尽，标记为失败"),
            None => tracing::debug!(scheduled_message_id = %id, "重试次数用尽，已是终态"),
        }
        Ok(())
    }
}
