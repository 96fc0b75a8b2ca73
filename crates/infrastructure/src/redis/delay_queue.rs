//! 基于 Redis 的延迟队列
//!
//! - 等待区：sorted set，score 为到期时间（毫秒）
//! - 就绪队列：list，搬运脚本把到期成员原子地从等待区移入
//! - 处理中：每个消费者一个 list，`LMOVE` 取出任务，处理完成后 `LREM` 确认
//!
//! 消费者重启时先把自己处理中 list 里未确认的任务放回就绪队列。
//! 处理失败的任务带延迟回到等待区，超过 `max_attempts` 次后放弃并确认。

use std::sync::Arc;
use std::time::Duration;

use application::{DelayQueue, JobHandler, QueueError, ScheduledJob};
use async_trait::async_trait;
use config::DelayQueueConfig;
use redis::{aio::ConnectionManager, AsyncCommands, Direction, Script};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::redis::{RedisError, RedisResult};

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('RPUSH', KEYS[2], member)
end
return #due
"#;

/// 队列中保存的成员；`job_id` 保证同一任务的两次入队不会在 zset 中合并
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    #[serde(default)]
    pub attempt: u32,
    pub job: ScheduledJob,
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// `attempt` 从 0 开始计数
fn is_last_attempt(attempt: u32, max_attempts: u32) -> bool {
    attempt.saturating_add(1) >= max_attempts
}

fn due_at(delay: Duration) -> i64 {
    now_millis().saturating_add(delay.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(Clone)]
pub struct RedisDelayQueue {
    conn: ConnectionManager,
    settings: DelayQueueConfig,
    promote: Arc<Script>,
}

impl RedisDelayQueue {
    pub fn new(conn: ConnectionManager, settings: DelayQueueConfig) -> Self {
        Self {
            conn,
            settings,
            promote: Arc::new(Script::new(PROMOTE_SCRIPT)),
        }
    }

    pub fn settings(&self) -> &DelayQueueConfig {
        &self.settings
    }

    async fn push_waiting(&self, queued: &QueuedJob, due_ms: i64) -> RedisResult<()> {
        let member = serde_json::to_string(queued)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(&self.settings.wait_key, member, due_ms).await?;
        Ok(())
    }

    /// 把到期的任务搬进就绪队列，返回搬运条数
    pub async fn promote_due(&self, now_ms: i64) -> RedisResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .promote
            .key(&self.settings.wait_key)
            .key(&self.settings.ready_key)
            .arg(now_ms)
            .arg(self.settings.promote_batch)
            .invoke_async(&mut conn)
            .await?;
        if moved > 0 {
            debug!(moved, "到期任务已转入就绪队列");
        }
        Ok(moved)
    }

    /// 把某个消费者处理中但未确认的任务放回就绪队列
    pub async fn recover(&self, consumer_id: &str) -> RedisResult<usize> {
        let processing = self.settings.processing_key(consumer_id);
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn
                .lmove(&processing, &self.settings.ready_key, Direction::Right, Direction::Left)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            warn!(consumer_id, recovered, "找回未确认的任务");
        }
        Ok(recovered)
    }

    /// 从就绪队列取一条任务放入处理中 list
    async fn take(&self, processing: &str) -> RedisResult<Option<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .lmove(&self.settings.ready_key, processing, Direction::Left, Direction::Right)
            .await?;
        Ok(raw)
    }

    async fn ack(&self, processing: &str, raw: &str) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lrem(processing, 1, raw).await?;
        Ok(())
    }

    /// 确认当前这一份并带延迟放回等待区
    async fn requeue(&self, processing: &str, raw: &str, queued: QueuedJob) -> RedisResult<()> {
        let next = QueuedJob {
            attempt: queued.attempt + 1,
            ..queued
        };
        let member = serde_json::to_string(&next)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(processing, 1, raw)
            .ignore()
            .zadd(&self.settings.wait_key, member, due_at(self.settings.retry_delay()))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// 搬运到期任务后处理至多一条，返回是否处理了任务
    pub async fn poll_once(&self, consumer_id: &str, handler: &dyn JobHandler) -> RedisResult<bool> {
        self.promote_due(now_millis()).await?;

        let processing = self.settings.processing_key(consumer_id);
        let Some(raw) = self.take(&processing).await? else {
            return Ok(false);
        };

        let queued = match serde_json::from_str::<QueuedJob>(&raw) {
            Ok(queued) => queued,
            Err(err) => {
                // 格式错误的任务直接确认丢弃
                error!(error = %err, payload = %raw, "丢弃无法解析的延迟任务");
                self.ack(&processing, &raw).await?;
                return Ok(true);
            }
        };

        let scheduled_message_id = queued.job.scheduled_message_id;
        match handler.handle(queued.job.clone()).await {
            Ok(()) => self.ack(&processing, &raw).await?,
            Err(err) if is_last_attempt(queued.attempt, self.settings.max_attempts) => {
                error!(
                    scheduled_message_id = %scheduled_message_id,
                    attempt = queued.attempt,
                    error = %err,
                    "任务重试次数用尽，放弃处理"
                );
                let reason = format!("gave up after {} attempts: {err}", queued.attempt + 1);
                if let Err(abandon_err) = handler.abandon(queued.job, reason).await {
                    warn!(
                        scheduled_message_id = %scheduled_message_id,
                        error = %abandon_err,
                        "无法记录放弃的任务"
                    );
                }
                self.ack(&processing, &raw).await?;
            }
            Err(err) => {
                warn!(
                    scheduled_message_id = %scheduled_message_id,
                    attempt = queued.attempt,
                    error = %err,
                    "任务处理失败，延迟后重新投递"
                );
                self.requeue(&processing, &raw, queued).await?;
            }
        }
        Ok(true)
    }

    /// 消费循环，直到 `shutdown` 变为 true
    pub async fn run(
        &self,
        consumer_id: &str,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RedisResult<()> {
        self.recover(consumer_id).await?;
        info!(consumer_id, "延迟队列消费者已启动");

        while !*shutdown.borrow() {
            let idle = match self.poll_once(consumer_id, handler.as_ref()).await {
                Ok(processed) => !processed,
                Err(err) => {
                    warn!(consumer_id, error = %err, "延迟队列轮询失败");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(consumer_id, "延迟队列消费者已停止");
        Ok(())
    }

    pub async fn waiting_len(&self) -> RedisResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(&self.settings.wait_key).await?)
    }

    pub async fn ready_len(&self) -> RedisResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.settings.ready_key).await?)
    }
}

#[async_trait]
impl DelayQueue for RedisDelayQueue {
    async fn enqueue(&self, job: &ScheduledJob, delay: Duration) -> Result<(), QueueError> {
        let queued = QueuedJob {
            job_id: Uuid::new_v4(),
            attempt: 0,
            job: job.clone(),
        };
        self.push_waiting(&queued, due_at(delay))
            .await
            .map_err(|err| match err {
                RedisError::SerializationError { message } => QueueError::InvalidPayload(message),
                other => QueueError::from(other),
            })?;
        debug!(
            scheduled_message_id = %job.scheduled_message_id,
            job_id = %queued.job_id,
            delay_ms = delay.as_millis() as u64,
            "延迟任务已入队"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ChatId, ScheduledMessageId, UserId};
    use time::macros::datetime;

    #[test]
    fn queued_job_round_trips_with_defaults() {
        let job = ScheduledJob {
            scheduled_message_id: ScheduledMessageId::new(9),
            chat_id: ChatId::new(1),
            author_id: UserId::new(2),
            content: "hi".to_string(),
            scheduled_at: datetime!(2024-05-01 12:00 UTC),
            created_at: datetime!(2024-05-01 11:00 UTC),
        };
        let raw = serde_json::json!({
            "job_id": Uuid::nil(),
            "job": job,
        })
        .to_string();

        let parsed: QueuedJob = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed.attempt, 0);
        assert_eq!(parsed.job, job);
    }

    #[test]
    fn attempts_are_capped() {
        assert!(!is_last_attempt(0, 3));
        assert!(!is_last_attempt(1, 3));
        assert!(is_last_attempt(2, 3));
        assert!(is_last_attempt(0, 1));
        assert!(is_last_attempt(u32::MAX, 10));
    }

    #[test]
    fn due_time_is_in_the_future() {
        let before = now_millis();
        let due = due_at(Duration::from_secs(5));
        assert!(due >= before + 5_000);
    }
}
