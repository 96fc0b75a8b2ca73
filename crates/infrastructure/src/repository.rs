//! PostgreSQL 存储：成员关系、消息、投递状态、已读游标与定时消息

use std::collections::HashMap;
use std::time::Duration;

use application::{
    ChatDirectory, DeliveryRepository, MessageRepository, ReadOutcome,
    ScheduledMessageRepository,
};
use async_trait::async_trait;
use domain::{
    ChatId, Message, MessageContent, MessageId, NewMessage, NewScheduledMessage, ReadCursor,
    RepositoryError, ScheduledMessage, ScheduledMessageId, ScheduledMessageStatus, Timestamp,
    UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db)
            if db.is_unique_violation() || db.is_foreign_key_violation() =>
        {
            RepositoryError::conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::unavailable(err.to_string())
        }
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn ids<T: Copy + Into<i64>>(values: &[T]) -> Vec<i64> {
    values.iter().map(|value| (*value).into()).collect()
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    chat_id: i64,
    author_id: i64,
    content: String,
    sent_at: Timestamp,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Message {
            id: MessageId::new(value.id),
            chat_id: ChatId::new(value.chat_id),
            author_id: UserId::new(value.author_id),
            content,
            sent_at: value.sent_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CursorRecord {
    chat_id: i64,
    user_id: i64,
    last_read_message_id: Option<i64>,
    read_at: Timestamp,
}

impl From<CursorRecord> for ReadCursor {
    fn from(value: CursorRecord) -> Self {
        ReadCursor {
            chat_id: ChatId::new(value.chat_id),
            user_id: UserId::new(value.user_id),
            last_read_message_id: value.last_read_message_id.map(MessageId::new),
            read_at: value.read_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ScheduledRecord {
    id: i64,
    chat_id: i64,
    author_id: i64,
    content: String,
    scheduled_send_at: Timestamp,
    status: String,
    error_message: Option<String>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl TryFrom<ScheduledRecord> for ScheduledMessage {
    type Error = RepositoryError;

    fn try_from(value: ScheduledRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        let status = value
            .status
            .parse::<ScheduledMessageStatus>()
            .map_err(|err| invalid_data(err.to_string()))?;
        Ok(ScheduledMessage {
            id: ScheduledMessageId::new(value.id),
            chat_id: ChatId::new(value.chat_id),
            author_id: UserId::new(value.author_id),
            content,
            scheduled_send_at: value.scheduled_send_at,
            status,
            error_message: value.error_message,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

const SCHEDULED_COLUMNS: &str = "id, chat_id, author_id, content, scheduled_send_at, status, \
                                 error_message, created_at, updated_at";

/// 实现全部仓储接口的 PostgreSQL 存储
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_deliveries(
        tx: &mut Transaction<'_, Postgres>,
        message_id: MessageId,
        chat_id: ChatId,
        recipients: &[UserId],
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_deliveries (message_id, recipient_id, chat_id)
            SELECT $1, recipient, $3 FROM UNNEST($2::BIGINT[]) AS recipient
            "#,
        )
        .bind(message_id.value())
        .bind(ids(recipients))
        .bind(chat_id.value())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ChatDirectory for PgStore {
    async fn participants(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<Vec<UserId>>, RepositoryError> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM chat_participants WHERE chat_id = $1 ORDER BY user_id",
        )
        .bind(chat_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.into_iter().map(UserId::new).collect()))
    }

    async fn chats_of(&self, user_id: UserId) -> Result<Vec<ChatId>, RepositoryError> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT chat_id FROM chat_participants WHERE user_id = $1 ORDER BY chat_id",
        )
        .bind(user_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.into_iter().map(ChatId::new).collect())
    }

    async fn is_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM chat_participants WHERE chat_id = $1 AND user_id = $2)",
        )
        .bind(chat_id.value())
        .bind(user_id.value())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

#[async_trait]
impl MessageRepository for PgStore {
    async fn create_with_deliveries(
        &self,
        message: NewMessage,
        recipients: &[UserId],
    ) -> Result<Message, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (chat_id, author_id, content, sent_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, chat_id, author_id, content, sent_at
            "#,
        )
        .bind(message.chat_id.value())
        .bind(message.author_id.value())
        .bind(message.content.as_str())
        .bind(message.sent_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let stored = Message::try_from(record)?;

        if !recipients.is_empty() {
            Self::insert_deliveries(&mut tx, stored.id, stored.chat_id, recipients).await?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(stored)
    }
}

#[async_trait]
impl DeliveryRepository for PgStore {
    async fn create_deliveries(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
        recipients: &[UserId],
    ) -> Result<u64, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let created = Self::insert_deliveries(&mut tx, message_id, chat_id, recipients).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(created)
    }

    async fn mark_delivered_for_user(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            WITH flipped AS (
                UPDATE message_deliveries
                SET is_delivered = TRUE, delivered_at = $2
                WHERE recipient_id = $1 AND is_delivered = FALSE
                RETURNING message_id
            )
            SELECT m.id, m.chat_id, m.author_id, m.content, m.sent_at
            FROM messages m
            JOIN flipped f ON f.message_id = m.id
            ORDER BY m.id ASC
            "#,
        )
        .bind(user_id.value())
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn mark_delivered(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE message_deliveries
            SET is_delivered = TRUE, delivered_at = $3
            WHERE message_id = $1 AND recipient_id = $2 AND is_delivered = FALSE
            "#,
        )
        .bind(message_id.value())
        .bind(user_id.value())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        upto: MessageId,
        at: Timestamp,
    ) -> Result<ReadOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 首次已读时游标行不存在，先补一行再加锁
        sqlx::query(
            r#"
            INSERT INTO chat_read_status (chat_id, user_id, last_read_message_id, read_at)
            VALUES ($1, $2, NULL, $3)
            ON CONFLICT (chat_id, user_id) DO NOTHING
            "#,
        )
        .bind(chat_id.value())
        .bind(user_id.value())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let record = sqlx::query_as::<_, CursorRecord>(
            r#"
            SELECT chat_id, user_id, last_read_message_id, read_at
            FROM chat_read_status
            WHERE chat_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
        )
        .bind(chat_id.value())
        .bind(user_id.value())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM messages WHERE chat_id = $1")
                .bind(chat_id.value())
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
        let latest = latest.map(MessageId::new);
        if latest.is_none_or(|latest| upto > latest) {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Ok(ReadOutcome::BeyondLatest { latest });
        }

        let mut cursor = ReadCursor::from(record);
        if cursor.advance(upto, at).is_err() {
            tx.rollback().await.map_err(map_sqlx_err)?;
            return Ok(ReadOutcome::Stale {
                current: cursor.last_read_message_id,
            });
        }

        let rows = sqlx::query(
            r#"
            UPDATE message_deliveries
            SET is_read = TRUE,
                read_at = $4,
                is_delivered = TRUE,
                delivered_at = COALESCE(delivered_at, $4)
            WHERE chat_id = $1 AND recipient_id = $2 AND message_id <= $3 AND is_read = FALSE
            "#,
        )
        .bind(chat_id.value())
        .bind(user_id.value())
        .bind(upto.value())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE chat_read_status
            SET last_read_message_id = $3, read_at = $4
            WHERE chat_id = $1 AND user_id = $2
            "#,
        )
        .bind(chat_id.value())
        .bind(user_id.value())
        .bind(upto.value())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(ReadOutcome::Advanced { cursor, rows })
    }

    async fn unread_counts(
        &self,
        user_id: UserId,
        chat_ids: &[ChatId],
    ) -> Result<HashMap<ChatId, u64>, RepositoryError> {
        if chat_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT chat_id, COUNT(*)
            FROM message_deliveries
            WHERE recipient_id = $1 AND is_read = FALSE AND chat_id = ANY($2)
            GROUP BY chat_id
            "#,
        )
        .bind(user_id.value())
        .bind(ids(chat_ids))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|(chat_id, count)| (ChatId::new(chat_id), count.max(0) as u64))
            .collect())
    }
}

#[async_trait]
impl ScheduledMessageRepository for PgStore {
    async fn create(
        &self,
        message: NewScheduledMessage,
    ) -> Result<ScheduledMessage, RepositoryError> {
        let record = sqlx::query_as::<_, ScheduledRecord>(&format!(
            r#"
            INSERT INTO scheduled_messages
                (chat_id, author_id, content, scheduled_send_at, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING {SCHEDULED_COLUMNS}
            "#
        ))
        .bind(message.chat_id.value())
        .bind(message.author_id.value())
        .bind(message.content.as_str())
        .bind(message.scheduled_send_at)
        .bind(ScheduledMessageStatus::Pending.as_str())
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        ScheduledMessage::try_from(record)
    }

    async fn find(
        &self,
        id: ScheduledMessageId,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let record = sqlx::query_as::<_, ScheduledRecord>(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE id = $1"
        ))
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(ScheduledMessage::try_from).transpose()
    }

    async fn list_active(
        &self,
        chat_id: ChatId,
        author_id: UserId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let records = sqlx::query_as::<_, ScheduledRecord>(&format!(
            r#"
            SELECT {SCHEDULED_COLUMNS}
            FROM scheduled_messages
            WHERE chat_id = $1 AND author_id = $2 AND status <> $3
            ORDER BY scheduled_send_at ASC, id ASC
            "#
        ))
        .bind(chat_id.value())
        .bind(author_id.value())
        .bind(ScheduledMessageStatus::Canceled.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(ScheduledMessage::try_from).collect()
    }

    async fn transition(
        &self,
        id: ScheduledMessageId,
        from: &[ScheduledMessageStatus],
        to: ScheduledMessageStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        if let Some(illegal) = from.iter().find(|status| !status.can_transition_to(to)) {
            return Err(RepositoryError::conflict(format!(
                "illegal transition {illegal} -> {to}"
            )));
        }
        let from: Vec<&str> = from.iter().map(|status| status.as_str()).collect();

        let record = sqlx::query_as::<_, ScheduledRecord>(&format!(
            r#"
            UPDATE scheduled_messages
            SET status = $3, error_message = $4, updated_at = $5
            WHERE id = $1 AND status = ANY($2)
            RETURNING {SCHEDULED_COLUMNS}
            "#
        ))
        .bind(id.value())
        .bind(from)
        .bind(to.as_str())
        .bind(error_message)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(ScheduledMessage::try_from).transpose()
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}
