//! 内存实现：测试替身和本地开发用的存储、延迟队列与传输层

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    ChatId, DeliveryRecord, EventEnvelope, EventKind, Message, MessageId, NewMessage,
    NewScheduledMessage, ReadCursor, RepositoryError, ScheduledMessage, ScheduledMessageId,
    ScheduledMessageStatus, Timestamp, UserId,
};
use tokio::sync::mpsc;

use crate::{
    error::ApplicationError,
    queue::{DelayQueue, JobHandler, QueueError, ScheduledJob},
    repository::{
        ChatDirectory, DeliveryRepository, MessageRepository, ReadOutcome,
        ScheduledMessageRepository,
    },
    session::{TransportError, TransportSink, TransportSource},
};

#[derive(Default)]
struct StoreState {
    participants: HashMap<ChatId, Vec<UserId>>,
    messages: BTreeMap<MessageId, Message>,
    deliveries: BTreeMap<(MessageId, UserId), DeliveryRecord>,
    cursors: HashMap<(ChatId, UserId), ReadCursor>,
    scheduled: BTreeMap<ScheduledMessageId, ScheduledMessage>,
    next_message_id: i64,
    next_scheduled_id: i64,
    unavailable: bool,
}

impl StoreState {
    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable {
            return Err(RepositoryError::unavailable("memory store is offline"));
        }
        Ok(())
    }
}

/// 一把锁保护全部状态，每个操作天然是原子的
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_participant(&self, chat_id: ChatId, user_id: UserId) {
        let mut state = self.lock();
        let participants = state.participants.entry(chat_id).or_default();
        if !participants.contains(&user_id) {
            participants.push(user_id);
        }
    }

    pub fn remove_participant(&self, chat_id: ChatId, user_id: UserId) {
        if let Some(participants) = self.lock().participants.get_mut(&chat_id) {
            participants.retain(|user| *user != user_id);
        }
    }

    /// 模拟存储不可达
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.values().cloned().collect()
    }

    pub fn deliveries_of(&self, message_id: MessageId) -> Vec<DeliveryRecord> {
        self.lock()
            .deliveries
            .values()
            .filter(|record| record.message_id == message_id)
            .cloned()
            .collect()
    }

    pub fn delivery(&self, message_id: MessageId, user_id: UserId) -> Option<DeliveryRecord> {
        self.lock().deliveries.get(&(message_id, user_id)).cloned()
    }

    pub fn cursor(&self, chat_id: ChatId, user_id: UserId) -> Option<ReadCursor> {
        self.lock().cursors.get(&(chat_id, user_id)).cloned()
    }

    pub fn scheduled(&self, id: ScheduledMessageId) -> Option<ScheduledMessage> {
        self.lock().scheduled.get(&id).cloned()
    }

    pub fn scheduled_count(&self) -> usize {
        self.lock().scheduled.len()
    }

    fn insert_deliveries(
        state: &mut StoreState,
        message_id: MessageId,
        chat_id: ChatId,
        recipients: &[UserId],
    ) -> Result<u64, RepositoryError> {
        if !state.messages.contains_key(&message_id) {
            return Err(RepositoryError::conflict(format!(
                "message {message_id} does not exist"
            )));
        }
        if let Some(duplicate) = recipients
            .iter()
            .find(|user| state.deliveries.contains_key(&(message_id, **user)))
        {
            return Err(RepositoryError::conflict(format!(
                "delivery ({message_id}, {duplicate}) already exists"
            )));
        }
        for recipient in recipients {
            state.deliveries.insert(
                (message_id, *recipient),
                DeliveryRecord::pending(message_id, *recipient, chat_id),
            );
        }
        Ok(recipients.len() as u64)
    }
}

#[async_trait]
impl ChatDirectory for MemoryStore {
    async fn participants(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<Vec<UserId>>, RepositoryError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.participants.get(&chat_id).cloned())
    }

    async fn chats_of(&self, user_id: UserId) -> Result<Vec<ChatId>, RepositoryError> {
        let state = self.lock();
        state.check_available()?;
        let mut chats: Vec<ChatId> = state
            .participants
            .iter()
            .filter(|(_, users)| users.contains(&user_id))
            .map(|(chat_id, _)| *chat_id)
            .collect();
        chats.sort();
        Ok(chats)
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create_with_deliveries(
        &self,
        message: NewMessage,
        recipients: &[UserId],
    ) -> Result<Message, RepositoryError> {
        let mut state = self.lock();
        state.check_available()?;

        state.next_message_id += 1;
        let stored = message.into_message(MessageId::new(state.next_message_id));
        let chat_id = stored.chat_id;
        state.messages.insert(stored.id, stored.clone());
        if let Err(err) = Self::insert_deliveries(&mut state, stored.id, chat_id, recipients) {
            state.messages.remove(&stored.id);
            return Err(err);
        }
        Ok(stored)
    }
}

#[async_trait]
impl DeliveryRepository for MemoryStore {
    async fn create_deliveries(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
        recipients: &[UserId],
    ) -> Result<u64, RepositoryError> {
        let mut state = self.lock();
        state.check_available()?;
        Self::insert_deliveries(&mut state, message_id, chat_id, recipients)
    }

    async fn mark_delivered_for_user(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<Vec<Message>, RepositoryError> {
        let mut state = self.lock();
        state.check_available()?;

        let flipped: Vec<MessageId> = state
            .deliveries
            .values_mut()
            .filter(|record| record.recipient_id == user_id)
            .filter_map(|record| record.mark_delivered(at).then_some(record.message_id))
            .collect();

        Ok(flipped
            .into_iter()
            .filter_map(|id| state.messages.get(&id).cloned())
            .collect())
    }

    async fn mark_delivered(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock();
        state.check_available()?;
        Ok(state
            .deliveries
            .get_mut(&(message_id, user_id))
            .is_some_and(|record| record.mark_delivered(at)))
    }

    async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        upto: MessageId,
        at: Timestamp,
    ) -> Result<ReadOutcome, RepositoryError> {
        let mut state = self.lock();
        state.check_available()?;

        let latest = state
            .messages
            .values()
            .filter(|message| message.chat_id == chat_id)
            .map(|message| message.id)
            .max();
        if latest.is_none_or(|latest| upto > latest) {
            return Ok(ReadOutcome::BeyondLatest { latest });
        }

        let mut cursor = state
            .cursors
            .get(&(chat_id, user_id))
            .cloned()
            .unwrap_or_else(|| ReadCursor::empty(chat_id, user_id, at));
        if cursor.advance(upto, at).is_err() {
            return Ok(ReadOutcome::Stale {
                current: cursor.last_read_message_id,
            });
        }

        let rows = state
            .deliveries
            .values_mut()
            .filter(|record| {
                record.chat_id == chat_id
                    && record.recipient_id == user_id
                    && record.message_id <= upto
            })
            .map(|record| record.mark_read(at))
            .filter(|changed| *changed)
            .count() as u64;

        state.cursors.insert((chat_id, user_id), cursor.clone());
        Ok(ReadOutcome::Advanced { cursor, rows })
    }

    async fn unread_counts(
        &self,
        user_id: UserId,
        chat_ids: &[ChatId],
    ) -> Result<HashMap<ChatId, u64>, RepositoryError> {
        let state = self.lock();
        state.check_available()?;

        let mut counts = HashMap::new();
        for record in state.deliveries.values() {
            if record.recipient_id == user_id && !record.is_read && chat_ids.contains(&record.chat_id)
            {
                *counts.entry(record.chat_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ScheduledMessageRepository for MemoryStore {
    async fn create(
        &self,
        message: NewScheduledMessage,
    ) -> Result<ScheduledMessage, RepositoryError> {
        let mut state = self.lock();
        state.check_available()?;
        state.next_scheduled_id += 1;
        let stored = message.into_scheduled(ScheduledMessageId::new(state.next_scheduled_id));
        state.scheduled.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find(
        &self,
        id: ScheduledMessageId,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.scheduled.get(&id).cloned())
    }

    async fn list_active(
        &self,
        chat_id: ChatId,
        author_id: UserId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let state = self.lock();
        state.check_available()?;
        Ok(state
            .scheduled
            .values()
            .filter(|message| {
                message.chat_id == chat_id
                    && message.author_id == author_id
                    && message.status != ScheduledMessageStatus::Canceled
            })
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: ScheduledMessageId,
        from: &[ScheduledMessageStatus],
        to: ScheduledMessageStatus,
        error_message: Option<String>,
        at: Timestamp,
    ) -> Result<Option<ScheduledMessage>, RepositoryError> {
        let mut state = self.lock();
        state.check_available()?;
        let Some(message) = state.scheduled.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&message.status) {
            return Ok(None);
        }
        message
            .transition(to, error_message, at)
            .map_err(|err| RepositoryError::conflict(err.to_string()))?;
        Ok(Some(message.clone()))
    }
}

/// 只记录任务的延迟队列
#[derive(Default)]
pub struct MemoryDelayQueue {
    jobs: Mutex<Vec<(ScheduledJob, Duration)>>,
    failure: Mutex<Option<QueueError>>,
}

impl MemoryDelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的每次入队都返回该错误；传 `None` 恢复正常
    pub fn fail_with(&self, error: Option<QueueError>) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    pub fn jobs(&self) -> Vec<(ScheduledJob, Duration)> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// 取出全部任务交给处理器，模拟到期投递；返回处理失败（需重投）的任务
    pub async fn fire_all(&self, handler: &dyn JobHandler) -> Vec<(ScheduledJob, ApplicationError)> {
        let due: Vec<ScheduledJob> = self
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .map(|(job, _)| job)
            .collect();

        let mut failed = Vec::new();
        for job in due {
            if let Err(err) = handler.handle(job.clone()).await {
                failed.push((job, err));
            }
        }
        failed
    }
}

#[async_trait]
impl DelayQueue for MemoryDelayQueue {
    async fn enqueue(&self, job: &ScheduledJob, delay: Duration) -> Result<(), QueueError> {
        if let Some(error) = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(error);
        }
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((job.clone(), delay));
        Ok(())
    }
}

/// 内存传输：会话一端的出站/入站，加上模拟客户端的一端
pub fn transport_pair() -> (MemorySink, MemorySource, MemoryClient) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    (
        MemorySink { frames: frames_tx },
        MemorySource {
            incoming: incoming_rx,
        },
        MemoryClient {
            outgoing: Some(incoming_tx),
            frames: frames_rx,
        },
    )
}

pub struct MemorySink {
    frames: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }
}

pub struct MemorySource {
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl TransportSource for MemorySource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.incoming.recv().await)
    }
}

pub struct MemoryClient {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    frames: mpsc::UnboundedReceiver<String>,
}

impl MemoryClient {
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(frame.into()).is_ok())
    }

    pub fn send<T: serde::Serialize>(&self, kind: EventKind, payload: &T) -> bool {
        match EventEnvelope::new(kind, payload).and_then(|envelope| envelope.to_json()) {
            Ok(frame) => self.send_raw(frame),
            Err(_) => false,
        }
    }

    /// 会话写出的下一帧，会话结束后返回 `None`
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        let frame = self.frames.recv().await?;
        EventEnvelope::from_json(&frame).ok()
    }

    /// 客户端主动断开
    pub fn disconnect(&mut self) {
        self.outgoing.take();
    }
}
