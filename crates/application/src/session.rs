//! 连接与订阅层
//!
//! 每个在线用户一个会话：
//! - 每个订阅频道一个监听任务，全部写入同一个有界收件箱；
//! - 一个读取任务把客户端帧写入收件箱；
//! - 单一的会话循环消费收件箱，是唯一向传输层写数据的地方。
//!
//! 无论会话以何种方式结束，所有监听任务都会被中止、broker 订阅随之释放。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    chat_channel, user_channel, ChatId, ErrorPayload, EventEnvelope, EventKind, MessageId,
    MessageSentPayload, UndeliveredMessagesPayload, UnreadCountsPayload, UserId,
};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    broker::{BrokerError, BrokerStream, ChatBroker},
    delivery::DeliveryService,
    dispatcher::EventRegistry,
    error::ApplicationError,
    handlers,
    repository::ChatDirectory,
    services::MessageDispatchService,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// 会话的出站方向
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// 会话的入站方向，`Ok(None)` 表示客户端正常关闭
#[async_trait]
pub trait TransportSource: Send + 'static {
    async fn receive(&mut self) -> Result<Option<String>, TransportError>;
}

/// 收件箱中的输入
#[derive(Debug)]
pub enum SessionInput {
    Client(String),
    ClientClosed,
    Broker {
        channel: String,
        envelope: EventEnvelope,
    },
    ListenerFailed {
        channel: String,
        error: BrokerError,
    },
}

/// 事件处理函数的输出，由会话循环执行
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Nothing,
    Send(EventEnvelope),
    /// 写出后确认该消息对当前用户已送达
    Deliver {
        envelope: EventEnvelope,
        message_id: MessageId,
    },
    /// 追加订阅聊天频道后写出
    Subscribe {
        chat_id: ChatId,
        envelope: EventEnvelope,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("subscription on {channel} lost: {message}")]
    Connectivity { channel: String, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 会话共享的服务
pub struct SessionServices {
    pub directory: Arc<dyn ChatDirectory>,
    pub delivery: Arc<DeliveryService>,
    pub dispatch: Arc<MessageDispatchService>,
    pub broker: Arc<dyn ChatBroker>,
}

/// 传给事件处理函数的上下文
#[derive(Clone)]
pub struct SessionContext {
    pub user_id: UserId,
    pub services: Arc<SessionServices>,
}

pub type SessionRegistry = EventRegistry<SessionContext, SessionAction>;

/// 一个会话持有的全部 broker 订阅
pub struct SubscriptionSet {
    broker: Arc<dyn ChatBroker>,
    inbox: mpsc::Sender<SessionInput>,
    listeners: HashMap<String, JoinHandle<()>>,
    closed: bool,
}

impl SubscriptionSet {
    pub fn new(broker: Arc<dyn ChatBroker>, inbox: mpsc::Sender<SessionInput>) -> Self {
        Self {
            broker,
            inbox,
            listeners: HashMap::new(),
            closed: false,
        }
    }

    /// 订阅用户所有聊天频道和用户私有频道
    ///
    /// 任何一个订阅失败时，已经建立的订阅全部释放。
    pub async fn open(
        broker: Arc<dyn ChatBroker>,
        inbox: mpsc::Sender<SessionInput>,
        user_id: UserId,
        chat_ids: &[ChatId],
    ) -> Result<Self, ApplicationError> {
        let mut set = Self::new(broker, inbox);
        let channels = chat_ids
            .iter()
            .map(|chat_id| chat_channel(*chat_id))
            .chain(std::iter::once(user_channel(user_id)));

        for channel in channels {
            if let Err(err) = set.subscribe_additional(&channel).await {
                tracing::warn!(user_id = %user_id, channel = %channel, error = %err, "订阅失败，释放已建立的订阅");
                set.close();
                return Err(err);
            }
        }
        Ok(set)
    }

    /// 幂等：已订阅时返回 `Ok(false)`
    pub async fn subscribe_additional(&mut self, channel: &str) -> Result<bool, ApplicationError> {
        if self.closed {
            return Err(ApplicationError::connectivity("subscription set is closed"));
        }
        if self.listeners.contains_key(channel) {
            return Ok(false);
        }

        let stream = self.broker.subscribe(channel).await?;
        let handle = tokio::spawn(listen(channel.to_string(), stream, self.inbox.clone()));
        self.listeners.insert(channel.to_string(), handle);
        tracing::debug!(channel = %channel, "频道监听已启动");
        Ok(true)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.listeners.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// 中止所有监听任务；可重复调用
    pub fn close(&mut self) {
        for (channel, handle) in self.listeners.drain() {
            handle.abort();
            tracing::debug!(channel = %channel, "频道监听已中止");
        }
        self.closed = true;
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.close();
    }
}

async fn listen(channel: String, mut stream: BrokerStream, inbox: mpsc::Sender<SessionInput>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(envelope) => {
                let input = SessionInput::Broker {
                    channel: channel.clone(),
                    envelope,
                };
                if inbox.send(input).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = inbox.send(SessionInput::ListenerFailed { channel, error }).await;
                return;
            }
        }
    }

    let _ = inbox
        .send(SessionInput::ListenerFailed {
            channel,
            error: BrokerError::Connection("subscription stream ended".to_string()),
        })
        .await;
}

async fn read_loop<R: TransportSource>(mut source: R, inbox: mpsc::Sender<SessionInput>) {
    loop {
        match source.receive().await {
            Ok(Some(frame)) => {
                if inbox.send(SessionInput::Client(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "读取客户端帧失败，按断开处理");
                break;
            }
        }
    }
    let _ = inbox.send(SessionInput::ClientClosed).await;
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub inbox_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inbox_capacity: 256,
        }
    }
}

/// 会话入口：持有启动时构建好的两个事件注册表
pub struct ChatGateway {
    services: Arc<SessionServices>,
    client_events: Arc<SessionRegistry>,
    broker_events: Arc<SessionRegistry>,
    settings: SessionSettings,
}

impl ChatGateway {
    pub fn new(services: SessionServices, settings: SessionSettings) -> Self {
        Self {
            services: Arc::new(services),
            client_events: Arc::new(handlers::client_registry()),
            broker_events: Arc::new(handlers::broker_registry()),
            settings,
        }
    }

    pub fn session(&self, user_id: UserId) -> ChatSession {
        ChatSession {
            context: SessionContext {
                user_id,
                services: self.services.clone(),
            },
            client_events: self.client_events.clone(),
            broker_events: self.broker_events.clone(),
            settings: self.settings.clone(),
        }
    }
}

pub struct ChatSession {
    context: SessionContext,
    client_events: Arc<SessionRegistry>,
    broker_events: Arc<SessionRegistry>,
    settings: SessionSettings,
}

impl ChatSession {
    pub fn user_id(&self) -> UserId {
        self.context.user_id
    }

    /// 运行会话直到客户端断开、传输失败或任一频道监听失败
    pub async fn run<S, R>(self, mut sink: S, source: R) -> Result<(), SessionError>
    where
        S: TransportSink,
        R: TransportSource,
    {
        let user_id = self.context.user_id;
        let services = self.context.services.clone();
        let (inbox_tx, mut inbox) = mpsc::channel(self.settings.inbox_capacity.max(1));

        let chat_ids = services
            .directory
            .chats_of(user_id)
            .await
            .map_err(ApplicationError::from)?;
        let mut subscriptions = SubscriptionSet::open(
            services.broker.clone(),
            inbox_tx.clone(),
            user_id,
            &chat_ids,
        )
        .await?;
        tracing::info!(user_id = %user_id, chats = chat_ids.len(), "会话已建立");

        let result = async {
            self.catch_up(&mut sink, &chat_ids).await?;
            let _reader = AbortOnDrop(tokio::spawn(read_loop(source, inbox_tx)));
            self.drive(&mut sink, &mut subscriptions, &mut inbox).await
        }
        .await;

        subscriptions.close();
        if let Err(err) = sink.close().await {
            tracing::debug!(user_id = %user_id, error = %err, "关闭传输失败");
        }
        match &result {
            Ok(()) => tracing::info!(user_id = %user_id, "会话已结束"),
            Err(err) => tracing::warn!(user_id = %user_id, error = %err, "会话异常结束"),
        }
        result
    }

    async fn catch_up<S: TransportSink>(
        &self,
        sink: &mut S,
        chat_ids: &[ChatId],
    ) -> Result<(), SessionError> {
        let delivery = &self.context.services.delivery;
        let user_id = self.context.user_id;

        let undelivered = delivery.mark_delivered_on_reconnect(user_id).await?;
        let payload = UndeliveredMessagesPayload {
            messages: undelivered.iter().map(MessageSentPayload::from).collect(),
        };
        self.send(
            sink,
            &EventEnvelope::new(EventKind::UndeliveredMessagesSent, &payload)?,
        )
        .await?;

        let counts = delivery.unread_counts(user_id, chat_ids).await?;
        self.send(
            sink,
            &EventEnvelope::new(EventKind::UnreadCountsSent, &UnreadCountsPayload { counts })?,
        )
        .await
    }

    async fn drive<S: TransportSink>(
        &self,
        sink: &mut S,
        subscriptions: &mut SubscriptionSet,
        inbox: &mut mpsc::Receiver<SessionInput>,
    ) -> Result<(), SessionError> {
        while let Some(input) = inbox.recv().await {
            match input {
                SessionInput::Client(frame) => {
                    self.on_client_frame(sink, subscriptions, frame).await?
                }
                SessionInput::ClientClosed => return Ok(()),
                SessionInput::Broker { channel, envelope } => {
                    self.on_broker_event(sink, subscriptions, &channel, envelope)
                        .await?
                }
                SessionInput::ListenerFailed { channel, error } => {
                    return Err(SessionError::Connectivity {
                        channel,
                        message: error.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn on_client_frame<S: TransportSink>(
        &self,
        sink: &mut S,
        subscriptions: &mut SubscriptionSet,
        frame: String,
    ) -> Result<(), SessionError> {
        let EventEnvelope { event, data } = match EventEnvelope::from_json(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                return self
                    .send_error(sink, "invalid_payload", err.to_string(), None)
                    .await
            }
        };

        match self
            .client_events
            .dispatch(&event, data, self.context.clone())
            .await
        {
            Ok(action) => self.apply(sink, subscriptions, action).await,
            Err(err) => {
                tracing::debug!(
                    user_id = %self.context.user_id,
                    event = %event,
                    error = %err,
                    "客户端事件处理失败"
                );
                self.send_error(sink, err.kind(), err.to_string(), Some(event))
                    .await
            }
        }
    }

    async fn on_broker_event<S: TransportSink>(
        &self,
        sink: &mut S,
        subscriptions: &mut SubscriptionSet,
        channel: &str,
        envelope: EventEnvelope,
    ) -> Result<(), SessionError> {
        let EventEnvelope { event, data } = envelope;
        match self
            .broker_events
            .dispatch(&event, data, self.context.clone())
            .await
        {
            Ok(action) => self.apply(sink, subscriptions, action).await,
            Err(err) => {
                tracing::warn!(
                    user_id = %self.context.user_id,
                    channel = %channel,
                    event = %event,
                    error = %err,
                    "broker 事件处理失败"
                );
                Ok(())
            }
        }
    }

    async fn apply<S: TransportSink>(
        &self,
        sink: &mut S,
        subscriptions: &mut SubscriptionSet,
        action: SessionAction,
    ) -> Result<(), SessionError> {
        match action {
            SessionAction::Nothing => Ok(()),
            SessionAction::Send(envelope) => self.send(sink, &envelope).await,
            SessionAction::Deliver {
                envelope,
                message_id,
            } => {
                self.send(sink, &envelope).await?;
                let user_id = self.context.user_id;
                if let Err(err) = self
                    .context
                    .services
                    .delivery
                    .acknowledge_live_delivery(message_id, user_id)
                    .await
                {
                    tracing::warn!(
                        user_id = %user_id,
                        message_id = %message_id,
                        error = %err,
                        "实时送达确认失败，重连时会再次补发"
                    );
                }
                Ok(())
            }
            SessionAction::Subscribe { chat_id, envelope } => {
                let channel = chat_channel(chat_id);
                subscriptions
                    .subscribe_additional(&channel)
                    .await
                    .map_err(|err| SessionError::Connectivity {
                        channel: channel.clone(),
                        message: err.to_string(),
                    })?;
                self.send(sink, &envelope).await
            }
        }
    }

    async fn send<S: TransportSink>(
        &self,
        sink: &mut S,
        envelope: &EventEnvelope,
    ) -> Result<(), SessionError> {
        sink.send(envelope.to_json()?).await?;
        Ok(())
    }

    async fn send_error<S: TransportSink>(
        &self,
        sink: &mut S,
        kind: &str,
        message: String,
        event: Option<String>,
    ) -> Result<(), SessionError> {
        let payload = ErrorPayload {
            kind: kind.to_string(),
            message,
            event,
        };
        self.send(sink, &EventEnvelope::new(EventKind::Error, &payload)?)
            .await
    }
}
