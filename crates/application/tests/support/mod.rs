//! 集成测试共用的内存装配

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::memory::{transport_pair, MemoryClient, MemoryDelayQueue, MemoryStore};
use application::{
    ChatBroker, ChatGateway, DeliveryService, DeliveryServiceDependencies, LocalChatBroker,
    ManualClock, MessageDispatchDependencies, MessageDispatchService, ScheduledMessageService,
    ScheduledMessageServiceDependencies, ScheduledMessageWorker,
    ScheduledMessageWorkerDependencies, SessionError, SessionServices, SessionSettings,
};
use domain::{ChatId, EventEnvelope, UserId};
use time::macros::datetime;
use tokio::task::JoinHandle;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<LocalChatBroker>,
    pub queue: Arc<MemoryDelayQueue>,
    pub clock: Arc<ManualClock>,
    pub delivery: Arc<DeliveryService>,
    pub dispatch: Arc<MessageDispatchService>,
    pub scheduled: ScheduledMessageService,
    pub worker: ScheduledMessageWorker,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(LocalChatBroker::new(64));
        let queue = Arc::new(MemoryDelayQueue::new());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));

        let delivery = Arc::new(DeliveryService::new(DeliveryServiceDependencies {
            directory: store.clone(),
            deliveries: store.clone(),
            clock: clock.clone(),
        }));
        let dispatch = Arc::new(dispatch_with(&store, broker.clone(), &clock));
        let scheduled = ScheduledMessageService::new(ScheduledMessageServiceDependencies {
            directory: store.clone(),
            scheduled: store.clone(),
            queue: queue.clone(),
            clock: clock.clone(),
        });
        let worker = ScheduledMessageWorker::new(ScheduledMessageWorkerDependencies {
            scheduled: store.clone(),
            dispatch: dispatch.clone(),
            clock: clock.clone(),
        });

        Self {
            store,
            broker,
            queue,
            clock,
            delivery,
            dispatch,
            scheduled,
            worker,
        }
    }

    pub fn join(&self, chat_id: i64, users: &[i64]) {
        for user in users {
            self.store
                .add_participant(ChatId::new(chat_id), UserId::new(*user));
        }
    }

    pub fn gateway(&self) -> ChatGateway {
        self.gateway_with(self.broker.clone())
    }

    pub fn gateway_with(&self, broker: Arc<dyn ChatBroker>) -> ChatGateway {
        let dispatch = Arc::new(dispatch_with(&self.store, broker.clone(), &self.clock));
        ChatGateway::new(
            SessionServices {
                directory: self.store.clone(),
                delivery: self.delivery.clone(),
                dispatch,
                broker,
            },
            SessionSettings { inbox_capacity: 32 },
        )
    }
}

pub fn dispatch_with(
    store: &Arc<MemoryStore>,
    broker: Arc<dyn ChatBroker>,
    clock: &Arc<ManualClock>,
) -> MessageDispatchService {
    MessageDispatchService::new(MessageDispatchDependencies {
        directory: store.clone(),
        messages: store.clone(),
        broker,
        clock: clock.clone(),
    })
}

pub type SessionHandle = JoinHandle<Result<(), SessionError>>;

/// 启动一个会话并等待两条补发事件，返回之后订阅已经就绪
pub async fn connect(gateway: &ChatGateway, user_id: i64) -> (MemoryClient, SessionHandle, Vec<EventEnvelope>) {
    let (sink, source, mut client) = transport_pair();
    let handle = tokio::spawn(gateway.session(UserId::new(user_id)).run(sink, source));
    let undelivered = next(&mut client).await;
    let unread = next(&mut client).await;
    (client, handle, vec![undelivered, unread])
}

pub async fn next(client: &mut MemoryClient) -> EventEnvelope {
    tokio::time::timeout(Duration::from_secs(2), client.next_event())
        .await
        .expect("timed out waiting for a frame")
        .expect("session closed before sending a frame")
}

/// 等待条件成立（后台任务异步推进的状态）
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
