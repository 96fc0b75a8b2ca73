//! 应用层实现。
//!
//! 这里提供投递核心的用例服务：消息分发流水线、投递/已读状态、
//! 定时消息状态机、事件注册表以及在线会话，并定义存储、broker、
//! 延迟队列和传输层的抽象接口。

pub mod broker;
pub mod clock;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod local_broadcast;
pub mod memory;
pub mod queue;
pub mod repository;
pub mod services;
pub mod session;

pub use broker::{publish_best_effort, BrokerError, BrokerStream, ChatBroker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{DeliveryService, DeliveryServiceDependencies};
pub use dispatcher::{DispatchError, EventPayload, EventRegistry};
pub use error::ApplicationError;
pub use local_broadcast::LocalChatBroker;
pub use queue::{delay_until, DelayQueue, JobHandler, QueueError, ScheduledJob};
pub use repository::{
    ChatDirectory, DeliveryRepository, MessageRepository, ReadOutcome, ScheduledMessageRepository,
};
pub use services::{
    MessageDispatchDependencies, MessageDispatchService, ScheduleRequest,
    ScheduledMessageService, ScheduledMessageServiceDependencies, ScheduledMessageWorker,
    ScheduledMessageWorkerDependencies, UpdateScheduledRequest,
};
pub use session::{
    ChatGateway, ChatSession, SessionAction, SessionContext, SessionError, SessionInput,
    SessionRegistry, SessionServices, SessionSettings, SubscriptionSet, TransportError,
    TransportSink, TransportSource,
};
