//! 事件注册表
//!
//! 启动时把每个 [`EventKind`] 绑定到一个强类型负载和处理函数，
//! 分发时按事件名查表；未知事件、负载解析失败、处理失败分别返回不同的错误。

use std::collections::HashMap;
use std::future::Future;

use domain::{
    EventKind, MessageCreate, MessageSentPayload, NewChatPayload, ReadStatusPayload,
    ReadStatusUpdate, UnreadCountsRequest,
};
use futures_util::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::error::ApplicationError;

/// 可注册的事件负载
pub trait EventPayload: DeserializeOwned + Send + 'static {
    /// 反序列化之后的额外校验
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl EventPayload for MessageCreate {}

impl EventPayload for ReadStatusUpdate {
    fn validate(&self) -> Result<(), String> {
        if self.message_id.value() <= 0 {
            return Err("message_id must be positive".to_string());
        }
        Ok(())
    }
}

impl EventPayload for UnreadCountsRequest {}
impl EventPayload for MessageSentPayload {}
impl EventPayload for ReadStatusPayload {}
impl EventPayload for NewChatPayload {}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported event '{0}'")]
    Unsupported(String),
    #[error("invalid payload for '{event}': {message}")]
    InvalidPayload { event: EventKind, message: String },
    #[error("handler for '{event}' failed: {source}")]
    Handler {
        event: EventKind,
        #[source]
        source: ApplicationError,
    },
}

impl DispatchError {
    /// 回写给客户端的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "unsupported_event",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::Handler { source, .. } => source.kind(),
        }
    }
}

type BoxedHandler<C, O> =
    Box<dyn Fn(Value, C) -> BoxFuture<'static, Result<O, DispatchError>> + Send + Sync>;

pub struct EventRegistry<C, O> {
    handlers: HashMap<EventKind, BoxedHandler<C, O>>,
}

impl<C, O> Default for EventRegistry<C, O>
where
    C: Send + 'static,
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, O> EventRegistry<C, O>
where
    C: Send + 'static,
    O: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 注册处理函数，同一事件重复注册时后者覆盖前者
    pub fn register<P, F, Fut>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        P: EventPayload,
        F: Fn(P, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ApplicationError>> + Send + 'static,
    {
        let boxed: BoxedHandler<C, O> = Box::new(move |raw: Value, ctx: C| {
            let payload = match serde_json::from_value::<P>(raw) {
                Ok(payload) => payload,
                Err(err) => {
                    return future::ready(Err(DispatchError::InvalidPayload {
                        event: kind,
                        message: err.to_string(),
                    }))
                    .boxed()
                }
            };
            if let Err(message) = payload.validate() {
                return future::ready(Err(DispatchError::InvalidPayload {
                    event: kind,
                    message,
                }))
                .boxed();
            }

            handler(payload, ctx)
                .map(move |result| {
                    result.map_err(|source| DispatchError::Handler {
                        event: kind,
                        source,
                    })
                })
                .boxed()
        });
        self.handlers.insert(kind, boxed);
        self
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn dispatch(&self, event: &str, raw: Value, ctx: C) -> Result<O, DispatchError> {
        let handler = event
            .parse::<EventKind>()
            .ok()
            .and_then(|kind| self.handlers.get(&kind))
            .ok_or_else(|| DispatchError::Unsupported(event.to_string()))?;
        handler(raw, ctx).await
    }
}
