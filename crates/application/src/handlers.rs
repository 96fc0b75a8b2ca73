//! 客户端事件与 broker 事件的处理函数

use domain::{
    chat_channel, EventEnvelope, EventKind, MessageCreate, MessageSentPayload, NewChatPayload,
    ReadStatusPayload, ReadStatusUpdate, UnreadCountsPayload, UnreadCountsRequest,
};

use crate::{
    broker::publish_best_effort,
    error::ApplicationError,
    session::{SessionAction, SessionContext, SessionRegistry},
};

fn envelope<T: serde::Serialize>(
    kind: EventKind,
    payload: &T,
) -> Result<EventEnvelope, ApplicationError> {
    EventEnvelope::new(kind, payload).map_err(|err| ApplicationError::InvalidPayload(err.to_string()))
}

/// 客户端 -> 服务端
pub fn client_registry() -> SessionRegistry {
    let mut registry = SessionRegistry::new();
    registry
        .register(EventKind::NewMessage, new_message)
        .register(EventKind::ReadMessage, read_message)
        .register(EventKind::GetUnreadCounts, get_unread_counts);
    registry
}

/// broker -> 会话
pub fn broker_registry() -> SessionRegistry {
    let mut registry = SessionRegistry::new();
    registry
        .register(EventKind::MessageSent, message_sent)
        .register(EventKind::ReadStatusUpdated, read_status_updated)
        .register(EventKind::NewChatSent, new_chat_sent);
    registry
}

// 作者本人也订阅了聊天频道，会通过 message_sent 收到自己的消息
async fn new_message(
    payload: MessageCreate,
    ctx: SessionContext,
) -> Result<SessionAction, ApplicationError> {
    ctx.services
        .dispatch
        .dispatch(ctx.user_id, payload.chat_id, payload.content)
        .await?;
    Ok(SessionAction::Nothing)
}

async fn read_message(
    payload: ReadStatusUpdate,
    ctx: SessionContext,
) -> Result<SessionAction, ApplicationError> {
    let status = ctx
        .services
        .delivery
        .mark_read(payload.chat_id, ctx.user_id, payload.message_id)
        .await?;

    let fan_out = envelope(EventKind::ReadStatusUpdated, &status)?;
    publish_best_effort(
        ctx.services.broker.as_ref(),
        &chat_channel(payload.chat_id),
        &fan_out,
    )
    .await;
    Ok(SessionAction::Nothing)
}

async fn get_unread_counts(
    payload: UnreadCountsRequest,
    ctx: SessionContext,
) -> Result<SessionAction, ApplicationError> {
    let chat_ids = match payload.chat_ids {
        Some(chat_ids) => chat_ids,
        None => ctx.services.directory.chats_of(ctx.user_id).await?,
    };
    let counts = ctx
        .services
        .delivery
        .unread_counts(ctx.user_id, &chat_ids)
        .await?;
    Ok(SessionAction::Send(envelope(
        EventKind::UnreadCountsSent,
        &UnreadCountsPayload { counts },
    )?))
}

async fn message_sent(
    payload: MessageSentPayload,
    ctx: SessionContext,
) -> Result<SessionAction, ApplicationError> {
    let out = envelope(EventKind::MessageSent, &payload)?;
    if payload.user_id == ctx.user_id {
        return Ok(SessionAction::Send(out));
    }
    Ok(SessionAction::Deliver {
        envelope: out,
        message_id: payload.message_id,
    })
}

async fn read_status_updated(
    payload: ReadStatusPayload,
    _ctx: SessionContext,
) -> Result<SessionAction, ApplicationError> {
    Ok(SessionAction::Send(envelope(
        EventKind::ReadStatusUpdated,
        &payload,
    )?))
}

async fn new_chat_sent(
    payload: NewChatPayload,
    _ctx: SessionContext,
) -> Result<SessionAction, ApplicationError> {
    Ok(SessionAction::Subscribe {
        chat_id: payload.chat_id,
        envelope: envelope(EventKind::NewChatSent, &payload)?,
    })
}
