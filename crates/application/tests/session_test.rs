//! 在线会话集成测试：订阅、补发、实时推送与错误帧

mod support;

use std::sync::Arc;
use std::time::Duration;

use application::{
    BrokerError, BrokerStream, ChatBroker, LocalChatBroker, SessionError,
};
use async_trait::async_trait;
use domain::{
    ChatId, ErrorPayload, EventEnvelope, EventKind, MessageCreate, MessageId, MessageSentPayload,
    NewChatPayload, ReadStatusPayload, ReadStatusUpdate, UndeliveredMessagesPayload,
    UnreadCountsPayload, UnreadCountsRequest, UserId,
};
use futures::{stream, StreamExt};
use support::{connect, eventually, next, Harness};

fn payload<T: serde::de::DeserializeOwned>(envelope: &EventEnvelope, kind: EventKind) -> T {
    assert_eq!(envelope.event, kind.as_str(), "unexpected frame {envelope:?}");
    serde_json::from_value(envelope.data.clone()).expect("payload")
}

fn error_of(envelope: &EventEnvelope) -> ErrorPayload {
    payload(envelope, EventKind::Error)
}

#[tokio::test]
async fn connect_sends_undelivered_messages_and_unread_counts() {
    let harness = Harness::new();
    harness.join(42, &[1, 2]);
    harness.join(43, &[2, 3]);
    let message = harness
        .dispatch
        .dispatch(UserId::new(1), ChatId::new(42), "hi")
        .await
        .expect("dispatch");

    let gateway = harness.gateway();
    let (mut client, handle, catch_up) = connect(&gateway, 2).await;

    let undelivered: UndeliveredMessagesPayload =
        payload(&catch_up[0], EventKind::UndeliveredMessagesSent);
    assert_eq!(undelivered.messages.len(), 1);
    assert_eq!(undelivered.messages[0].message_id, message.id);
    assert_eq!(undelivered.messages[0].content, "hi");

    let counts: UnreadCountsPayload = payload(&catch_up[1], EventKind::UnreadCountsSent);
    assert_eq!(counts.counts.get(&ChatId::new(42)), Some(&1));
    assert_eq!(counts.counts.get(&ChatId::new(43)), Some(&0));

    let record = harness
        .store
        .delivery(message.id, UserId::new(2))
        .expect("record");
    assert!(record.is_delivered);
    assert!(!record.is_read);

    client.disconnect();
    handle.await.expect("join").expect("clean close");
}

#[tokio::test]
async fn live_message_reaches_author_and_recipient() {
    let harness = Harness::new();
    harness.join(42, &[1, 2]);
    let gateway = harness.gateway();
    let (mut author, author_session, _) = connect(&gateway, 1).await;
    let (mut reader, reader_session, _) = connect(&gateway, 2).await;

    assert!(author.send(
        EventKind::NewMessage,
        &MessageCreate {
            chat_id: ChatId::new(42),
            content: "hello there".to_string(),
        },
    ));

    let echo: MessageSentPayload = payload(&next(&mut author).await, EventKind::MessageSent);
    assert_eq!(echo.user_id, UserId::new(1));
    let received: MessageSentPayload = payload(&next(&mut reader).await, EventKind::MessageSent);
    assert_eq!(received.message_id, echo.message_id);
    assert_eq!(received.content, "hello there");

    let store = harness.store.clone();
    eventually(move || {
        store
            .delivery(echo.message_id, UserId::new(2))
            .is_some_and(|record| record.is_delivered)
    })
    .await;

    author.disconnect();
    reader.disconnect();
    author_session.await.expect("join").expect("author");
    reader_session.await.expect("join").expect("reader");
}

#[tokio::test]
async fn read_message_fans_out_read_status() {
    let harness = Harness::new();
    harness.join(42, &[1, 2]);
    let message = harness
        .dispatch
        .dispatch(UserId::new(1), ChatId::new(42), "read me")
        .await
        .expect("dispatch");

    let gateway = harness.gateway();
    let (mut author, _author_session, _) = connect(&gateway, 1).await;
    let (mut reader, _reader_session, _) = connect(&gateway, 2).await;

    assert!(reader.send(
        EventKind::ReadMessage,
        &ReadStatusUpdate {
            chat_id: ChatId::new(42),
            message_id: message.id,
        },
    ));

    for client in [&mut author, &mut reader] {
        let status: ReadStatusPayload =
            payload(&next(client).await, EventKind::ReadStatusUpdated);
        assert_eq!(status.user_id, UserId::new(2));
        assert_eq!(status.last_read_message_id, message.id);
    }

    let record = harness
        .store
        .delivery(message.id, UserId::new(2))
        .expect("record");
    assert!(record.is_read);
}

#[tokio::test]
async fn get_unread_counts_defaults_to_all_chats() {
    let harness = Harness::new();
    harness.join(5, &[1, 2]);
    harness.join(6, &[2]);
    for text in ["a", "b"] {
        harness
            .dispatch
            .dispatch(UserId::new(1), ChatId::new(5), text)
            .await
            .expect("dispatch");
    }

    let gateway = harness.gateway();
    let (mut client, _session, _) = connect(&gateway, 2).await;

    assert!(client.send(EventKind::GetUnreadCounts, &UnreadCountsRequest::default()));
    let all: UnreadCountsPayload = payload(&next(&mut client).await, EventKind::UnreadCountsSent);
    // 补发已经把消息置为送达，但仍然未读
    assert_eq!(all.counts.get(&ChatId::new(5)), Some(&2));
    assert_eq!(all.counts.get(&ChatId::new(6)), Some(&0));

    assert!(client.send(
        EventKind::GetUnreadCounts,
        &UnreadCountsRequest {
            chat_ids: Some(vec![ChatId::new(6)]),
        },
    ));
    let some: UnreadCountsPayload = payload(&next(&mut client).await, EventKind::UnreadCountsSent);
    assert_eq!(some.counts.len(), 1);
    assert_eq!(some.counts.get(&ChatId::new(6)), Some(&0));
}

#[tokio::test]
async fn bad_client_frames_produce_error_frames_and_keep_the_session() {
    let harness = Harness::new();
    harness.join(42, &[1, 2]);
    harness.join(50, &[3]);
    let message = harness
        .dispatch
        .dispatch(UserId::new(2), ChatId::new(42), "x")
        .await
        .expect("dispatch");

    let gateway = harness.gateway();
    let (mut client, _session, _) = connect(&gateway, 1).await;

    assert!(client.send_raw("{not json"));
    assert_eq!(error_of(&next(&mut client).await).kind, "invalid_payload");

    assert!(client.send_raw(r#"{"event":"bogus","data":{}}"#));
    let unsupported = error_of(&next(&mut client).await);
    assert_eq!(unsupported.kind, "unsupported_event");
    assert_eq!(unsupported.event.as_deref(), Some("bogus"));

    assert!(client.send_raw(r#"{"event":"new_message","data":{"chat_id":"x"}}"#));
    assert_eq!(error_of(&next(&mut client).await).kind, "invalid_payload");

    assert!(client.send(
        EventKind::NewMessage,
        &MessageCreate {
            chat_id: ChatId::new(50),
            content: "let me in".to_string(),
        },
    ));
    let denied = error_of(&next(&mut client).await);
    assert_eq!(denied.kind, "authorization");
    assert_eq!(denied.event.as_deref(), Some("new_message"));

    assert!(client.send(
        EventKind::ReadMessage,
        &ReadStatusUpdate {
            chat_id: ChatId::new(42),
            message_id: MessageId::new(1_000_000),
        },
    ));
    let beyond = error_of(&next(&mut client).await);
    assert_eq!(beyond.kind, "validation");
    assert_eq!(beyond.event.as_deref(), Some("read_message"));
    assert!(harness.store.cursor(ChatId::new(42), UserId::new(1)).is_none());

    let read = ReadStatusUpdate {
        chat_id: ChatId::new(42),
        message_id: message.id,
    };
    assert!(client.send(EventKind::ReadMessage, &read));
    let _: ReadStatusPayload = payload(&next(&mut client).await, EventKind::ReadStatusUpdated);
    assert!(client.send(EventKind::ReadMessage, &read));
    assert_eq!(error_of(&next(&mut client).await).kind, "conflict");

    // 会话仍然可用
    assert!(client.send(EventKind::GetUnreadCounts, &UnreadCountsRequest::default()));
    let _: UnreadCountsPayload = payload(&next(&mut client).await, EventKind::UnreadCountsSent);
}

#[tokio::test]
async fn new_chat_notification_subscribes_to_the_chat() {
    let harness = Harness::new();
    harness.join(42, &[3]);
    let gateway = harness.gateway();
    let (mut client, _session, _) = connect(&gateway, 3).await;
    assert_eq!(harness.broker.subscriber_count("chat:77"), 0);

    harness.join(77, &[1, 3]);
    let mut details = serde_json::Map::new();
    details.insert("name".to_string(), serde_json::json!("weekend plans"));
    let notice = EventEnvelope::new(
        EventKind::NewChatSent,
        &NewChatPayload {
            chat_id: ChatId::new(77),
            details,
        },
    )
    .expect("envelope");
    harness
        .broker
        .publish("user:3", &notice)
        .await
        .expect("publish");

    let forwarded: NewChatPayload = payload(&next(&mut client).await, EventKind::NewChatSent);
    assert_eq!(forwarded.chat_id, ChatId::new(77));
    assert_eq!(forwarded.details["name"], "weekend plans");
    assert_eq!(harness.broker.subscriber_count("chat:77"), 1);

    // 重复通知不会重复订阅
    harness
        .broker
        .publish("user:3", &notice)
        .await
        .expect("publish");
    let _: NewChatPayload = payload(&next(&mut client).await, EventKind::NewChatSent);
    assert_eq!(harness.broker.subscriber_count("chat:77"), 1);

    harness
        .dispatch
        .dispatch(UserId::new(1), ChatId::new(77), "welcome")
        .await
        .expect("dispatch");
    let welcome: MessageSentPayload = payload(&next(&mut client).await, EventKind::MessageSent);
    assert_eq!(welcome.content, "welcome");
}

#[tokio::test]
async fn disconnect_releases_every_subscription() {
    let harness = Harness::new();
    harness.join(42, &[1]);
    harness.join(43, &[1]);
    let gateway = harness.gateway();
    let (mut client, handle, _) = connect(&gateway, 1).await;

    for channel in ["chat:42", "chat:43", "user:1"] {
        assert_eq!(harness.broker.subscriber_count(channel), 1, "{channel}");
    }

    client.disconnect();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("session ends")
        .expect("join")
        .expect("clean close");

    let broker = harness.broker.clone();
    eventually(move || {
        ["chat:42", "chat:43", "user:1"]
            .iter()
            .all(|channel| broker.subscriber_count(channel) == 0)
    })
    .await;
    assert!(client.next_event().await.is_none());
}

/// 某个频道的订阅流立刻报错，其余频道走本地 broker
struct FlakyBroker {
    inner: Arc<LocalChatBroker>,
    broken: &'static str,
}

#[async_trait]
impl ChatBroker for FlakyBroker {
    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        self.inner.publish(channel, envelope).await
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError> {
        if channel == self.broken {
            let failure: Result<EventEnvelope, BrokerError> =
                Err(BrokerError::Connection("connection reset".to_string()));
            return Ok(stream::once(async move { failure }).boxed());
        }
        self.inner.subscribe(channel).await
    }
}

#[tokio::test]
async fn listener_failure_ends_the_session() {
    let harness = Harness::new();
    harness.join(12, &[1]);
    harness.join(13, &[1]);
    let gateway = harness.gateway_with(Arc::new(FlakyBroker {
        inner: harness.broker.clone(),
        broken: "chat:13",
    }));

    let (_client, handle, _) = connect(&gateway, 1).await;
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("session ends")
        .expect("join");

    match result {
        Err(SessionError::Connectivity { channel, .. }) => assert_eq!(channel, "chat:13"),
        other => panic!("expected connectivity failure, got {other:?}"),
    }

    let broker = harness.broker.clone();
    eventually(move || {
        broker.subscriber_count("chat:12") == 0 && broker.subscriber_count("user:1") == 0
    })
    .await;
}

#[tokio::test]
async fn failed_subscription_at_open_is_reported() {
    struct Refusing;

    #[async_trait]
    impl ChatBroker for Refusing {
        async fn publish(&self, _: &str, _: &EventEnvelope) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn subscribe(&self, _: &str) -> Result<BrokerStream, BrokerError> {
            Err(BrokerError::Subscribe("refused".to_string()))
        }
    }

    let harness = Harness::new();
    harness.join(12, &[1]);
    let gateway = harness.gateway_with(Arc::new(Refusing));
    let (sink, source, mut client) = application::memory::transport_pair();

    let result = gateway.session(UserId::new(1)).run(sink, source).await;
    assert!(result.is_err());
    assert!(client.next_event().await.is_none(), "没有补发帧");
}
