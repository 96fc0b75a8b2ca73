use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{
    ApplicationError, ChatBroker, DelayQueue, JobHandler, ScheduledJob,
};
use async_trait::async_trait;
use config::DelayQueueConfig;
use domain::{ChatId, EventEnvelope, EventKind, ScheduledMessageId, UserId};
use futures::StreamExt;
use infrastructure::{RedisChatBroker, RedisDelayQueue};
use redis::aio::ConnectionManager;
use time::OffsetDateTime;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn queue() -> RedisDelayQueue {
    queue_with(DelayQueueConfig {
        poll_interval_ms: 20,
        retry_delay_ms: 60_000,
        promote_batch: 10,
        ..DelayQueueConfig::default()
    })
    .await
}

async fn queue_with(settings: DelayQueueConfig) -> RedisDelayQueue {
    let client = redis::Client::open(redis_url()).expect("client");
    let conn = ConnectionManager::new(client).await.expect("connect");
    let prefix = format!("test:{}", Uuid::new_v4());
    RedisDelayQueue::new(
        conn,
        DelayQueueConfig {
            wait_key: format!("{prefix}:wait"),
            ready_key: format!("{prefix}:ready"),
            processing_key_prefix: format!("{prefix}:processing"),
            ..settings
        },
    )
}

fn job(id: i64) -> ScheduledJob {
    let now = OffsetDateTime::now_utc();
    ScheduledJob {
        scheduled_message_id: ScheduledMessageId::new(id),
        chat_id: ChatId::new(1),
        author_id: UserId::new(2),
        content: "later".to_string(),
        scheduled_at: now,
        created_at: now,
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<ScheduledMessageId>>,
    abandoned: Mutex<Vec<(ScheduledMessageId, String)>>,
    fail: bool,
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, job: ScheduledJob) -> Result<(), ApplicationError> {
        self.seen
            .lock()
            .expect("lock")
            .push(job.scheduled_message_id);
        if self.fail {
            Err(ApplicationError::connectivity("store down"))
        } else {
            Ok(())
        }
    }

    async fn abandon(&self, job: ScheduledJob, reason: String) -> Result<(), ApplicationError> {
        self.abandoned
            .lock()
            .expect("lock")
            .push((job.scheduled_message_id, reason));
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires redis"]
async fn published_events_reach_subscribers() {
    let broker = RedisChatBroker::connect(&redis_url()).await.expect("broker");
    let channel = format!("chat:{}", Uuid::new_v4());
    let mut stream = broker.subscribe(&channel).await.expect("subscribe");

    let envelope = EventEnvelope::new(EventKind::NewChatSent, &serde_json::json!({"chat_id": 9}))
        .expect("envelope");
    broker.publish(&channel, &envelope).await.expect("publish");

    let received = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("decode");
    assert_eq!(received, envelope);
}

#[tokio::test]
#[ignore = "requires redis"]
async fn due_jobs_are_handled_and_acknowledged() {
    let queue = queue().await;
    let handler = Recorder::default();

    queue.enqueue(&job(1), Duration::ZERO).await.expect("enqueue");
    queue
        .enqueue(&job(2), Duration::from_secs(3600))
        .await
        .expect("enqueue");
    assert_eq!(queue.waiting_len().await.expect("len"), 2);

    assert!(queue.poll_once("w1", &handler).await.expect("poll"));
    assert!(!queue.poll_once("w1", &handler).await.expect("idle poll"));

    assert_eq!(*handler.seen.lock().expect("lock"), vec![ScheduledMessageId::new(1)]);
    assert_eq!(queue.waiting_len().await.expect("len"), 1);
    assert_eq!(queue.ready_len().await.expect("len"), 0);
    assert_eq!(queue.recover("w1").await.expect("recover"), 0);
}

#[tokio::test]
#[ignore = "requires redis"]
async fn failed_jobs_go_back_to_the_waiting_set() {
    let queue = queue().await;
    let handler = Recorder {
        fail: true,
        ..Recorder::default()
    };

    queue.enqueue(&job(7), Duration::ZERO).await.expect("enqueue");
    assert!(queue.poll_once("w1", &handler).await.expect("poll"));

    assert_eq!(handler.seen.lock().expect("lock").len(), 1);
    assert_eq!(queue.waiting_len().await.expect("len"), 1);
    assert_eq!(queue.recover("w1").await.expect("recover"), 0);
}

#[tokio::test]
#[ignore = "requires redis"]
async fn jobs_are_abandoned_after_max_attempts() {
    let queue = queue_with(DelayQueueConfig {
        poll_interval_ms: 20,
        retry_delay_ms: 0,
        promote_batch: 10,
        max_attempts: 3,
        ..DelayQueueConfig::default()
    })
    .await;
    let handler = Recorder {
        fail: true,
        ..Recorder::default()
    };

    queue.enqueue(&job(8), Duration::ZERO).await.expect("enqueue");
    for _ in 0..3 {
        assert!(queue.poll_once("w1", &handler).await.expect("poll"));
    }
    assert!(!queue.poll_once("w1", &handler).await.expect("idle poll"));

    assert_eq!(handler.seen.lock().expect("lock").len(), 3);
    let abandoned = handler.abandoned.lock().expect("lock").clone();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].0, ScheduledMessageId::new(8));
    assert!(abandoned[0].1.contains("3 attempts"), "{}", abandoned[0].1);
    assert_eq!(queue.waiting_len().await.expect("len"), 0);
    assert_eq!(queue.ready_len().await.expect("len"), 0);
    assert_eq!(queue.recover("w1").await.expect("recover"), 0);
}

#[tokio::test]
#[ignore = "requires redis"]
async fn consumer_loop_stops_on_shutdown() {
    let queue = queue().await;
    let handler = Arc::new(Recorder::default());
    queue.enqueue(&job(3), Duration::ZERO).await.expect("enqueue");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = queue.clone();
    let consumer = handler.clone();
    let task = tokio::spawn(async move { runner.run("w2", consumer, shutdown_rx).await });

    for _ in 0..100 {
        if !handler.seen.lock().expect("lock").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(*handler.seen.lock().expect("lock"), vec![ScheduledMessageId::new(3)]);

    shutdown_tx.send(true).expect("signal");
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("consumer stopped")
        .expect("join")
        .expect("run");
}
