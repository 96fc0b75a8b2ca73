//! 主应用程序入口
//!
//! 启动 WebSocket 投递服务和定时消息消费者。

use std::sync::Arc;

use application::{
    ChatGateway, Clock, DeliveryService, DeliveryServiceDependencies, JobHandler,
    MessageDispatchDependencies, MessageDispatchService, ScheduledMessageWorker,
    ScheduledMessageWorkerDependencies, SessionServices, SessionSettings, SystemClock,
};
use config::AppConfig;
use infrastructure::{ws_router, Infrastructure};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let infra = Infrastructure::connect(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let delivery = Arc::new(DeliveryService::new(DeliveryServiceDependencies {
        directory: infra.store.clone(),
        deliveries: infra.store.clone(),
        clock: clock.clone(),
    }));
    let dispatch = Arc::new(MessageDispatchService::new(MessageDispatchDependencies {
        directory: infra.store.clone(),
        messages: infra.store.clone(),
        broker: infra.broker.clone(),
        clock: clock.clone(),
    }));
    let worker: Arc<dyn JobHandler> =
        Arc::new(ScheduledMessageWorker::new(ScheduledMessageWorkerDependencies {
            scheduled: infra.store.clone(),
            dispatch: dispatch.clone(),
            clock,
        }));
    let gateway = Arc::new(ChatGateway::new(
        SessionServices {
            directory: infra.store.clone(),
            delivery,
            dispatch,
            broker: infra.broker.clone(),
        },
        SessionSettings {
            inbox_capacity: config.session.inbox_capacity,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = if config.worker.enabled {
        let queue = infra.delay_queue.clone();
        let consumer_id = config.worker.consumer_id.clone();
        let shutdown = shutdown_rx.clone();
        tracing::info!(consumer_id = %consumer_id, "定时消息消费者标识");
        Some(tokio::spawn(async move {
            if let Err(err) = queue.run(&consumer_id, worker, shutdown).await {
                tracing::error!(error = %err, "延迟队列消费者异常退出");
            }
        }))
    } else {
        tracing::info!("定时消息消费者已禁用");
        None
    };

    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    tracing::info!(address = %config.server.bind_address(), "投递服务启动");

    let mut server_shutdown = shutdown_rx;
    let server = axum::serve(listener, ws_router(gateway)).with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });

    let server_task = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号，开始关闭");
    let _ = shutdown_tx.send(true);

    server_task.await??;
    if let Some(consumer) = consumer {
        consumer.await?;
    }
    infra.shutdown().await;

    tracing::info!("投递服务已停止");
    Ok(())
}
