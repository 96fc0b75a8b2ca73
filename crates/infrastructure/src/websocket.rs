//! axum WebSocket 到会话传输接口的适配
//!
//! 只有文本帧承载事件；ping/pong 由 axum 自动应答，二进制帧被忽略。
//! 用户身份来自上游网关注入的 `x-user-id` 请求头。

use std::sync::Arc;

use application::{ChatGateway, TransportError, TransportSink, TransportSource};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use domain::UserId;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tracing::{debug, info, warn};

pub const USER_ID_HEADER: &str = "x-user-id";

/// `GET /ws` 路由
pub fn ws_router(gateway: Arc<ChatGateway>) -> Router {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .with_state(gateway)
}

fn user_from_headers(headers: &HeaderMap) -> Option<UserId> {
    let raw = headers.get(USER_ID_HEADER)?.to_str().ok()?;
    raw.trim().parse::<i64>().ok().map(UserId::new)
}

async fn websocket_upgrade(
    State(gateway): State<Arc<ChatGateway>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = user_from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing or invalid x-user-id").into_response();
    };
    ws.on_upgrade(move |socket| serve_session(gateway, user_id, socket))
}

async fn serve_session(gateway: Arc<ChatGateway>, user_id: UserId, socket: WebSocket) {
    let (sink, source) = WebSocketTransport::split(socket);
    info!(user_id = %user_id, "WebSocket 会话已建立");
    match gateway.session(user_id).run(sink, source).await {
        Ok(()) => info!(user_id = %user_id, "WebSocket 会话已结束"),
        Err(err) => warn!(user_id = %user_id, error = %err, "WebSocket 会话异常结束"),
    }
}

pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
        let (sender, incoming) = socket.split();
        (WsSink { sender }, WsSource { incoming })
    }
}

pub struct WsSink {
    sender: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sender
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|err| TransportError::Failed(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sender.close().await {
            Ok(()) => Ok(()),
            // 对端已经关闭
            Err(err) => {
                debug!(error = %err, "关闭 WebSocket 失败");
                Err(TransportError::Closed)
            }
        }
    }
}

pub struct WsSource {
    incoming: SplitStream<WebSocket>,
}

#[async_trait]
impl TransportSource for WsSource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(message) = self.incoming.next().await {
            match message {
                Ok(WsMessage::Text(text)) => return Ok(Some(text.to_string())),
                Ok(WsMessage::Close(_)) => {
                    debug!("WebSocket 收到关闭帧");
                    return Ok(None);
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Binary(_)) => {
                    debug!("忽略二进制帧");
                }
                Err(err) => return Err(TransportError::Failed(err.to_string())),
            }
        }
        Ok(None)
    }
}
