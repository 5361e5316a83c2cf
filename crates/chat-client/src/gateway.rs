//! Realtime gateway client.
//!
//! Owns a WebSocket connection to the chat gateway, forwards inbound frames
//! to the runtime, and retries transient losses with the bounded reconnect
//! policy. Auth rejections are terminal: the loop stops instead of retrying.

use chat_core::{ChatError, ChatErrorCategory, ReconnectDecision, ReconnectPolicy, classify_http_status};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite,
    tungstenite::Message as WsMessage,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::wire::{ClientFrame, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Notifications from the gateway task to the runtime.
#[derive(Debug)]
pub enum GatewayNotice {
    /// Handshake finished; the channel is live.
    Connected,
    /// Connection lost; retrying with the given one-based attempt number.
    Reconnecting { attempt: u32 },
    /// Inbound server frame.
    Frame(ServerFrame),
    /// The loop ended. `error` is `None` for an explicit shutdown.
    Stopped { error: Option<ChatError> },
}

/// Handle owned by the runtime for one gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    outbound: mpsc::Sender<ClientFrame>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    /// Queue a frame for emission; returns `false` when the task is gone.
    pub async fn send(&self, frame: ClientFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Tear the connection down; no further frames are delivered after the
    /// task observes the cancellation.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Spawn the gateway task for one authenticated connection.
pub fn spawn_gateway(
    url: Url,
    session_token: String,
    policy: ReconnectPolicy,
    notices: mpsc::Sender<GatewayNotice>,
) -> GatewayHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let child = cancel.child_token();

    tokio::spawn(run_gateway(
        url,
        session_token,
        policy,
        notices,
        outbound_rx,
        child,
    ));

    GatewayHandle {
        outbound: outbound_tx,
        cancel,
    }
}

enum SocketEnd {
    Cancelled,
    Lost(ChatError),
}

async fn run_gateway(
    url: Url,
    session_token: String,
    policy: ReconnectPolicy,
    notices: mpsc::Sender<GatewayNotice>,
    mut outbound_rx: mpsc::Receiver<ClientFrame>,
    cancel: CancellationToken,
) {
    let connect_url = authenticated_url(&url, &session_token);
    let mut attempt: u32 = 0;

    loop {
        let connect_result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(connect_url.as_str()) => result,
        };

        let error = match connect_result {
            Ok((socket, _response)) => {
                attempt = 0;
                let _ = notices.send(GatewayNotice::Connected).await;
                match drive_socket(socket, &notices, &mut outbound_rx, &cancel).await {
                    SocketEnd::Cancelled => break,
                    SocketEnd::Lost(error) => error,
                }
            }
            Err(err) => map_ws_error(err),
        };

        match policy.decide(attempt, &error) {
            ReconnectDecision::Retry { delay } => {
                attempt += 1;
                tracing::debug!(attempt, ?delay, error = %error, "gateway reconnecting");
                let _ = notices.send(GatewayNotice::Reconnecting { attempt }).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ReconnectDecision::Stop { reason } => {
                tracing::warn!(?reason, error = %error, "gateway giving up");
                let _ = notices
                    .send(GatewayNotice::Stopped { error: Some(error) })
                    .await;
                return;
            }
        }
    }

    let _ = notices.send(GatewayNotice::Stopped { error: None }).await;
}

async fn drive_socket(
    socket: Socket,
    notices: &mpsc::Sender<GatewayNotice>,
    outbound_rx: &mut mpsc::Receiver<ClientFrame>,
    cancel: &CancellationToken,
) -> SocketEnd {
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return SocketEnd::Cancelled;
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return SocketEnd::Cancelled;
                };
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if let Err(err) = sink.send(WsMessage::text(text)).await {
                            return SocketEnd::Lost(map_ws_error(err));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping unserializable client frame");
                    }
                }
            }
            inbound = source.next() => {
                match inbound {
                    None | Some(Ok(WsMessage::Close(_))) => {
                        return SocketEnd::Lost(ChatError::new(
                            ChatErrorCategory::Network,
                            "socket_closed",
                            "gateway closed the connection",
                        ));
                    }
                    Some(Err(err)) => return SocketEnd::Lost(map_ws_error(err)),
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => {
                                let _ = notices.send(GatewayNotice::Frame(frame)).await;
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, "ignoring malformed gateway frame");
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn authenticated_url(url: &Url, session_token: &str) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("token", session_token);
    url
}

fn map_ws_error(err: tungstenite::Error) -> ChatError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            ChatError::new(
                classify_http_status(status),
                "gateway_handshake_rejected",
                format!("gateway handshake failed with HTTP {status}"),
            )
        }
        other => ChatError::new(
            ChatErrorCategory::Network,
            "gateway_transport_error",
            other.to_string(),
        ),
    }
}
