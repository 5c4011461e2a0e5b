use crate::{SignalingConnection, SignalingConnector};
use async_trait::async_trait;
use core_types::{PeerError, SignalingMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocketによるシグナリング接続
pub struct WsConnection {
    write: SplitSink<WsStream, WsMessage>,
    read: SplitStream<WsStream>,
    open: bool,
}

/// WebSocketコネクタ
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingConnection>, PeerError> {
        // 不正なURLは接続前に弾く
        Url::parse(url).map_err(|e| PeerError::Transport(format!("invalid url {url:?}: {e}")))?;

        info!("Connecting to signaling server: {}", url);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| PeerError::Transport(format!("websocket connect failed: {e}")))?;
        info!("Signaling WebSocket connected");

        let (write, read) = ws_stream.split();
        Ok(Box::new(WsConnection {
            write,
            read,
            open: true,
        }))
    }
}

#[async_trait]
impl SignalingConnection for WsConnection {
    async fn send(&mut self, message: &SignalingMessage) -> Result<(), PeerError> {
        if !self.open {
            return Err(PeerError::Transport(
                "websocket closed while sending a signal".to_string(),
            ));
        }
        let json = serde_json::to_string(message)
            .map_err(|e| PeerError::Protocol(format!("failed to encode signal: {e}")))?;
        self.write
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| {
                self.open = false;
                PeerError::Transport(format!("websocket closed while sending a signal: {e}"))
            })
    }

    async fn recv(&mut self, timeout: Option<Duration>) -> Result<SignalingMessage, PeerError> {
        if let Some(limit) = timeout {
            match tokio::time::timeout(limit, self.recv_inner()).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout),
            }
        } else {
            self.recv_inner().await
        }
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Err(e) = self.write.send(WsMessage::Close(None)).await {
            debug!("Close frame not delivered: {}", e);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl WsConnection {
    async fn recv_inner(&mut self) -> Result<SignalingMessage, PeerError> {
        loop {
            let msg = match self.read.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    self.open = false;
                    return Err(PeerError::Transport(format!(
                        "websocket closed while waiting for a signal: {e}"
                    )));
                }
                None => {
                    self.open = false;
                    return Err(PeerError::Transport(
                        "websocket closed while waiting for a signal".to_string(),
                    ));
                }
            };
            match msg {
                WsMessage::Text(text) => {
                    debug!("Received signal: {}", text);
                    return serde_json::from_str::<SignalingMessage>(&text).map_err(|e| {
                        warn!("Failed to parse signal: {}", e);
                        PeerError::Protocol(format!("received an invalid json signal: {e}"))
                    });
                }
                WsMessage::Close(_) => {
                    info!("WebSocket closed by server");
                    self.open = false;
                    return Err(PeerError::Transport(
                        "websocket closed while waiting for a signal".to_string(),
                    ));
                }
                other => {
                    debug!("Ignoring non-text websocket message: {:?}", other);
                }
            }
        }
    }
}
