mod client;

pub use client::{WsConnection, WsConnector};

use async_trait::async_trait;
use core_types::{PeerError, SignalingMessage};
use std::time::Duration;

/// シグナリングサーバーとの双方向チャネル
///
/// 1つのPeerが排他的に所有する。recvはタイムアウト付き／なしの両方に対応。
#[async_trait]
pub trait SignalingConnection: Send {
    async fn send(&mut self, message: &SignalingMessage) -> Result<(), PeerError>;
    async fn recv(&mut self, timeout: Option<Duration>) -> Result<SignalingMessage, PeerError>;
    async fn close(&mut self) -> Result<(), PeerError>;
    fn is_open(&self) -> bool;
}

/// シグナリング接続の確立手段（本番はWebSocket、テストはインメモリ）
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingConnection>, PeerError>;
}

/// 接続URLを構成する: `<server>/<peer-type>[/<id>[/<key>]]`
pub fn compose_url(server_address: &str, peer_type: &str, id: Option<&str>, key: Option<&str>) -> String {
    let mut url = format!("{}/{}", server_address.trim_end_matches('/'), peer_type);
    if let Some(id) = id {
        url.push('/');
        url.push_str(id);
        if let Some(key) = key {
            url.push('/');
            url.push_str(key);
        }
    }
    url
}
