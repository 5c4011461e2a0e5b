use crate::{DataChannelOptions, Frame, IceCandidate, MediaConfig, PeerError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// 複数の接続試行で再利用するためフレームソース／シンクは共有所有にする
pub type SharedFrameSource = Arc<Mutex<Box<dyn FrameSource>>>;
pub type SharedFrameSink = Arc<Mutex<Box<dyn FrameSink>>>;

/// SDPの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// ローカル／リモートのセッション記述（中身は不透明なSDP文字列）
#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// ICE接続状態（エンジンから通知される）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

/// トランスポートエンジンからのイベント通知
///
/// エンジン内部のコールバックは全てこの一本のストリームに直列化される。
pub enum EngineEvent {
    DataChannelOpen,
    DataChannelMessage(String),
    DataChannelClosed,
    DataChannelError(String),
    RemoteTrack(Box<dyn RemoteTrack>),
    IceConnectionState(IceConnectionState),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::DataChannelOpen => write!(f, "DataChannelOpen"),
            EngineEvent::DataChannelMessage(text) => write!(f, "DataChannelMessage({text:?})"),
            EngineEvent::DataChannelClosed => write!(f, "DataChannelClosed"),
            EngineEvent::DataChannelError(err) => write!(f, "DataChannelError({err:?})"),
            EngineEvent::RemoteTrack(_) => write!(f, "RemoteTrack(..)"),
            EngineEvent::IceConnectionState(state) => write!(f, "IceConnectionState({state:?})"),
        }
    }
}

/// 接続試行ごとに使い捨てのセッションを生成するエンジン
#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RtcSession>, PeerError>;
}

/// 1回の接続試行を担うセッション
///
/// SDP・candidateの中身には関知せず、そのままエンジンに渡す。
#[async_trait]
pub trait RtcSession: Send {
    async fn create_data_channel(&mut self, options: &DataChannelOptions)
        -> Result<(), PeerError>;
    async fn add_track(
        &mut self,
        source: SharedFrameSource,
        config: &MediaConfig,
    ) -> Result<(), PeerError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// DataChannelへの送信（ベストエフォート）
    async fn send_text(&mut self, text: &str) -> Result<(), PeerError>;
    /// イベント受信チャネルを取り出す（1回のみ取得可能）
    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>>;
    async fn close(&mut self) -> Result<(), PeerError>;
}

/// 送出フレームの供給源（遅延生成・停止不可の無限列）
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Frame, PeerError>;
}

/// 受信フレームの消費先（1フレームずつ呼ばれる）
#[async_trait]
pub trait FrameSink: Send {
    async fn consume(&mut self, frame: Frame) -> Result<(), PeerError>;
}

/// リモートから届いたトラック
#[async_trait]
pub trait RemoteTrack: Send {
    async fn recv_frame(&mut self) -> Result<Frame, PeerError>;
}
