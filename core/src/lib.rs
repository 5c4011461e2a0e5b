mod candidate;
mod engine;
mod error;
mod signal;

pub use candidate::IceCandidate;
pub use engine::{
    EngineEvent, FrameSink, FrameSource, IceConnectionState, RemoteTrack, RtcEngine, RtcSession,
    SdpKind, SessionDescription, SharedFrameSink, SharedFrameSource,
};
pub use error::PeerError;
pub use signal::{CandidatePayload, PairStatus, PeerInfo, Signal, SignalingMessage};

/// ビデオフレーム（中身のフォーマットは関知しない不透明バッファ）
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub timestamp: u64,
}

/// DataChannel作成時のオプション
#[derive(Debug, Clone)]
pub struct DataChannelOptions {
    pub label: String,
    pub ordered: bool,
    /// max_packet_life_time と max_retransmits はどちらか一方のみ有効
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: String,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            label: "data_channel".to_string(),
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            protocol: String::new(),
        }
    }
}

/// 送出トラックの設定
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    /// 固定フレームレート（未指定ならソースのペースに任せる）
    pub frame_rate: Option<f64>,
}
