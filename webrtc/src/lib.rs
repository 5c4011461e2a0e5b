mod session;
mod track;

pub use session::WebRtcSession;

use async_trait::async_trait;
use core_types::{PeerError, RtcEngine, RtcSession};
use webrtc_rs::api::media_engine::MIME_TYPE_H264;

/// webrtc-rsエンジンの設定
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// STUN/TURNサーバーのURL。空ならホスト候補のみ
    pub ice_servers: Vec<String>,
    /// 同一ホスト内接続のためループバック候補を含めるか
    pub include_loopback: bool,
    /// 送出トラックのMIMEタイプ
    pub video_mime_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback: true,
            video_mime_type: MIME_TYPE_H264.to_string(),
        }
    }
}

/// webrtc-rsによるトランスポートエンジン実装
///
/// 接続試行ごとに使い捨てのWebRtcSessionを生成する。
#[derive(Debug, Default)]
pub struct WebRtcEngine {
    config: EngineConfig,
}

impl WebRtcEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn connect(&self) -> Result<Box<dyn RtcSession>, PeerError> {
        let session = WebRtcSession::connect(&self.config).await?;
        Ok(Box::new(session))
    }
}
