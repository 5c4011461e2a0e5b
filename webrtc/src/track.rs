use async_trait::async_trait;
use bytes::Bytes;
use core_types::{Frame, MediaConfig, PeerError, RemoteTrack, SharedFrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};
use webrtc_rs::media::Sample;
use webrtc_rs::peer_connection::RTCPeerConnection;
use webrtc_rs::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc_rs::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc_rs::track::track_local::TrackLocal;
use webrtc_rs::track::track_remote::TrackRemote;

/// デフォルトのフレーム間隔（フレームレート未指定時のサンプル時間）
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

/// 送出トラックを作り、フレームソースから書き込むタスクを起動する
///
/// ICE/DTLSが確立するまで送出は保留する。
pub(crate) async fn spawn_track_writer(
    pc: &Arc<RTCPeerConnection>,
    mime_type: &str,
    source: SharedFrameSource,
    config: &MediaConfig,
    connection_ready: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, PeerError> {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        },
        "video".to_string(),
        "stream".to_string(),
    ));

    let sender = pc
        .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| PeerError::Engine(format!("add track: {e}")))?;

    // RTCPをドレインするループ（NACK等を確実に処理）。pc closeで終了する
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        debug!("RTCP drain loop finished");
    });

    let interval = config
        .frame_rate
        .map(|fps| Duration::from_secs_f64(1.0 / fps));
    let duration = interval.unwrap_or(DEFAULT_FRAME_DURATION);

    Ok(tokio::spawn(async move {
        loop {
            if !connection_ready.load(Ordering::Relaxed) {
                sleep(Duration::from_millis(50)).await;
                continue;
            }
            let frame = { source.lock().await.next_frame().await };
            match frame {
                Ok(frame) => {
                    let sample = Sample {
                        data: Bytes::from(frame.data),
                        duration,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        warn!("Failed to write sample to track: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Frame source ended: {}", e);
                    break;
                }
            }
            if let Some(interval) = interval {
                sleep(interval).await;
            }
        }
    }))
}

/// リモートトラックのRTPペイロードを不透明フレームとして渡すラッパ
///
/// デコードはスコープ外のため、幅・高さは持たない。
pub(crate) struct RemoteRtpTrack {
    track: Arc<TrackRemote>,
}

impl RemoteRtpTrack {
    pub(crate) fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl RemoteTrack for RemoteRtpTrack {
    async fn recv_frame(&mut self) -> Result<Frame, PeerError> {
        let (packet, _attributes) = self
            .track
            .read_rtp()
            .await
            .map_err(|e| PeerError::Engine(format!("remote track read: {e}")))?;
        Ok(Frame {
            width: 0,
            height: 0,
            data: packet.payload.to_vec(),
            timestamp: u64::from(packet.header.timestamp),
        })
    }
}
