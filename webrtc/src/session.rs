use crate::track::{RemoteRtpTrack, spawn_track_writer};
use crate::EngineConfig;
use async_trait::async_trait;
use core_types::{
    DataChannelOptions, EngineEvent, IceCandidate, IceConnectionState, MediaConfig, PeerError,
    RtcSession, SdpKind, SessionDescription, SharedFrameSource,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc_rs::api::interceptor_registry::register_default_interceptors;
use webrtc_rs::api::media_engine::MediaEngine;
use webrtc_rs::api::setting_engine::SettingEngine;
use webrtc_rs::api::APIBuilder;
use webrtc_rs::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc_rs::data_channel::data_channel_message::DataChannelMessage as RTCDataChannelMessage;
use webrtc_rs::data_channel::RTCDataChannel;
use webrtc_rs::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc_rs::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc_rs::ice_transport::ice_server::RTCIceServer;
use webrtc_rs::interceptor::registry::Registry;
use webrtc_rs::peer_connection::configuration::RTCConfiguration;
use webrtc_rs::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc_rs::peer_connection::RTCPeerConnection;

/// webrtc-rsによる1接続分のセッション
///
/// コールバックは全てイベントチャネルへ転送するのみで、
/// セッション状態には触らない。
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    config: EngineConfig,
    datachannel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    connection_ready: Arc<AtomicBool>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
    events_tx: mpsc::Sender<EngineEvent>,
    writer_tasks: Vec<JoinHandle<()>>,
}

impl WebRtcSession {
    pub(crate) async fn connect(config: &EngineConfig) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(engine_err("register codecs"))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .map_err(engine_err("register interceptors"))?;

        let mut setting_engine = SettingEngine::default();
        if config.include_loopback {
            setting_engine.set_include_loopback_candidate(true);
        }

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(engine_err("create peer connection"))?,
        );

        let (events_tx, events_rx) = mpsc::channel(100);
        let datachannel = Arc::new(Mutex::new(None));
        let connection_ready = Arc::new(AtomicBool::new(false));

        // ICE接続状態の監視。Connected/Completedで送出許可フラグを立てる
        let tx = events_tx.clone();
        let ready = connection_ready.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx.clone();
            let ready = ready.clone();
            Box::pin(async move {
                let mapped = map_ice_state(state);
                ready.store(
                    matches!(
                        mapped,
                        IceConnectionState::Connected | IceConnectionState::Completed
                    ),
                    Ordering::Relaxed,
                );
                let _ = tx.send(EngineEvent::IceConnectionState(mapped)).await;
            })
        }));

        // サーバープッシュされたDataChannel（Responder側）
        let tx = events_tx.clone();
        let dc_slot = datachannel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let dc_slot = dc_slot.clone();
            Box::pin(async move {
                info!("DataChannel received: {}", dc.label());
                *dc_slot.lock().unwrap() = Some(dc.clone());
                wire_datachannel(&dc, &tx);
                // 受信側ではチャネル到着が接続成立のトリガー
                let _ = tx.send(EngineEvent::DataChannelOpen).await;
            })
        }));

        // リモートトラックの到着通知
        let tx = events_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                info!("Track received: {}", track.kind());
                let _ = tx
                    .send(EngineEvent::RemoteTrack(Box::new(RemoteRtpTrack::new(track))))
                    .await;
            })
        }));

        Ok(Self {
            pc,
            config: config.clone(),
            datachannel,
            connection_ready,
            events_rx: Some(events_rx),
            events_tx,
            writer_tasks: Vec::new(),
        })
    }
}

#[async_trait]
impl RtcSession for WebRtcSession {
    async fn create_data_channel(
        &mut self,
        options: &DataChannelOptions,
    ) -> Result<(), PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_packet_life_time: options.max_packet_life_time,
            max_retransmits: options.max_retransmits,
            protocol: if options.protocol.is_empty() {
                None
            } else {
                Some(options.protocol.clone())
            },
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&options.label, Some(init))
            .await
            .map_err(engine_err("create data channel"))?;
        info!("DataChannel created: {}", options.label);

        let tx = self.events_tx.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EngineEvent::DataChannelOpen).await;
            })
        }));
        wire_datachannel(&dc, &self.events_tx);
        *self.datachannel.lock().unwrap() = Some(dc);
        Ok(())
    }

    async fn add_track(
        &mut self,
        source: SharedFrameSource,
        config: &MediaConfig,
    ) -> Result<(), PeerError> {
        let handle = spawn_track_writer(
            &self.pc,
            &self.config.video_mime_type,
            source,
            config,
            self.connection_ready.clone(),
        )
        .await?;
        self.writer_tasks.push(handle);
        info!("Video track added to peer connection");
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(engine_err("create offer"))?;
        let sdp = self.apply_local_description(offer).await?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(engine_err("create answer"))?;
        let sdp = self.apply_local_description(answer).await?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(engine_err("parse remote description"))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(engine_err("set remote description"))
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        debug!("Adding ICE candidate: {}", candidate.raw);
        let init = RTCIceCandidateInit {
            candidate: candidate.raw.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(engine_err("add ICE candidate"))
    }

    async fn send_text(&mut self, text: &str) -> Result<(), PeerError> {
        let dc = self.datachannel.lock().unwrap().clone();
        let Some(dc) = dc else {
            debug!("No data channel, message dropped");
            return Ok(());
        };
        dc.send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(engine_err("send on data channel"))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events_rx.take()
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        for handle in self.writer_tasks.drain(..) {
            handle.abort();
        }
        self.connection_ready.store(false, Ordering::Relaxed);
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        Ok(())
    }
}

impl WebRtcSession {
    /// LocalDescriptionを設定し、candidate収集完了後のSDPを返す
    ///
    /// クライアント→サーバーのcandidateメッセージは存在しないため、
    /// ローカル候補はSDPに含めて一括で送る。
    async fn apply_local_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<String, PeerError> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(engine_err("set local description"))?;
        let _ = gather_complete.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::Engine("no local description".to_string()))?;
        Ok(local.sdp)
    }
}

/// DataChannelのmessage/close/errorをイベントに転送する
fn wire_datachannel(dc: &Arc<RTCDataChannel>, events_tx: &mpsc::Sender<EngineEvent>) {
    let tx = events_tx.clone();
    dc.on_message(Box::new(move |msg: RTCDataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(EngineEvent::DataChannelMessage(text)).await;
                    }
                    Err(_) => {
                        warn!("Received non-UTF8 data channel message");
                    }
                }
            } else {
                debug!("Ignoring binary data channel message");
            }
        })
    }));

    let tx = events_tx.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(EngineEvent::DataChannelClosed).await;
        })
    }));

    let tx = events_tx.clone();
    dc.on_error(Box::new(move |err| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(EngineEvent::DataChannelError(err.to_string())).await;
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => IceConnectionState::New,
    }
}

fn engine_err(context: &'static str) -> impl Fn(webrtc_rs::Error) -> PeerError {
    move |e| PeerError::Engine(format!("{context}: {e}"))
}
