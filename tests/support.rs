#![allow(dead_code)]

use async_trait::async_trait;
use core_types::{
    DataChannelOptions, EngineEvent, Frame, FrameSink, FrameSource, IceCandidate,
    IceConnectionState, MediaConfig, PairStatus, PeerError, PeerInfo, RemoteTrack, RtcEngine,
    RtcSession, SdpKind, SessionDescription, SharedFrameSource, Signal, SignalingMessage,
};
use peer::{Peer, PeerConfig, PeerState};
use signaling::{SignalingConnection, SignalingConnector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// インメモリのシグナリングブローカー

struct BrokerPeer {
    peer_type: String,
    busy: bool,
    listening: bool,
    partner: Option<String>,
    to_client: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct BrokerInner {
    peers: HashMap<String, BrokerPeer>,
    counter: usize,
}

/// テスト用シグナリングサーバー（本物と同じpair/ready/listPeersの挙動）
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接続中のクライアントへメッセージを直接流し込む
    pub fn inject(&self, peer_id: &str, message: SignalingMessage) {
        let inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get(peer_id) {
            let _ = peer.to_client.send(message);
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().peers.keys().cloned().collect()
    }

    fn register(
        &self,
        peer_type: String,
        id: Option<String>,
        to_client: mpsc::UnboundedSender<SignalingMessage>,
    ) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let id = id.unwrap_or_else(|| format!("{}-{}", peer_type, inner.counter));
        inner.peers.insert(
            id.clone(),
            BrokerPeer {
                peer_type,
                busy: false,
                listening: false,
                partner: None,
                to_client,
            },
        );
        id
    }

    fn spawn_peer_task(&self, id: String, mut rx: mpsc::UnboundedReceiver<SignalingMessage>) {
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                broker.handle(&id, message);
            }
            broker.depart(&id);
        });
    }

    fn handle(&self, from: &str, message: SignalingMessage) {
        match message {
            SignalingMessage::Signal(Signal::ListPeers) => {
                let inner = self.inner.lock().unwrap();
                let peers = inner
                    .peers
                    .iter()
                    .map(|(id, peer)| PeerInfo {
                        id: id.clone(),
                        peer_type: peer.peer_type.clone(),
                        busy: peer.busy,
                    })
                    .collect();
                if let Some(peer) = inner.peers.get(from) {
                    let _ = peer.to_client.send(Signal::Peers { peers }.into());
                }
            }
            SignalingMessage::Signal(Signal::Ready) => {
                // 再listenは前回のペアリングを破棄して待ち受けに戻る
                let mut inner = self.inner.lock().unwrap();
                if let Some(peer) = inner.peers.get_mut(from) {
                    peer.listening = true;
                    peer.busy = false;
                    peer.partner = None;
                }
            }
            SignalingMessage::Signal(Signal::Pair { remote_peer_id }) => {
                self.pair(from, &remote_peer_id);
            }
            SignalingMessage::Signal(Signal::Offer { .. })
            | SignalingMessage::Signal(Signal::Answer { .. })
            | SignalingMessage::Candidate { .. } => {
                self.forward(from, message);
            }
            other => {
                warn!("broker ignoring message from {}: {:?}", from, other);
            }
        }
    }

    fn pair(&self, from: &str, remote: &str) {
        let mut inner = self.inner.lock().unwrap();
        let available = inner
            .peers
            .get(remote)
            .map_or(false, |peer| peer.listening && !peer.busy);
        if !available {
            if let Some(peer) = inner.peers.get(from) {
                let _ = peer.to_client.send(
                    Signal::Error {
                        message: format!("remote peer {remote} is not available"),
                    }
                    .into(),
                );
            }
            return;
        }
        if let Some(peer) = inner.peers.get_mut(from) {
            peer.busy = true;
            peer.partner = Some(remote.to_string());
            let _ = peer.to_client.send(
                Signal::Status {
                    status: PairStatus::Paired,
                    remote_peer_id: Some(remote.to_string()),
                }
                .into(),
            );
        }
        if let Some(peer) = inner.peers.get_mut(remote) {
            peer.busy = true;
            peer.listening = false;
            peer.partner = Some(from.to_string());
            let _ = peer.to_client.send(
                Signal::Status {
                    status: PairStatus::Paired,
                    remote_peer_id: Some(from.to_string()),
                }
                .into(),
            );
        }
    }

    fn forward(&self, from: &str, message: SignalingMessage) {
        let inner = self.inner.lock().unwrap();
        let partner = inner.peers.get(from).and_then(|peer| peer.partner.clone());
        let Some(partner) = partner else {
            debug!("broker dropping message from unpaired peer {}", from);
            return;
        };
        if let Some(peer) = inner.peers.get(&partner) {
            let _ = peer.to_client.send(message);
        }
    }

    fn depart(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let partner = inner.peers.remove(id).and_then(|peer| peer.partner);
        if let Some(partner) = partner {
            if let Some(peer) = inner.peers.get_mut(&partner) {
                peer.busy = false;
                peer.partner = None;
                let _ = peer.to_client.send(
                    Signal::Status {
                        status: PairStatus::Unpaired,
                        remote_peer_id: None,
                    }
                    .into(),
                );
            }
        }
    }
}

/// ブローカーに接続するインメモリコネクタ
pub struct MemoryConnector {
    broker: Broker,
}

impl MemoryConnector {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingConnection>, PeerError> {
        let path = url
            .strip_prefix("mem://server/")
            .ok_or_else(|| PeerError::Transport(format!("unknown server address: {url}")))?;
        let mut segments = path.split('/');
        let peer_type = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PeerError::Transport("missing peer type in url".to_string()))?
            .to_string();
        let id = segments.next().map(str::to_string);
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
        let id = self.broker.register(peer_type, id, to_client_tx);
        self.broker.spawn_peer_task(id, from_client_rx);
        Ok(Box::new(MemorySignaling {
            tx: Some(from_client_tx),
            rx: to_client_rx,
            open: true,
        }))
    }
}

struct MemorySignaling {
    tx: Option<mpsc::UnboundedSender<SignalingMessage>>,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    open: bool,
}

#[async_trait]
impl SignalingConnection for MemorySignaling {
    async fn send(&mut self, message: &SignalingMessage) -> Result<(), PeerError> {
        let Some(tx) = &self.tx else {
            return Err(PeerError::Transport("connection closed".to_string()));
        };
        tx.send(message.clone())
            .map_err(|_| PeerError::Transport("broker is gone".to_string()))
    }

    async fn recv(&mut self, timeout: Option<Duration>) -> Result<SignalingMessage, PeerError> {
        let received = match timeout {
            Some(duration) => tokio::time::timeout(duration, self.rx.recv())
                .await
                .map_err(|_| PeerError::Timeout)?,
            None => self.rx.recv().await,
        };
        received.ok_or_else(|| {
            self.open = false;
            PeerError::Transport("connection closed by broker".to_string())
        })
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        // 送信側を落とすとブローカーが切断を検知して相手にunpairedを流す
        self.tx = None;
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// 何も応答しないサーバー（タイムアウト系のテスト用）
pub struct SilentConnector;

#[async_trait]
impl SignalingConnector for SilentConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn SignalingConnection>, PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(SilentSignaling {
            _tx: tx,
            rx,
            open: true,
        }))
    }
}

struct SilentSignaling {
    // 保持しておかないとrecvが即座にクローズ扱いになる
    _tx: mpsc::UnboundedSender<SignalingMessage>,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    open: bool,
}

#[async_trait]
impl SignalingConnection for SilentSignaling {
    async fn send(&mut self, _message: &SignalingMessage) -> Result<(), PeerError> {
        Ok(())
    }

    async fn recv(&mut self, timeout: Option<Duration>) -> Result<SignalingMessage, PeerError> {
        match timeout {
            Some(duration) => {
                sleep(duration).await;
                Err(PeerError::Timeout)
            }
            None => {
                let received = self.rx.recv().await;
                received.ok_or_else(|| PeerError::Transport("connection closed".to_string()))
            }
        }
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ---------------------------------------------------------------------------
// プロセス内ループバックのトランスポートエンジン

struct PendingOffer {
    initiator_events: mpsc::Sender<EngineEvent>,
    initiator_outgoing: mpsc::UnboundedReceiver<String>,
    initiator_source: Option<SharedFrameSource>,
    initiator_frame_rate: Option<f64>,
}

#[derive(Default)]
struct HubInner {
    pending: HashMap<String, PendingOffer>,
    counter: usize,
    applied_candidates: Vec<IceCandidate>,
}

/// 同一プロセス内のセッション同士をofferトークンで結線するハブ
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// add_ice_candidateでセッションに適用されたcandidate一覧
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().applied_candidates.clone()
    }

    fn register_pending(&self, pending: PendingOffer) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let token = format!("loopback-offer-{}", inner.counter);
        inner.pending.insert(token.clone(), pending);
        token
    }

    fn take_pending(&self, token: &str) -> Result<PendingOffer, PeerError> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .remove(token)
            .ok_or_else(|| PeerError::Engine(format!("no pending offer for {token}")))
    }

    fn record_candidate(&self, candidate: IceCandidate) {
        self.inner.lock().unwrap().applied_candidates.push(candidate);
    }
}

pub struct LoopbackEngine {
    hub: LoopbackHub,
}

impl LoopbackEngine {
    pub fn new(hub: LoopbackHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl RtcEngine for LoopbackEngine {
    async fn connect(&self) -> Result<Box<dyn RtcSession>, PeerError> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Ok(Box::new(LoopbackSession {
            hub: self.hub.clone(),
            events_tx,
            events_rx: Some(events_rx),
            source: None,
            frame_rate: None,
            outgoing: None,
        }))
    }
}

struct LoopbackSession {
    hub: LoopbackHub,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
    source: Option<SharedFrameSource>,
    frame_rate: Option<f64>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl RtcSession for LoopbackSession {
    async fn create_data_channel(
        &mut self,
        _options: &DataChannelOptions,
    ) -> Result<(), PeerError> {
        Ok(())
    }

    async fn add_track(
        &mut self,
        source: SharedFrameSource,
        config: &MediaConfig,
    ) -> Result<(), PeerError> {
        self.source = Some(source);
        self.frame_rate = config.frame_rate;
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(tx);
        let token = self.hub.register_pending(PendingOffer {
            initiator_events: self.events_tx.clone(),
            initiator_outgoing: rx,
            initiator_source: self.source.clone(),
            initiator_frame_rate: self.frame_rate,
        });
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: token,
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "loopback-answer".to_string(),
        })
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        match desc.kind {
            // offerを受けた側（Responder）が両方向の結線を行う
            SdpKind::Offer => {
                let pending = self.hub.take_pending(&desc.sdp)?;
                let (tx, rx) = mpsc::unbounded_channel();
                self.outgoing = Some(tx);
                spawn_message_forward(pending.initiator_outgoing, self.events_tx.clone());
                spawn_message_forward(rx, pending.initiator_events.clone());
                // readyイベントより先にトラックを届けておく
                if let Some(source) = pending.initiator_source {
                    start_frame_pump(
                        source,
                        pending.initiator_frame_rate,
                        self.events_tx.clone(),
                    )
                    .await;
                }
                if let Some(source) = self.source.clone() {
                    start_frame_pump(source, self.frame_rate, pending.initiator_events.clone())
                        .await;
                }
                for events in [&self.events_tx, &pending.initiator_events] {
                    let _ = events.send(EngineEvent::DataChannelOpen).await;
                    let _ = events
                        .send(EngineEvent::IceConnectionState(
                            IceConnectionState::Completed,
                        ))
                        .await;
                }
                Ok(())
            }
            SdpKind::Answer => Ok(()),
        }
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.hub.record_candidate(candidate);
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), PeerError> {
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(text.to_string());
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events_rx.take()
    }

    async fn close(&mut self) -> Result<(), PeerError> {
        // 送信側を落とすと相手側にDataChannelClosedが届く
        self.outgoing = None;
        Ok(())
    }
}

fn spawn_message_forward(
    mut rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<EngineEvent>,
) {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if events
                .send(EngineEvent::DataChannelMessage(text))
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = events.send(EngineEvent::DataChannelClosed).await;
    });
}

async fn start_frame_pump(
    source: SharedFrameSource,
    frame_rate: Option<f64>,
    events: mpsc::Sender<EngineEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let track = LoopbackTrack { rx };
    if events
        .send(EngineEvent::RemoteTrack(Box::new(track)))
        .await
        .is_err()
    {
        return;
    }
    let interval = frame_rate
        .map(|rate| Duration::from_secs_f64(1.0 / rate))
        .unwrap_or_else(|| Duration::from_millis(20));
    tokio::spawn(async move {
        loop {
            let frame = match source.lock().await.next_frame().await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            if tx.send(frame).is_err() {
                return;
            }
            sleep(interval).await;
        }
    });
}

struct LoopbackTrack {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl RemoteTrack for LoopbackTrack {
    async fn recv_frame(&mut self) -> Result<Frame, PeerError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| PeerError::Engine("remote track ended".to_string()))
    }
}

// ---------------------------------------------------------------------------
// フレームソース／シンクのテスト実装

/// 連番タイムスタンプ入りのダミーフレームを無限に生成する
pub struct CountingSource {
    counter: Arc<AtomicU64>,
}

impl CountingSource {
    pub fn new() -> (Self, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        (
            Self {
                counter: counter.clone(),
            },
            counter,
        )
    }
}

#[async_trait]
impl FrameSource for CountingSource {
    async fn next_frame(&mut self) -> Result<Frame, PeerError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(Frame {
            width: 1280,
            height: 720,
            data: vec![0u8; 16],
            timestamp: n,
        })
    }
}

/// 受信フレームを溜め込むシンク。fail_after指定でn枚目以降に失敗させられる
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    fail_after: Option<usize>,
}

impl CollectingSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<Frame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                frames: frames.clone(),
                fail_after: None,
            },
            frames,
        )
    }

    pub fn failing_after(count: usize) -> (Self, Arc<Mutex<Vec<Frame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                frames: frames.clone(),
                fail_after: Some(count),
            },
            frames,
        )
    }
}

#[async_trait]
impl FrameSink for CollectingSink {
    async fn consume(&mut self, frame: Frame) -> Result<(), PeerError> {
        let mut frames = self.frames.lock().unwrap();
        if let Some(limit) = self.fail_after {
            if frames.len() >= limit {
                return Err(PeerError::Engine("sink rejected frame".to_string()));
            }
        }
        frames.push(frame);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ヘルパー

pub fn make_peer(broker: &Broker, hub: &LoopbackHub, peer_type: &str, id: &str) -> Peer {
    let mut config = PeerConfig::new("mem://server", peer_type);
    config.id = Some(id.to_string());
    Peer::new(
        config,
        Box::new(MemoryConnector::new(broker.clone())),
        Arc::new(LoopbackEngine::new(hub.clone())),
    )
}

/// listen側とconnect側を同時に走らせて接続済みのペアを返す
pub async fn connect_pair(mut listener: Peer, mut caller: Peer) -> (Peer, Peer) {
    let listener_id = listener.id().to_string();
    if listener.state() == PeerState::Starting {
        listener.open().await.expect("listener open");
    }
    if caller.state() == PeerState::Starting {
        caller.open().await.expect("caller open");
    }
    let listen_task = tokio::spawn(async move {
        let remote = listener.listen_connections().await.expect("listen");
        listener.accept_connection().await.expect("accept");
        (listener, remote)
    });
    // readyがブローカーに届くのを待ってからペアリングする
    sleep(Duration::from_millis(200)).await;
    caller.connect_to(&listener_id).await.expect("connect_to");
    let (listener, remote) = listen_task.await.expect("listener task");
    assert_eq!(remote, caller.id());
    (listener, caller)
}

/// 指定の状態になるまでポーリングで待つ
pub async fn wait_for_state(peer: &Peer, expected: PeerState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if peer.state() == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}
