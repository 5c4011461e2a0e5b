mod negotiation;
mod state;
mod tasks;

pub use negotiation::NegotiationRole;
pub use state::PeerState;

use core_types::{
    DataChannelOptions, FrameSink, FrameSource, MediaConfig, PeerError, PeerInfo, RtcEngine,
    SharedFrameSink, SharedFrameSource, Signal, SignalingMessage,
};
use negotiation::negotiate;
use serde_json::Value;
use signaling::{compose_url, SignalingConnector};
use state::StateCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasks::{run_disconnect, ConnectionShared, SharedSignaling, SkipTask};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// get_peers／ペアリング確認の応答待ちタイムアウト
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// recv()のポーリング間隔
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 受信データハンドラ。登録順に同期呼び出しされる
pub type DataHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Peerの構成
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// シグナリングサーバーのURL（ws:// または wss://）
    pub server_address: String,
    /// ピア種別タグ（検索用の自由形式。initiator/responderの役割ではない）
    pub peer_type: String,
    /// ピアID。未指定ならサーバーが割り当てる
    pub id: Option<String>,
    /// サーバー検証用のキー
    pub key: Option<String>,
    pub datachannel: DataChannelOptions,
    pub media: MediaConfig,
}

impl PeerConfig {
    pub fn new(server_address: impl Into<String>, peer_type: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            peer_type: peer_type.into(),
            id: None,
            key: None,
            datachannel: DataChannelOptions::default(),
            media: MediaConfig::default(),
        }
    }
}

/// 接続ライフサイクルの状態機械
///
/// シグナリング接続とトランスポートエンジンのセッションを排他的に所有し、
/// 交渉・バックグラウンドタスク・切断プロトコルを統括する。
pub struct Peer {
    id: String,
    url: String,
    config: PeerConfig,
    state: Arc<StateCell>,
    connector: Box<dyn SignalingConnector>,
    engine: Arc<dyn RtcEngine>,
    signaling: Option<SharedSignaling>,
    shared: Option<Arc<ConnectionShared>>,
    done_rx: Option<watch::Receiver<bool>>,
    handlers: Arc<Mutex<Vec<DataHandler>>>,
    inbox: Arc<Mutex<Option<Value>>>,
    source: Option<SharedFrameSource>,
    sink: Option<SharedFrameSink>,
}

impl Peer {
    pub fn new(
        config: PeerConfig,
        connector: Box<dyn SignalingConnector>,
        engine: Arc<dyn RtcEngine>,
    ) -> Self {
        let url = compose_url(
            &config.server_address,
            &config.peer_type,
            config.id.as_deref(),
            config.key.as_deref(),
        );
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| config.peer_type.clone());
        Self {
            id: id.clone(),
            url,
            state: Arc::new(StateCell::new(id)),
            connector,
            engine,
            signaling: None,
            shared: None,
            done_rx: None,
            handlers: Arc::new(Mutex::new(Vec::new())),
            inbox: Arc::new(Mutex::new(None)),
            source: None,
            sink: None,
            config,
        }
    }

    /// 送出ビデオのフレームソースを設定する（接続前に呼ぶこと）
    pub fn set_frame_source(&mut self, source: Box<dyn FrameSource>) {
        self.source = Some(Arc::new(tokio::sync::Mutex::new(source)));
    }

    /// 受信ビデオのフレームシンクを設定する（接続前に呼ぶこと）
    pub fn set_frame_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sink = Some(Arc::new(tokio::sync::Mutex::new(sink)));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    /// シグナリングサーバーへの接続を確立する
    pub async fn open(&mut self) -> Result<(), PeerError> {
        self.ensure_state(PeerState::Starting, "open")?;
        let connection = self.connector.connect(&self.url).await?;
        self.signaling = Some(Arc::new(tokio::sync::Mutex::new(connection)));
        self.state.set(PeerState::Online);
        Ok(())
    }

    /// シグナリング接続とリモートピアとの接続を全て閉じる（冪等）
    pub async fn close(&mut self) -> Result<(), PeerError> {
        if self.state.get() == PeerState::Closed {
            return Ok(());
        }
        if matches!(
            self.state.get(),
            PeerState::Connecting | PeerState::Connected | PeerState::Disconnecting
        ) {
            if let Some(shared) = self.shared.clone() {
                if let Err(e) = run_disconnect(&shared, None, SkipTask::None).await {
                    warn!("Disconnect during close failed: {}", e);
                }
            }
            // 中継タスク側が先に解体を始めていた場合はその完了を待つ。
            // 待たずにシグナリングを閉じると解体側のOnline遷移と競合する
            self.wait_disconnected().await;
        }
        if self.state.get() == PeerState::Closed {
            return Ok(());
        }
        self.state.set(PeerState::Closing);
        if let Some(signaling) = &self.signaling {
            if let Err(e) = signaling.lock().await.close().await {
                warn!("Failed to close signaling connection: {}", e);
            }
        }
        self.state.set(PeerState::Closed);
        Ok(())
    }

    /// サーバーに接続中のピア一覧を取得する
    pub async fn get_peers(&mut self) -> Result<Vec<PeerInfo>, PeerError> {
        self.ensure_state(PeerState::Online, "get_peers")?;
        let signaling = self.signaling()?;
        let reply = async {
            let mut conn = signaling.lock().await;
            conn.send(&SignalingMessage::from(Signal::ListPeers)).await?;
            conn.recv(Some(RESPONSE_TIMEOUT)).await
        }
        .await;
        match reply {
            Ok(SignalingMessage::Signal(Signal::Peers { peers })) => Ok(peers),
            Ok(other) => Err(PeerError::Protocol(format!(
                "expected peers from server, got {other:?}"
            ))),
            Err(e) => Err(self.fail_with(e).await),
        }
    }

    /// リモートピアとのペアリングを要求し、Responderとして交渉する
    pub async fn connect_to(&mut self, remote_peer_id: &str) -> Result<(), PeerError> {
        self.ensure_state(PeerState::Online, "connect_to")?;
        let signaling = self.signaling()?;
        let reply = async {
            let mut conn = signaling.lock().await;
            conn.send(&SignalingMessage::from(Signal::Pair {
                remote_peer_id: remote_peer_id.to_string(),
            }))
            .await?;
            conn.recv(Some(RESPONSE_TIMEOUT)).await
        }
        .await;
        match reply {
            Ok(SignalingMessage::Signal(Signal::Error { message })) => {
                return Err(PeerError::Server(message));
            }
            Ok(SignalingMessage::Signal(Signal::Status { status, .. })) => {
                if status != core_types::PairStatus::Paired {
                    return Err(PeerError::Pairing("cannot pair with peer".to_string()));
                }
            }
            Ok(other) => {
                return Err(PeerError::Protocol(format!(
                    "expected status from server, got {other:?}"
                )));
            }
            Err(e) => return Err(self.fail_with(e).await),
        }
        self.state.set(PeerState::Connecting);
        self.start_session(NegotiationRole::Responder).await
    }

    /// 着信接続を待つ。ペアリング成立まで無期限にブロックする
    ///
    /// 成立したらConnectingに遷移してリモートピアのIDを返す。
    pub async fn listen_connections(&mut self) -> Result<String, PeerError> {
        self.ensure_state(PeerState::Online, "listen_connections")?;
        let signaling = self.signaling()?;
        {
            let mut conn = signaling.lock().await;
            if let Err(e) = conn.send(&SignalingMessage::from(Signal::Ready)).await {
                drop(conn);
                return Err(self.fail_with(e).await);
            }
        }
        self.state.set(PeerState::Listening);
        let remote_peer_id = loop {
            let signal = signaling.lock().await.recv(None).await;
            match signal {
                Ok(SignalingMessage::Signal(Signal::Status {
                    status: core_types::PairStatus::Paired,
                    remote_peer_id,
                })) => break remote_peer_id,
                Ok(other) => {
                    warn!("Expected paired status from server, got {:?}", other);
                }
                Err(e) => return Err(self.fail_with(e).await),
            }
        };
        let remote_peer_id = remote_peer_id.ok_or_else(|| {
            PeerError::Protocol("paired status without remotePeerId".to_string())
        })?;
        self.state.set(PeerState::Connecting);
        Ok(remote_peer_id)
    }

    /// 着信接続を受け入れ、Initiatorとして交渉する
    pub async fn accept_connection(&mut self) -> Result<(), PeerError> {
        self.ensure_state(PeerState::Connecting, "accept_connection")?;
        self.start_session(NegotiationRole::Initiator).await
    }

    /// DataChannel経由でJSON値を送る
    ///
    /// チャネルが開いていなければ黙って捨てる（仕様上のベストエフォート）。
    pub async fn send(&self, data: &Value) -> Result<(), PeerError> {
        self.ensure_state(PeerState::Connected, "send")?;
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        if !shared.dc_open.load(Ordering::Relaxed) {
            debug!("Data channel not open, message dropped");
            return Ok(());
        }
        let text = serde_json::to_string(data)
            .map_err(|e| PeerError::Protocol(format!("failed to encode data message: {e}")))?;
        shared.session.lock().await.send_text(&text).await
    }

    /// リモートピアからのメッセージを1件受け取る
    ///
    /// 受信インボックスは1スロットで、登録ハンドラと同じ配送を消費する。
    /// ハンドラ併用時に両方へ届く保証はない点に注意。
    pub async fn recv(&self) -> Result<Value, PeerError> {
        self.ensure_state(PeerState::Connected, "recv")?;
        loop {
            if let Some(value) = self.inbox.lock().unwrap().take() {
                return Ok(value);
            }
            let state = self.state.get();
            if state != PeerState::Connected {
                return Err(PeerError::invalid_state("recv", state));
            }
            sleep(RECV_POLL_INTERVAL).await;
        }
    }

    /// 受信データハンドラを登録する
    pub fn add_data_handler(&self, handler: DataHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// 登録済みハンドラを削除する（同一Arcを渡すこと）
    pub fn remove_data_handler(&self, handler: &DataHandler) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    /// リモートピアとの接続を終了する
    ///
    /// Connecting|Connected 以外では何もしない。全バックグラウンド
    /// タスクの停止を待ってからセッションを閉じ、シグナリングが
    /// 生きていればOnlineへ戻る。
    pub async fn disconnect(&mut self) -> Result<(), PeerError> {
        let Some(shared) = self.shared.clone() else {
            return Ok(());
        };
        run_disconnect(&shared, None, SkipTask::None).await
    }

    /// アクティブな接続が終了するまで待つ
    pub async fn wait_disconnected(&mut self) {
        let Some(done_rx) = &mut self.done_rx else {
            return;
        };
        let _ = done_rx.wait_for(|done| *done).await;
    }

    fn ensure_state(&self, expected: PeerState, op: &'static str) -> Result<(), PeerError> {
        let state = self.state.get();
        if state == expected {
            Ok(())
        } else {
            Err(PeerError::invalid_state(op, state))
        }
    }

    fn signaling(&self) -> Result<SharedSignaling, PeerError> {
        self.signaling
            .clone()
            .ok_or_else(|| PeerError::Transport("signaling connection not established".to_string()))
    }

    /// 輸送路エラーなら接続全体を閉じてからエラーを返す
    async fn fail_with(&mut self, error: PeerError) -> PeerError {
        if matches!(error, PeerError::Transport(_)) {
            if let Err(close_err) = self.close().await {
                warn!("close after transport failure failed: {}", close_err);
            }
        }
        error
    }

    async fn start_session(&mut self, role: NegotiationRole) -> Result<(), PeerError> {
        let signaling = self.signaling()?;
        let mut session = self.engine.connect().await?;
        let events = session
            .take_events()
            .ok_or_else(|| PeerError::Engine("engine session has no event stream".to_string()))?;
        let (done_tx, done_rx) = watch::channel(false);
        *self.inbox.lock().unwrap() = None;
        let shared = Arc::new(ConnectionShared {
            state: self.state.clone(),
            signaling,
            session: Arc::new(tokio::sync::Mutex::new(session)),
            relay_task: Mutex::new(None),
            consumer_task: Mutex::new(None),
            monitor_task: Mutex::new(None),
            dc_open: AtomicBool::new(false),
            inbox: self.inbox.clone(),
            handlers: self.handlers.clone(),
            sink: self.sink.clone(),
            done_tx,
        });
        self.shared = Some(shared.clone());
        self.done_rx = Some(done_rx);
        negotiate(
            &shared,
            role,
            self.source.clone(),
            &self.config.datachannel,
            &self.config.media,
            events,
        )
        .await
    }
}
