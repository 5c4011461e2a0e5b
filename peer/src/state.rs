use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Peerの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// 生成直後。シグナリングサーバー未接続
    Starting,
    /// シグナリング接続済みでアイドル
    Online,
    /// readyを宣言して着信待ち
    Listening,
    /// ペアリング済みで交渉中
    Connecting,
    /// データ・メディア経路が利用可能
    Connected,
    /// 交渉済みセッションの解体中
    Disconnecting,
    /// シグナリング接続を閉じている最中
    Closing,
    /// 終了状態。再利用不可
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Starting => "Starting",
            PeerState::Online => "Online",
            PeerState::Listening => "Listening",
            PeerState::Connecting => "Connecting",
            PeerState::Connected => "Connected",
            PeerState::Disconnecting => "Disconnecting",
            PeerState::Closing => "Closing",
            PeerState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// タスク間で共有する状態セル
///
/// Peer本体とバックグラウンドタスクの双方から参照されるため、
/// 遷移は全てここを経由させる。
pub(crate) struct StateCell {
    id: String,
    state: Mutex<PeerState>,
}

impl StateCell {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(PeerState::Starting),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn get(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set(&self, new_state: PeerState) {
        *self.state.lock().unwrap() = new_state;
        info!("Peer ({}) state is {}", self.id, new_state);
    }

    /// Connecting|Connected のときだけ Disconnecting に遷移する
    ///
    /// 切断処理の二重実行を防ぐため、遷移できた呼び出し側だけが
    /// 解体プロトコルを実行する。
    pub(crate) fn begin_disconnect(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            PeerState::Connecting | PeerState::Connected => {
                *state = PeerState::Disconnecting;
                drop(state);
                info!("Peer ({}) state is {}", self.id, PeerState::Disconnecting);
                true
            }
            _ => false,
        }
    }

    /// 交渉完了時の Connecting -> Connected 遷移
    pub(crate) fn promote_connected(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == PeerState::Connecting {
            *state = PeerState::Connected;
            drop(state);
            info!("Peer ({}) state is {}", self.id, PeerState::Connected);
            true
        } else {
            false
        }
    }
}
