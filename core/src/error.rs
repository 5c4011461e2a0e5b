use thiserror::Error;

/// ピア操作のエラー分類
#[derive(Debug, Error)]
pub enum PeerError {
    /// 現在の状態では許可されない操作
    #[error("operation `{op}` not allowed in state {state}")]
    InvalidState { op: &'static str, state: String },
    /// 期限付き待機のタイムアウト（切断エラーとは区別する）
    #[error("server not responding")]
    Timeout,
    /// シグナリング接続が送受信中に閉じた
    #[error("signaling connection closed: {0}")]
    Transport(String),
    /// 不正なJSONや想定外のメッセージ種別
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// シグナリングサーバーが返したエラー
    #[error("signaling server error: {0}")]
    Server(String),
    /// ペアリング失敗（相手が存在しない・busyなど）
    #[error("pairing failed: {0}")]
    Pairing(String),
    /// トランスポートエンジン側のエラー
    #[error("transport engine error: {0}")]
    Engine(String),
    /// バックグラウンドタスクの異常終了
    #[error("background task fault: {0}")]
    TaskFault(String),
}

impl PeerError {
    pub fn invalid_state(op: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            op,
            state: state.to_string(),
        }
    }
}
