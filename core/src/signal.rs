use serde::{Deserialize, Serialize};

/// シグナリングサーバーが返すピア情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub peer_type: String,
    pub busy: bool,
}

/// ペアリング状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Paired,
    Unpaired,
}

/// "type" タグ付きのシグナリングメッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    #[serde(rename = "listPeers")]
    ListPeers,
    #[serde(rename = "pair", rename_all = "camelCase")]
    Pair { remote_peer_id: String },
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "peers")]
    Peers { peers: Vec<PeerInfo> },
    #[serde(rename = "status", rename_all = "camelCase")]
    Status {
        status: PairStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_peer_id: Option<String>,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
}

/// ICE candidateメッセージの中身
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
}

/// シグナリングで交換されるメッセージ全体
///
/// candidateメッセージだけは "type" タグを持たないため untagged で包む。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalingMessage {
    Signal(Signal),
    Candidate { candidate: CandidatePayload },
}

impl From<Signal> for SignalingMessage {
    fn from(signal: Signal) -> Self {
        SignalingMessage::Signal(signal)
    }
}
