use crate::{CandidatePayload, PeerError};

/// SDP candidate行を解析したICE candidate
///
/// フォーマット: candidate:<foundation> <component> <protocol> <priority>
/// <address> <port> typ <type> [raddr <addr>] [rport <port>] [tcptype <t>]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: String,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub tcp_type: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub sdp_mid: Option<String>,
    /// 解析前のcandidate行（テキスト形式を受け取るエンジン向け）
    pub raw: String,
}

impl IceCandidate {
    pub fn from_sdp_line(
        line: &str,
        sdp_mline_index: Option<u16>,
        sdp_mid: Option<String>,
    ) -> Result<Self, PeerError> {
        let body = line.trim().strip_prefix("candidate:").unwrap_or(line.trim());
        let tokens: Vec<&str> = body.split_whitespace().collect();
        if tokens.len() < 8 || tokens[6] != "typ" {
            return Err(PeerError::Protocol(format!(
                "malformed candidate line: {line:?}"
            )));
        }

        let parse_err = |field: &str| PeerError::Protocol(format!("bad candidate {field}: {line:?}"));

        let mut candidate = Self {
            foundation: tokens[0].to_string(),
            component: tokens[1].parse().map_err(|_| parse_err("component"))?,
            protocol: tokens[2].to_ascii_lowercase(),
            priority: tokens[3].parse().map_err(|_| parse_err("priority"))?,
            address: tokens[4].to_string(),
            port: tokens[5].parse().map_err(|_| parse_err("port"))?,
            kind: tokens[7].to_string(),
            related_address: None,
            related_port: None,
            tcp_type: None,
            sdp_mline_index,
            sdp_mid,
            raw: line.trim().to_string(),
        };

        // 以降は key value のペア。未知のキー（generation等）は読み飛ばす
        let mut rest = tokens[8..].chunks_exact(2);
        for pair in &mut rest {
            match pair[0] {
                "raddr" => candidate.related_address = Some(pair[1].to_string()),
                "rport" => {
                    candidate.related_port = Some(pair[1].parse().map_err(|_| parse_err("rport"))?)
                }
                "tcptype" => candidate.tcp_type = Some(pair[1].to_string()),
                _ => {}
            }
        }

        Ok(candidate)
    }

    pub fn from_payload(payload: &CandidatePayload) -> Result<Self, PeerError> {
        Self::from_sdp_line(
            &payload.candidate,
            payload.sdp_mline_index,
            payload.sdp_mid.clone(),
        )
    }

    /// candidate行のテキスト形式に戻す
    pub fn to_sdp_line(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.kind
        );
        if let Some(ref raddr) = self.related_address {
            line.push_str(&format!(" raddr {raddr}"));
        }
        if let Some(rport) = self.related_port {
            line.push_str(&format!(" rport {rport}"));
        }
        if let Some(ref tcp_type) = self.tcp_type {
            line.push_str(&format!(" tcptype {tcp_type}"));
        }
        line
    }
}
