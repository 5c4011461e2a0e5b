use crate::state::PeerState;
use crate::tasks::{monitor_consumer, relay_loop, ConnectionShared};
use core_types::{
    DataChannelOptions, EngineEvent, MediaConfig, PeerError, SdpKind, SessionDescription,
    SharedFrameSource, Signal, SignalingMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::info;

/// 交渉時の役割
///
/// 命名と逆に見えるが、listenした側がDataChannelとofferを作り、
/// connect_toした側がanswerを返す。既存のシグナリングサーバー仕様との
/// 相互運用に必要な非対称性なのでここで明示しておく。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// DataChannelとofferを作る側（accept_connection）
    Initiator,
    /// offerを待ってanswerを返す側（connect_to）
    Responder,
}

/// 1回の接続試行の交渉を実行する
///
/// 失敗はリトライせず呼び出し元へ伝播する。呼び出し元は
/// disconnect/closeで後始末する責任を持つ。
pub(crate) async fn negotiate(
    shared: &Arc<ConnectionShared>,
    role: NegotiationRole,
    source: Option<SharedFrameSource>,
    dc_options: &DataChannelOptions,
    media: &MediaConfig,
    events: mpsc::Receiver<EngineEvent>,
) -> Result<(), PeerError> {
    if let Some(source) = source {
        shared.session.lock().await.add_track(source, media).await?;
        info!("Video frame source track added");
    }

    match role {
        NegotiationRole::Initiator => {
            info!("Initiating peer connection...");
            let offer = {
                let mut session = shared.session.lock().await;
                session.create_data_channel(dc_options).await?;
                session.create_offer().await?
            };
            send_signal(shared, Signal::Offer { sdp: offer.sdp }).await?;

            let reply = shared.signaling.lock().await.recv(None).await?;
            match reply {
                SignalingMessage::Signal(Signal::Answer { sdp }) => {
                    shared
                        .session
                        .lock()
                        .await
                        .set_remote_description(SessionDescription {
                            kind: SdpKind::Answer,
                            sdp,
                        })
                        .await?;
                }
                other => {
                    return Err(PeerError::Protocol(format!(
                        "expected answer from remote peer, got {other:?}"
                    )));
                }
            }
        }
        NegotiationRole::Responder => {
            info!("Waiting for peer connection...");
            let reply = shared.signaling.lock().await.recv(None).await?;
            match reply {
                SignalingMessage::Signal(Signal::Offer { sdp }) => {
                    shared
                        .session
                        .lock()
                        .await
                        .set_remote_description(SessionDescription {
                            kind: SdpKind::Offer,
                            sdp,
                        })
                        .await?;
                }
                other => {
                    return Err(PeerError::Protocol(format!(
                        "expected offer from remote peer, got {other:?}"
                    )));
                }
            }
            let answer = shared.session.lock().await.create_answer().await?;
            send_signal(shared, Signal::Answer { sdp: answer.sdp }).await?;
        }
    }

    info!("starting candidate relay task...");
    let relay = tokio::spawn(relay_loop(shared.clone(), events));
    *shared.relay_task.lock().unwrap() = Some(relay);

    // 交渉完了（DataChannel open または ICE completed）を待つ。
    // 中継タスクが先に死んだ場合はその結果を引き取って返す。
    while shared.state.get() == PeerState::Connecting {
        let relay_finished = shared
            .relay_task
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |handle| handle.is_finished());
        if relay_finished {
            let handle = shared.relay_task.lock().unwrap().take();
            if let Some(handle) = handle {
                match handle.await {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(PeerError::TaskFault(e.to_string())),
                }
            }
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    let has_consumer = shared.consumer_task.lock().unwrap().is_some();
    if has_consumer {
        info!("starting track consumer monitor task...");
        let monitor = tokio::spawn(monitor_consumer(shared.clone()));
        *shared.monitor_task.lock().unwrap() = Some(monitor);
    }

    Ok(())
}

async fn send_signal(shared: &Arc<ConnectionShared>, signal: Signal) -> Result<(), PeerError> {
    shared
        .signaling
        .lock()
        .await
        .send(&SignalingMessage::from(signal))
        .await
}
