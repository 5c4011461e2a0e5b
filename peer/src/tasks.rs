use crate::state::{PeerState, StateCell};
use crate::DataHandler;
use core_types::{
    EngineEvent, IceCandidate, IceConnectionState, PairStatus, PeerError, RemoteTrack, RtcSession,
    SharedFrameSink, Signal, SignalingMessage,
};
use serde_json::Value;
use signaling::SignalingConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub(crate) type SharedSignaling = Arc<tokio::sync::Mutex<Box<dyn SignalingConnection>>>;
pub(crate) type SharedSession = Arc<tokio::sync::Mutex<Box<dyn RtcSession>>>;
pub(crate) type TaskSlot = Mutex<Option<JoinHandle<Result<(), PeerError>>>>;

/// 切断処理を実行中のタスク自身を待たないためのマーカー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipTask {
    None,
    Relay,
    Monitor,
}

/// 1回の接続試行に属する共有リソース一式
///
/// Peer本体と3つのバックグラウンドタスクの双方から参照される。
pub(crate) struct ConnectionShared {
    pub(crate) state: Arc<StateCell>,
    pub(crate) signaling: SharedSignaling,
    pub(crate) session: SharedSession,
    pub(crate) relay_task: TaskSlot,
    pub(crate) consumer_task: TaskSlot,
    pub(crate) monitor_task: TaskSlot,
    pub(crate) dc_open: AtomicBool,
    pub(crate) inbox: Arc<Mutex<Option<Value>>>,
    pub(crate) handlers: Arc<Mutex<Vec<DataHandler>>>,
    pub(crate) sink: Option<SharedFrameSink>,
    pub(crate) done_tx: watch::Sender<bool>,
}

/// candidate中継タスク
///
/// シグナリングメッセージとエンジンイベントを到着順に処理する。
/// Connecting/Connected の間だけ生きる。
pub(crate) async fn relay_loop(
    shared: Arc<ConnectionShared>,
    mut events: mpsc::Receiver<EngineEvent>,
) -> Result<(), PeerError> {
    loop {
        if !matches!(
            shared.state.get(),
            PeerState::Connecting | PeerState::Connected
        ) {
            return Ok(());
        }
        tokio::select! {
            signal = async { shared.signaling.lock().await.recv(None).await } => {
                match signal? {
                    SignalingMessage::Signal(Signal::Status {
                        status: PairStatus::Unpaired,
                        ..
                    }) => {
                        if shared.state.get() == PeerState::Connected {
                            info!("unpaired received, disconnecting...");
                            run_disconnect(&shared, None, SkipTask::Relay).await?;
                            return Ok(());
                        }
                    }
                    SignalingMessage::Candidate { candidate } => {
                        let parsed = IceCandidate::from_payload(&candidate)?;
                        debug!("Got ice candidate: {:?}", parsed);
                        shared.session.lock().await.add_ice_candidate(parsed).await?;
                    }
                    other => {
                        return Err(PeerError::Protocol(format!(
                            "received an unexpected signal: {other:?}"
                        )));
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("Engine event stream closed");
                    return Ok(());
                };
                if handle_engine_event(&shared, event).await? {
                    return Ok(());
                }
            }
        }
    }
}

/// エンジンイベントを1件処理する。trueを返したらループ終了
async fn handle_engine_event(
    shared: &Arc<ConnectionShared>,
    event: EngineEvent,
) -> Result<bool, PeerError> {
    match event {
        EngineEvent::DataChannelOpen => {
            info!("Data channel open");
            shared.dc_open.store(true, Ordering::Relaxed);
            shared.state.promote_connected();
        }
        EngineEvent::DataChannelMessage(text) => {
            let value: Value = serde_json::from_str(&text).map_err(|e| {
                PeerError::Protocol(format!("received an invalid json message data: {e}"))
            })?;
            *shared.inbox.lock().unwrap() = Some(value.clone());
            // 登録順に同期呼び出し
            let handlers: Vec<DataHandler> = shared.handlers.lock().unwrap().clone();
            for handler in &handlers {
                handler(&value);
            }
        }
        EngineEvent::DataChannelClosed => {
            shared.dc_open.store(false, Ordering::Relaxed);
            if shared.state.get() == PeerState::Connected {
                info!("Datachannel lost, disconnecting...");
                run_disconnect(shared, None, SkipTask::Relay).await?;
                return Ok(true);
            }
        }
        EngineEvent::DataChannelError(message) => {
            error!("Datachannel error: {}", message);
            shared.dc_open.store(false, Ordering::Relaxed);
            run_disconnect(shared, Some(PeerError::Engine(message)), SkipTask::Relay).await?;
            return Ok(true);
        }
        EngineEvent::RemoteTrack(track) => {
            info!("Remote track received");
            spawn_track_consumer(shared, track);
        }
        EngineEvent::IceConnectionState(state) => {
            info!(
                "ICE connection state of peer ({}) is {:?}",
                shared.state.id(),
                state
            );
            match state {
                IceConnectionState::Completed => {
                    shared.state.promote_connected();
                }
                IceConnectionState::Failed => {
                    run_disconnect(shared, None, SkipTask::Relay).await?;
                    return Ok(true);
                }
                _ => {}
            }
        }
    }
    Ok(false)
}

/// 受信トラックのコンシューマタスクを起動する（シンク未設定なら何もしない)
fn spawn_track_consumer(shared: &Arc<ConnectionShared>, track: Box<dyn RemoteTrack>) {
    let Some(sink) = shared.sink.clone() else {
        debug!("No frame sink configured, remote track ignored");
        return;
    };
    let mut slot = shared.consumer_task.lock().unwrap();
    if slot.is_some() {
        warn!("Track consumer already running, extra remote track ignored");
        return;
    }
    info!("starting track consumer task...");
    *slot = Some(tokio::spawn(consume_track(track, sink)));
}

/// トラックコンシューマタスク
///
/// フレームを引き出してシンクに1枚ずつ渡す。タイミング情報は落とす。
async fn consume_track(
    mut track: Box<dyn RemoteTrack>,
    sink: SharedFrameSink,
) -> Result<(), PeerError> {
    loop {
        let frame = track.recv_frame().await?;
        sink.lock().await.consume(frame).await?;
    }
}

/// コンシューマ監視タスク
///
/// コンシューマが異常終了したら切断にエスカレーションする。
pub(crate) async fn monitor_consumer(shared: Arc<ConnectionShared>) -> Result<(), PeerError> {
    loop {
        if shared.state.get() != PeerState::Connected {
            return Ok(());
        }
        let finished = shared
            .consumer_task
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.is_finished());
        if finished == Some(true) {
            let handle = shared.consumer_task.lock().unwrap().take();
            if let Some(handle) = handle {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Track consumer error: {}", e);
                        return run_disconnect(&shared, Some(e), SkipTask::Monitor).await;
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        error!("Track consumer panicked: {}", e);
                        return run_disconnect(
                            &shared,
                            Some(PeerError::TaskFault(e.to_string())),
                            SkipTask::Monitor,
                        )
                        .await;
                    }
                }
            }
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
}

/// タスクをキャンセルして完了まで待つ
///
/// 完了済みタスクにも安全に呼べる。キャンセル起因の終了は無視し、
/// それ以外の失敗はログに残す。
pub(crate) async fn cancel_task(handle: JoinHandle<Result<(), PeerError>>, name: &str) {
    if !handle.is_finished() {
        handle.abort();
    }
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Task {} failed: {}", name, e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Task {} panicked: {}", name, e),
    }
}

/// 切断プロトコル本体
///
/// Connecting|Connected 以外では何もしない。タスクを
/// consumer -> relay -> monitor の順でキャンセルして待ち、
/// セッションを閉じてから Online か Closed に抜ける。
/// 致命的なcauseが渡された場合は全体を閉じた上でcauseを返す。
pub(crate) async fn run_disconnect(
    shared: &Arc<ConnectionShared>,
    cause: Option<PeerError>,
    skip: SkipTask,
) -> Result<(), PeerError> {
    if !shared.state.begin_disconnect() {
        return Ok(());
    }
    info!("canceling tasks...");

    let consumer = shared.consumer_task.lock().unwrap().take();
    if let Some(handle) = consumer {
        cancel_task(handle, "track-consumer").await;
    }

    let relay = shared.relay_task.lock().unwrap().take();
    if let Some(handle) = relay {
        if skip == SkipTask::Relay {
            // 自分自身のハンドルは待たずに手放す（直後にループを抜ける）
            drop(handle);
        } else {
            cancel_task(handle, "candidate-relay").await;
        }
    }

    let monitor = shared.monitor_task.lock().unwrap().take();
    if let Some(handle) = monitor {
        if skip == SkipTask::Monitor {
            drop(handle);
        } else {
            cancel_task(handle, "track-consumer-monitor").await;
        }
    }

    info!("closing peer connection...");
    shared.dc_open.store(false, Ordering::Relaxed);
    if let Err(e) = shared.session.lock().await.close().await {
        warn!("Failed to close engine session: {}", e);
    }

    let fatal = cause.is_some();
    let signaling_open = shared.signaling.lock().await.is_open();
    if signaling_open && !fatal {
        shared.state.set(PeerState::Online);
    } else {
        shared.state.set(PeerState::Closing);
        if let Err(e) = shared.signaling.lock().await.close().await {
            warn!("Failed to close signaling connection: {}", e);
        }
        shared.state.set(PeerState::Closed);
    }

    let _ = shared.done_tx.send(true);
    info!("Disconnected peer {}", shared.state.id());

    if let Some(cause) = cause {
        error!(
            "Peer {} was disconnected because an error occurred: {}",
            shared.state.id(),
            cause
        );
        return Err(cause);
    }
    Ok(())
}
