//! Downstream WebSocket sessions.
//!
//! Each `open_websocket` packet runs as its own task: resolve the target,
//! apply the firewall, dial, and report via `open_websocket_result`. A live
//! session pumps frames both ways until either side closes — frames from the
//! downstream service become `websocket_msg` packets toward the bridge,
//! frames from the bridge arrive over the session's channel.

use crate::link::GatewayState;
use crate::target::transform_ws_url;
use bridging_core::{Args, Packet, PacketMethod};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Frames pushed to a downstream session by the link dispatcher.
#[derive(Debug)]
pub enum DownstreamFrame {
    Msg(String),
    Close,
}

/// Capacity of each session's inbound channel.
pub const SESSION_QUEUE_CAPACITY: usize = 64;

pub async fn handle_open_websocket(
    state: Arc<GatewayState>,
    corr_id: String,
    args: Args,
    queue: mpsc::Sender<Packet>,
) {
    let Some(ws_id) = args.ws_id.clone() else {
        warn!(corr_id = %corr_id, "open_websocket without ws_id");
        return;
    };

    let target = match transform_ws_url(&args) {
        Ok(target) => target,
        Err(e) => {
            warn!(ws_id = %ws_id, error = %e, "bad websocket target");
            let _ = queue
                .send(open_result(&corr_id, &ws_id, Some(e.to_string())))
                .await;
            return;
        }
    };

    if !state
        .whitelist
        .allows(&target.netloc, "GET", &target.scheme, &target.path)
    {
        warn!(ws_id = %ws_id, target = %target.url, "forbidden");
        let _ = queue
            .send(open_result(&corr_id, &ws_id, Some("forbidden".into())))
            .await;
        return;
    }

    let (socket, _) = match connect_async(target.url.as_str()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(ws_id = %ws_id, url = %target.url, error = %e, "downstream dial failed");
            let _ = queue
                .send(open_result(&corr_id, &ws_id, Some(e.to_string())))
                .await;
            return;
        }
    };
    info!(ws_id = %ws_id, url = %target.url, "downstream websocket open");

    let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    state
        .downstream
        .lock()
        .unwrap()
        .insert(ws_id.clone(), tx);
    let _ = queue.send(open_result(&corr_id, &ws_id, None)).await;

    // Session packets reuse the corr_id of the open request; the bridge does
    // not correlate on them, and it keeps the whole session greppable.
    session_loop(&state, &corr_id, &ws_id, socket, rx, &queue).await;
}

fn open_result(corr_id: &str, ws_id: &str, exception: Option<String>) -> Packet {
    Packet::new(
        corr_id,
        PacketMethod::OpenWebsocketResult,
        Args {
            ws_id: Some(ws_id.to_string()),
            exception,
            ..Default::default()
        },
    )
}

/// Pump one downstream session until either side closes it.
async fn session_loop(
    state: &GatewayState,
    corr_id: &str,
    ws_id: &str,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx: mpsc::Receiver<DownstreamFrame>,
    queue: &mpsc::Sender<Packet>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(DownstreamFrame::Msg(msg)) => {
                    if let Err(e) = sink.send(Message::Text(msg)).await {
                        warn!(ws_id = %ws_id, error = %e, "downstream write failed");
                        self_close(state, corr_id, ws_id, queue).await;
                        break;
                    }
                }
                // Close requested by the bridge, or the session was dropped
                // from the table (link loss): close the downstream socket.
                Some(DownstreamFrame::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => forward_msg(corr_id, ws_id, text, queue).await,
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    forward_msg(corr_id, ws_id, text, queue).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(ws_id = %ws_id, "downstream closed");
                    self_close(state, corr_id, ws_id, queue).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(ws_id = %ws_id, error = %e, "downstream read failed");
                    self_close(state, corr_id, ws_id, queue).await;
                    break;
                }
            },
        }
    }

    state.downstream.lock().unwrap().remove(ws_id);
    info!(ws_id = %ws_id, "downstream websocket closed");
}

/// Forward one downstream frame toward the bridge, preserving per-session
/// ordering through the shared send queue.
async fn forward_msg(corr_id: &str, ws_id: &str, msg: String, queue: &mpsc::Sender<Packet>) {
    let packet = Packet::new(
        corr_id,
        PacketMethod::WebsocketMsg,
        Args {
            ws_id: Some(ws_id.to_string()),
            msg: Some(msg),
            ..Default::default()
        },
    );
    if queue.send(packet).await.is_err() {
        debug!(ws_id = %ws_id, "send queue closed, dropping msg");
    }
}

/// The downstream side went away: unregister and tell the bridge.
async fn self_close(state: &GatewayState, corr_id: &str, ws_id: &str, queue: &mpsc::Sender<Packet>) {
    state.downstream.lock().unwrap().remove(ws_id);
    let packet = Packet::new(
        corr_id,
        PacketMethod::CloseWebsocket,
        Args {
            ws_id: Some(ws_id.to_string()),
            ..Default::default()
        },
    );
    let _ = queue.send(packet).await;
}
