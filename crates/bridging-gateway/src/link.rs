//! Bridge link management.
//!
//! The gateway dials `<bridge_netloc>/bridge` with the `bridging-token`
//! header and keeps exactly one link alive, redialing forever on a fixed
//! interval. While connected, a reader dispatches incoming packets and a
//! single writer drains the bounded send queue — it is the only task that
//! touches the socket sink or the compressor, and the bounded queue gives
//! producers natural backpressure.

use crate::config::{GatewayConfig, Whitelist};
use crate::downstream::{handle_open_websocket, DownstreamFrame};
use crate::http::handle_http;
use bridging_core::{Args, BridgingError, BridgingResult, Codec, Packet, PacketMethod};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Fixed delay between redial attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the packet queue feeding the link writer.
const SEND_QUEUE_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared by the link dispatcher and its spawned handlers.
pub struct GatewayState {
    pub whitelist: Whitelist,
    pub http: reqwest::Client,
    /// Downstream WebSockets keyed by the ws_id assigned by the bridge.
    pub downstream: Mutex<HashMap<String, mpsc::Sender<DownstreamFrame>>>,
}

impl GatewayState {
    pub fn new(whitelist: Whitelist) -> BridgingResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BridgingError::Other(format!("http client: {e}")))?;
        Ok(Self {
            whitelist,
            http,
            downstream: Mutex::new(HashMap::new()),
        })
    }
}

/// Dial the bridge and serve the link until it drops; repeat forever.
pub async fn run(state: Arc<GatewayState>, cfg: GatewayConfig) {
    loop {
        match connect_and_serve(&state, &cfg).await {
            Ok(()) => info!("bridge link closed"),
            Err(e) => warn!(error = %e, "bridge link failed"),
        }
        shutdown_sessions(&state);
        info!(retry_secs = RETRY_INTERVAL.as_secs(), "reconnecting after delay");
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

async fn connect_and_serve(state: &Arc<GatewayState>, cfg: &GatewayConfig) -> BridgingResult<()> {
    let url = format!("{}/bridge", cfg.bridge_netloc);
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| BridgingError::Config(format!("bad bridge url [{url}]: {e}")))?;
    let token = HeaderValue::from_str(&cfg.bridge_token)
        .map_err(|e| BridgingError::Config(format!("bridge_token not header-safe: {e}")))?;
    request.headers_mut().insert("bridging-token", token);

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| BridgingError::Transport(format!("dial {url}: {e}")))?;
    info!(url = %url, "connected to bridge");

    let (sink, stream) = socket.split();
    let (queue_tx, queue_rx) = mpsc::channel::<Packet>(SEND_QUEUE_CAPACITY);
    let writer = tokio::spawn(write_loop(sink, queue_rx));

    let result = read_loop(state, &queue_tx, stream).await;

    drop(queue_tx);
    writer.abort();
    result
}

/// Sole consumer of the socket sink and the compressor.
async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Packet>) {
    let codec = Codec::default();
    while let Some(packet) = rx.recv().await {
        let frame = match codec.encode(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode packet");
                continue;
            }
        };
        info!(packet = %packet, "send");
        if let Err(e) = sink.send(Message::Binary(frame)).await {
            warn!(error = %e, "bridge send failed");
            break;
        }
    }
}

async fn read_loop(
    state: &Arc<GatewayState>,
    queue: &mpsc::Sender<Packet>,
    mut stream: SplitStream<WsStream>,
) -> BridgingResult<()> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(buf)) => match Codec::decode(&buf) {
                Ok(packet) => dispatch(state, queue, packet).await,
                Err(e) => warn!(error = %e, "dropping undecodable tunnel frame"),
            },
            Ok(Message::Text(_)) => info!("dropping text frame on bridge link"),
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(BridgingError::Transport(e.to_string())),
        }
    }
    Ok(())
}

/// Route one packet from the bridge. Request handlers run as independent
/// tasks; session traffic goes through the session tables.
async fn dispatch(state: &Arc<GatewayState>, queue: &mpsc::Sender<Packet>, packet: Packet) {
    match packet.method {
        PacketMethod::Http => {
            info!(packet = %packet, "recv");
            tokio::spawn(handle_http(
                state.clone(),
                packet.corr_id,
                packet.args,
                queue.clone(),
            ));
        }
        PacketMethod::OpenWebsocket => {
            info!(packet = %packet, "recv");
            tokio::spawn(handle_open_websocket(
                state.clone(),
                packet.corr_id,
                packet.args,
                queue.clone(),
            ));
        }
        PacketMethod::WebsocketMsg => {
            debug!(packet = %packet, "recv");
            let Some(ws_id) = packet.args.ws_id else {
                warn!(corr_id = %packet.corr_id, "websocket_msg without ws_id");
                return;
            };
            let sender = state.downstream.lock().unwrap().get(&ws_id).cloned();
            if let (Some(tx), Some(msg)) = (sender, packet.args.msg) {
                if tx.send(DownstreamFrame::Msg(msg)).await.is_err() {
                    debug!(ws_id = %ws_id, "session gone, dropping msg");
                }
            }
        }
        PacketMethod::CloseWebsocket => {
            info!(packet = %packet, "recv");
            let Some(ws_id) = packet.args.ws_id else {
                warn!(corr_id = %packet.corr_id, "close_websocket without ws_id");
                return;
            };
            let sender = state.downstream.lock().unwrap().remove(&ws_id);
            if let Some(tx) = sender {
                let _ = tx.send(DownstreamFrame::Close).await;
            }
            let reply = Packet::new(
                packet.corr_id,
                PacketMethod::CloseWebsocketResult,
                Args {
                    ws_id: Some(ws_id),
                    ..Default::default()
                },
            );
            let _ = queue.send(reply).await;
        }
        _ => info!(packet = %packet, "ignoring unexpected method"),
    }
}

/// Close every downstream session before redialing.
fn shutdown_sessions(state: &GatewayState) {
    let sessions: Vec<_> = {
        let mut downstream = state.downstream.lock().unwrap();
        downstream.drain().collect()
    };
    if sessions.is_empty() {
        return;
    }
    info!(count = sessions.len(), "closing downstream sessions");
    for (_, tx) in sessions {
        // Best effort; dropping the sender alone also ends the session loop.
        let _ = tx.try_send(DownstreamFrame::Close);
    }
}
