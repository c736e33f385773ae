//! Tunnel forwarder: owns the gateway link, the correlation table for
//! in-flight requests, and the table of tunneled client WebSockets.
//!
//! One `Forwarder` lives for the whole process. The gateway link slot holds
//! at most one connection; a request registers a one-shot reply slot keyed by
//! `corr_id` before its packet is sent, and the link read loop signals each
//! slot at most once. Client sockets are written to only by their dedicated
//! writer task, fed through an mpsc channel.

use axum::extract::ws::{Message, WebSocket};
use bridging_core::{Args, BridgingError, BridgingResult, Codec, Packet, PacketMethod};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames pushed to a client socket's writer task.
#[derive(Debug)]
pub enum ClientFrame {
    /// Deliver a text frame to the client.
    Msg(String),
    /// Write a close frame (bounded by the close deadline) and stop.
    Close,
}

/// Capacity of each client socket's write queue.
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

type GatewaySink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Clone)]
struct GatewayLink {
    sink: GatewaySink,
}

pub struct Forwarder {
    token: String,
    codec: Codec,
    /// At most one active gateway connection.
    link: Mutex<Option<GatewayLink>>,
    /// One-shot reply slots keyed by corr_id.
    pending: Mutex<HashMap<String, oneshot::Sender<Args>>>,
    /// Tunneled client WebSockets keyed by ws_id.
    client_ws: Mutex<HashMap<String, mpsc::Sender<ClientFrame>>>,
}

impl Forwarder {
    pub fn new(token: String, compress_level: u32) -> Self {
        Self {
            token,
            codec: Codec::new(compress_level),
            link: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            client_ws: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().unwrap().is_some()
    }

    /// Run the read loop for an accepted gateway connection.
    ///
    /// Rejects bad tokens and duplicate links (the socket is dropped, which
    /// closes it). On read error the link slot is cleared and every
    /// outstanding reply slot is failed so blocked callers get an error
    /// instead of waiting for a server timeout.
    pub async fn serve_gateway(&self, socket: WebSocket, remote: SocketAddr, token: Option<String>) {
        info!(client = %remote, "gateway connected");

        if token.as_deref() != Some(self.token.as_str()) {
            warn!(client = %remote, "invalid bridging token");
            return;
        }

        let (sink, mut stream) = socket.split();
        {
            let mut slot = self.link.lock().unwrap();
            if slot.is_some() {
                info!(client = %remote, "duplicate gateway connection");
                return;
            }
            *slot = Some(GatewayLink {
                sink: Arc::new(tokio::sync::Mutex::new(sink)),
            });
        }
        info!(client = %remote, "gateway link established");

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(buf)) => match Codec::decode(&buf) {
                    Ok(packet) => self.dispatch(packet).await,
                    Err(e) => warn!(error = %e, "dropping undecodable tunnel frame"),
                },
                Ok(Message::Text(_)) => info!("dropping text frame on gateway link"),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!(client = %remote, error = %e, "gateway link read failed");
                    break;
                }
            }
        }

        info!(client = %remote, "gateway disconnected");
        *self.link.lock().unwrap() = None;
        self.fail_pending();
    }

    /// Route one packet from the gateway.
    async fn dispatch(&self, packet: Packet) {
        match packet.method {
            PacketMethod::WebsocketMsg => {
                debug!(packet = %packet, "recv");
                let Some(ws_id) = packet.args.ws_id else {
                    warn!(corr_id = %packet.corr_id, "websocket_msg without ws_id");
                    return;
                };
                let sender = self.client_ws.lock().unwrap().get(&ws_id).cloned();
                if let (Some(tx), Some(msg)) = (sender, packet.args.msg) {
                    if tx.send(ClientFrame::Msg(msg)).await.is_err() {
                        debug!(ws_id = %ws_id, "client writer gone, dropping msg");
                    }
                }
            }
            PacketMethod::CloseWebsocket => {
                info!(packet = %packet, "recv");
                let Some(ws_id) = packet.args.ws_id else {
                    warn!(corr_id = %packet.corr_id, "close_websocket without ws_id");
                    return;
                };
                // Unregister first so no late frame can race the close.
                let sender = self.client_ws.lock().unwrap().remove(&ws_id);
                if let Some(tx) = sender {
                    let _ = tx.send(ClientFrame::Close).await;
                }
            }
            PacketMethod::HttpResult
            | PacketMethod::OpenWebsocketResult
            | PacketMethod::CloseWebsocketResult => {
                info!(packet = %packet, "recv");
                let waiter = self.pending.lock().unwrap().remove(&packet.corr_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(packet.args);
                    }
                    None => debug!(corr_id = %packet.corr_id, "no waiter for reply"),
                }
            }
            _ => info!(packet = %packet, "ignoring unexpected method"),
        }
    }

    /// Send a request packet and block until the correlated reply arrives.
    ///
    /// The reply slot is registered before the send and removed when this
    /// future resolves or is dropped, so an abandoned caller cannot leak it.
    pub async fn request(&self, method: PacketMethod, args: Args) -> BridgingResult<Args> {
        let corr_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(corr_id.clone(), tx);
        let _slot = PendingSlot {
            forwarder: self,
            corr_id: corr_id.clone(),
        };

        let packet = Packet::new(corr_id, method, args);
        self.send(&packet).await?;

        rx.await.map_err(|_| BridgingError::NotConnected)
    }

    /// Fire-and-forget a client frame toward the gateway.
    pub async fn send_ws_msg(&self, ws_id: &str, msg: String) {
        let packet = Packet::new(
            Uuid::new_v4().to_string(),
            PacketMethod::WebsocketMsg,
            Args {
                ws_id: Some(ws_id.to_string()),
                msg: Some(msg),
                ..Default::default()
            },
        );
        if let Err(e) = self.send(&packet).await {
            debug!(ws_id = %ws_id, error = %e, "websocket msg dropped");
        }
    }

    /// Encode and write one packet to the gateway socket.
    async fn send(&self, packet: &Packet) -> BridgingResult<()> {
        let link = self
            .link
            .lock()
            .unwrap()
            .clone()
            .ok_or(BridgingError::NotConnected)?;
        let frame = self.codec.encode(packet)?;
        info!(packet = %packet, "send");
        let mut sink = link.sink.lock().await;
        sink.send(Message::Binary(frame)).await.map_err(|e| {
            warn!(error = %e, "gateway send failed");
            BridgingError::Transport(e.to_string())
        })
    }

    /// Register a freshly opened client socket under its session id.
    pub fn register_client(&self, ws_id: &str, tx: mpsc::Sender<ClientFrame>) {
        self.client_ws
            .lock()
            .unwrap()
            .insert(ws_id.to_string(), tx);
    }

    /// Close a client session from the bridge side: unregister, then tell
    /// the gateway. Returns whether the session was still registered (false
    /// when the gateway already closed it).
    pub async fn close_client_session(&self, ws_id: &str) -> bool {
        if self.client_ws.lock().unwrap().remove(ws_id).is_none() {
            return false;
        }
        let args = Args {
            ws_id: Some(ws_id.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.request(PacketMethod::CloseWebsocket, args).await {
            debug!(ws_id = %ws_id, error = %e, "close_websocket not delivered");
        }
        true
    }

    /// Fail every outstanding reply slot (gateway link lost).
    fn fail_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "failing outstanding requests");
        }
        // Dropping the senders wakes each waiter with an error.
    }

    #[cfg(test)]
    fn insert_waiter(&self, corr_id: &str) -> oneshot::Receiver<Args> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(corr_id.to_string(), tx);
        rx
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    #[cfg(test)]
    fn client_len(&self) -> usize {
        self.client_ws.lock().unwrap().len()
    }
}

/// Removes the corr_id from the pending table when the requester goes away;
/// removal after a delivered reply is a no-op.
struct PendingSlot<'a> {
    forwarder: &'a Forwarder,
    corr_id: String,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.forwarder
            .pending
            .lock()
            .unwrap()
            .remove(&self.corr_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder() -> Forwarder {
        Forwarder::new("t0k3n".into(), 6)
    }

    fn reply(corr_id: &str, method: PacketMethod, args: Args) -> Packet {
        Packet::new(corr_id, method, args)
    }

    #[tokio::test]
    async fn reply_signals_waiter_once() {
        let f = forwarder();
        let rx = f.insert_waiter("c-1");

        f.dispatch(reply(
            "c-1",
            PacketMethod::HttpResult,
            Args {
                status_code: Some(200),
                content: Some("ok".into()),
                ..Default::default()
            },
        ))
        .await;

        let args = rx.await.unwrap();
        assert_eq!(args.status_code, Some(200));
        assert_eq!(f.pending_len(), 0);

        // A second reply with the same corr_id is dropped, not redelivered.
        f.dispatch(reply("c-1", PacketMethod::HttpResult, Args::default()))
            .await;
        assert_eq!(f.pending_len(), 0);
    }

    #[tokio::test]
    async fn unknown_corr_id_is_dropped() {
        let f = forwarder();
        f.dispatch(reply("nope", PacketMethod::HttpResult, Args::default()))
            .await;
        assert_eq!(f.pending_len(), 0);
    }

    #[tokio::test]
    async fn request_without_link_fails_and_leaves_no_slot() {
        let f = forwarder();
        let err = f.request(PacketMethod::Http, Args::default()).await;
        assert!(matches!(err, Err(BridgingError::NotConnected)));
        assert_eq!(f.pending_len(), 0);
    }

    #[tokio::test]
    async fn fail_pending_wakes_all_waiters() {
        let f = forwarder();
        let rx1 = f.insert_waiter("c-1");
        let rx2 = f.insert_waiter("c-2");

        f.fail_pending();

        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
        assert_eq!(f.pending_len(), 0);
    }

    #[tokio::test]
    async fn websocket_msg_routes_to_registered_client() {
        let f = forwarder();
        let (tx, mut rx) = mpsc::channel(4);
        f.register_client("w-1", tx);

        f.dispatch(reply(
            "c-3",
            PacketMethod::WebsocketMsg,
            Args {
                ws_id: Some("w-1".into()),
                msg: Some("hello".into()),
                ..Default::default()
            },
        ))
        .await;

        match rx.recv().await {
            Some(ClientFrame::Msg(m)) => assert_eq!(m, "hello"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn websocket_msg_for_unknown_session_is_dropped() {
        let f = forwarder();
        f.dispatch(reply(
            "c-4",
            PacketMethod::WebsocketMsg,
            Args {
                ws_id: Some("w-404".into()),
                msg: Some("hello".into()),
                ..Default::default()
            },
        ))
        .await;
        assert_eq!(f.client_len(), 0);
    }

    #[tokio::test]
    async fn close_websocket_unregisters_before_signaling_close() {
        let f = forwarder();
        let (tx, mut rx) = mpsc::channel(4);
        f.register_client("w-2", tx);

        f.dispatch(reply(
            "c-5",
            PacketMethod::CloseWebsocket,
            Args {
                ws_id: Some("w-2".into()),
                ..Default::default()
            },
        ))
        .await;

        assert_eq!(f.client_len(), 0);
        assert!(matches!(rx.recv().await, Some(ClientFrame::Close)));
    }

    #[tokio::test]
    async fn close_client_session_is_idempotent() {
        let f = forwarder();
        let (tx, _rx) = mpsc::channel(4);
        f.register_client("w-3", tx);

        // First close finds the registration (the close_websocket request
        // itself fails: no link — that is fine, the mapping must still go).
        assert!(f.close_client_session("w-3").await);
        assert_eq!(f.client_len(), 0);
        // Second close is a no-op.
        assert!(!f.close_client_session("w-3").await);
    }
}
