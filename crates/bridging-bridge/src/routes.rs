//! Public HTTP surface of the bridge.
//!
//! `GET /bridge` upgrades the gateway link; every other method/path is a
//! client request to be tunneled — plain HTTP or, with `Upgrade: websocket`,
//! a forwarded WebSocket session. CORS applies to the tunneled paths only.

use crate::config::BridgeConfig;
use crate::errors::ApiError;
use crate::forwarder::{ClientFrame, Forwarder, CLIENT_QUEUE_CAPACITY};
use axum::body::Body;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue, HOST, UPGRADE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bridging_core::{Args, BridgingError, BridgingResult, Headers, PacketMethod};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deadline for writing a close frame to a client socket.
const CLOSE_DEADLINE: Duration = Duration::from_secs(3);

/// Tunnel frames carry fully buffered bodies, so the gateway link needs a
/// far more generous message cap than the transport default.
const MAX_TUNNEL_FRAME: usize = 32 * 1024 * 1024;

pub struct AppState {
    pub forwarder: Arc<Forwarder>,
}

pub fn router(state: Arc<AppState>, cfg: &BridgeConfig) -> Router {
    // CORS applies to the tunneled paths only, never to the gateway link.
    let tunnel_service = Router::new()
        .fallback(tunnel)
        .layer(cors_layer(cfg))
        .with_state(state.clone());
    Router::new()
        // Non-GET /bridge is an ordinary tunneled request.
        .route("/bridge", get(serve_bridge).fallback(tunnel))
        .fallback_service(tunnel_service)
        .with_state(state)
}

fn cors_layer(cfg: &BridgeConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_allow_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let methods: Vec<Method> = cfg
        .cors_allow_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    let headers: Vec<HeaderName> = cfg
        .cors_allow_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_credentials(true)
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::list(headers))
}

/// `GET /bridge`: WebSocket upgrade for the gateway. The token is checked
/// after the upgrade; a mismatch or duplicate link is closed without reply.
/// Origin is deliberately not checked on this path.
async fn serve_bridge(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get("bridging-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.max_message_size(MAX_TUNNEL_FRAME)
        .max_frame_size(MAX_TUNNEL_FRAME)
        .on_upgrade(move |socket| async move {
            state.forwarder.serve_gateway(socket, remote, token).await;
            info!("bridge link closed");
        })
}

/// Catch-all for client traffic.
async fn tunnel(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    info!(method = %req.method(), client = %remote, url = %req.uri(), "recv");
    match ws {
        Some(upgrade) => tunnel_websocket(state, remote, upgrade, req).await,
        None => tunnel_http(state, remote, req).await,
    }
}

/// Forward one buffered HTTP call and write back the correlated reply.
async fn tunnel_http(state: Arc<AppState>, remote: SocketAddr, req: Request) -> Response {
    if !state.forwarder.is_connected() {
        return ApiError::Internal.into_response();
    }
    if req.headers().get("bridging-base-url").is_none() {
        return ApiError::BadRequest.into_response();
    }

    let args = match make_req_args(remote, req).await {
        Ok(args) => args,
        Err(e) => {
            warn!(error = %e, "failed to read request");
            return ApiError::BadRequest.into_response();
        }
    };

    match state.forwarder.request(PacketMethod::Http, args).await {
        Ok(reply) => http_reply_response(reply),
        Err(e) => {
            warn!(error = %e, "tunneled request failed");
            ApiError::Internal.into_response()
        }
    }
}

/// Open a tunneled WebSocket session for a public client.
async fn tunnel_websocket(
    state: Arc<AppState>,
    remote: SocketAddr,
    upgrade: WebSocketUpgrade,
    req: Request,
) -> Response {
    if !state.forwarder.is_connected() {
        return ApiError::Internal.into_response();
    }
    if !has_query_param(req.uri().query(), "bridging-base-url") {
        return ApiError::BadRequest.into_response();
    }

    let args = match make_req_args(remote, req).await {
        Ok(args) => args,
        Err(e) => {
            warn!(error = %e, "failed to read upgrade request");
            return ApiError::BadRequest.into_response();
        }
    };

    upgrade.on_upgrade(move |socket| client_session(state, socket, args))
}

/// Lifecycle of one forwarded client WebSocket.
async fn client_session(state: Arc<AppState>, socket: WebSocket, mut args: Args) {
    let ws_id = Uuid::new_v4().to_string();
    args.ws_id = Some(ws_id.clone());

    let reply = match state
        .forwarder
        .request(PacketMethod::OpenWebsocket, args)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(ws_id = %ws_id, error = %e, "open_websocket failed");
            return;
        }
    };
    if let Some(exception) = reply.exception.filter(|e| !e.is_empty()) {
        warn!(ws_id = %ws_id, exception = %exception, "downstream refused websocket");
        return;
    }

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    tokio::spawn(client_writer(sink, rx));
    state.forwarder.register_client(&ws_id, tx.clone());
    info!(ws_id = %ws_id, "client websocket open");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => state.forwarder.send_ws_msg(&ws_id, text).await,
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                state.forwarder.send_ws_msg(&ws_id, text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(ws_id = %ws_id, error = %e, "client read failed");
                break;
            }
        }
    }

    // Unregister first; only tell the gateway if the session was still ours
    // (the gateway side already knows when it initiated the close).
    if state.forwarder.close_client_session(&ws_id).await {
        let _ = tx.send(ClientFrame::Close).await;
    }
    info!(ws_id = %ws_id, "client websocket closed");
}

/// Sole writer for one client socket.
async fn client_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<ClientFrame>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            ClientFrame::Msg(msg) => {
                if sink.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            ClientFrame::Close => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "".into(),
                }));
                let _ = tokio::time::timeout(CLOSE_DEADLINE, sink.send(close)).await;
                break;
            }
        }
    }
}

/// Capture a public request as tunnel args: method, reconstructed URL,
/// remote address, all header values, and the fully buffered body.
async fn make_req_args(remote: SocketAddr, req: Request) -> BridgingResult<Args> {
    let (parts, body) = req.into_parts();

    let scheme = if parts
        .headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        "ws"
    } else {
        "http"
    };
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{scheme}://{host}{path_and_query}");

    let mut headers = Headers::new();
    for (name, value) in parts.headers.iter() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| BridgingError::Other(format!("read body: {e}")))?;

    Ok(Args {
        method: Some(parts.method.to_string()),
        url: Some(url),
        headers: Some(headers),
        client: Some(remote.to_string()),
        body: if body.is_empty() {
            None
        } else {
            Some(body.to_vec())
        },
        ..Default::default()
    })
}

/// Write the correlated reply back to the public caller: status, copied
/// headers, `content` as the body. No transformation beyond the copy.
fn http_reply_response(reply: Args) -> Response {
    let status = reply
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(Body::from(reply.content.unwrap_or_default()));
    *response.status_mut() = status;
    for (name, values) in reply.headers.unwrap_or_default() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "skipping invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    response.headers_mut().append(name.clone(), value);
                }
                Err(_) => debug!(header = %name, "skipping invalid header value"),
            }
        }
    }
    response
}

fn has_query_param(query: Option<&str>, name: &str) -> bool {
    query
        .unwrap_or_default()
        .split('&')
        .any(|pair| pair.split('=').next() == Some(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "10.1.2.3:55110".parse().unwrap()
    }

    #[tokio::test]
    async fn req_args_capture_method_url_headers_body() {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/api/v1/ping?x=1&y=2")
            .header("host", "bridge.example:8000")
            .header("bridging-base-url", "svc.internal:80")
            .header("x-tag", "a")
            .header("x-tag", "b")
            .body(Body::from(vec![0u8, 200, 255]))
            .unwrap();

        let args = make_req_args(remote(), req).await.unwrap();
        assert_eq!(args.method.as_deref(), Some("POST"));
        assert_eq!(
            args.url.as_deref(),
            Some("http://bridge.example:8000/api/v1/ping?x=1&y=2")
        );
        assert_eq!(args.client.as_deref(), Some("10.1.2.3:55110"));
        assert_eq!(args.body.as_deref(), Some(&[0u8, 200, 255][..]));

        let headers = args.headers.unwrap();
        assert_eq!(headers["x-tag"], vec!["a", "b"]);
        assert_eq!(headers["bridging-base-url"], vec!["svc.internal:80"]);
    }

    #[tokio::test]
    async fn upgrade_header_switches_scheme_to_ws() {
        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/echo?bridging-base-url=echo.internal:9000")
            .header("host", "bridge.example")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap();

        let args = make_req_args(remote(), req).await.unwrap();
        assert_eq!(
            args.url.as_deref(),
            Some("ws://bridge.example/echo?bridging-base-url=echo.internal:9000")
        );
        assert_eq!(args.body, None);
    }

    #[tokio::test]
    async fn reply_is_written_back_verbatim() {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), vec!["application/json".into()]);
        headers.insert("set-cookie".into(), vec!["a=1".into(), "b=2".into()]);

        let response = http_reply_response(Args {
            status_code: Some(201),
            headers: Some(headers),
            content: Some(r#"{"ok":1}"#.into()),
            ..Default::default()
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response
                .headers()
                .get_all("set-cookie")
                .iter()
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn reply_without_status_is_internal() {
        let response = http_reply_response(Args::default());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn query_param_detection() {
        assert!(has_query_param(
            Some("a=1&bridging-base-url=svc.internal:80"),
            "bridging-base-url"
        ));
        assert!(!has_query_param(Some("a=1&b=2"), "bridging-base-url"));
        assert!(!has_query_param(None, "bridging-base-url"));
        // A key prefix must not match.
        assert!(!has_query_param(
            Some("bridging-base-url-x=1"),
            "bridging-base-url"
        ));
    }
}
