//! Outbound HTTP for tunneled requests.
//!
//! Each `http` packet runs as its own task: resolve the target, apply the
//! firewall, perform the call, and enqueue an `http_result` — a 500 with an
//! empty body when the downstream cannot be reached, a 403 when the firewall
//! denies the target.

use crate::link::GatewayState;
use crate::target::transform_http_url;
use bridging_core::{Args, BridgingError, BridgingResult, Headers, Packet, PacketMethod};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn handle_http(
    state: Arc<GatewayState>,
    corr_id: String,
    args: Args,
    queue: mpsc::Sender<Packet>,
) {
    let reply = match call_downstream(&state, &args).await {
        Ok(reply) => reply,
        Err(BridgingError::Forbidden(target)) => {
            warn!(corr_id = %corr_id, target = %target, "forbidden");
            error_resp_args(403)
        }
        Err(e) => {
            warn!(corr_id = %corr_id, error = %e, "downstream http call failed");
            error_resp_args(500)
        }
    };

    let packet = Packet::new(corr_id, PacketMethod::HttpResult, reply);
    if queue.send(packet).await.is_err() {
        debug!("send queue closed, dropping http_result");
    }
}

async fn call_downstream(state: &GatewayState, args: &Args) -> BridgingResult<Args> {
    let target = transform_http_url(args)?;
    let method = args.method.as_deref().unwrap_or("GET");
    if !state
        .whitelist
        .allows(&target.netloc, method, &target.scheme, &target.path)
    {
        return Err(BridgingError::Forbidden(format!("{method} {}", target.url)));
    }

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| BridgingError::InvalidPacket(format!("bad method [{method}]: {e}")))?;

    let mut request = state.http.request(method, target.url.as_str());
    request = request.headers(outbound_headers(args));
    if let Some(body) = &args.body {
        request = request.body(body.clone());
    }

    info!(url = %target.url, "downstream http call");
    let response = request
        .send()
        .await
        .map_err(|e| BridgingError::Transport(e.to_string()))?;

    package_response(response).await
}

/// Copy the tunneled request headers onto the outbound call. `host` and
/// `content-length` are recomputed by the client for the new target.
fn outbound_headers(args: &Args) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    let Some(headers) = &args.headers else {
        return map;
    };
    for (name, values) in headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "skipping invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    map.append(name.clone(), value);
                }
                Err(_) => debug!(header = %name, "skipping invalid header value"),
            }
        }
    }
    map
}

/// Package a downstream response, stripping `Content-Encoding` and
/// `Content-Length`: the tunnel re-frames the payload and the bridge
/// re-derives lengths.
async fn package_response(response: reqwest::Response) -> BridgingResult<Args> {
    let status = response.status().as_u16();

    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        if name == &CONTENT_ENCODING || name == &CONTENT_LENGTH {
            continue;
        }
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| BridgingError::Transport(format!("read downstream body: {e}")))?;

    Ok(Args {
        status_code: Some(status),
        headers: Some(headers),
        content: Some(String::from_utf8_lossy(&body).into_owned()),
        ..Default::default()
    })
}

/// Synthetic `http_result` args: status only, empty body, no headers.
pub fn error_resp_args(status: u16) -> Args {
    Args {
        status_code: Some(status),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_args_carry_only_the_status() {
        let args = error_resp_args(500);
        assert_eq!(args.status_code, Some(500));
        assert_eq!(args.headers, None);
        assert_eq!(args.content, None);
        // Wire form stays minimal.
        assert_eq!(
            serde_json::to_string(&args).unwrap(),
            r#"{"status_code":500}"#
        );
    }

    #[test]
    fn outbound_headers_skip_host_and_length() {
        let mut headers = Headers::new();
        headers.insert("Host".into(), vec!["bridge.example".into()]);
        headers.insert("Content-Length".into(), vec!["12".into()]);
        headers.insert("X-Tag".into(), vec!["a".into(), "b".into()]);
        let args = Args {
            headers: Some(headers),
            ..Default::default()
        };

        let map = outbound_headers(&args);
        assert!(map.get("host").is_none());
        assert!(map.get("content-length").is_none());
        assert_eq!(map.get_all("x-tag").iter().count(), 2);
    }
}
