//! Packet and args wire types for the bridge⇄gateway tunnel.
//!
//! The wire form is a flat JSON object: `{ "corr_id": …, "method": …,
//! "args": { … } }`. Every `Args` field is optional and omitted when unset,
//! so the same shape carries HTTP requests, HTTP results and the WebSocket
//! session lifecycle. Unknown fields are tolerated on decode.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Header map preserving multi-valued headers: name → list of values.
pub type Headers = HashMap<String, Vec<String>>;

/// Number of msg/body/content units kept when rendering a packet for logs.
const LOG_TRUNCATE_AT: usize = 1000;

/// The closed set of tunnel operations. The wire form is the lowercase
/// snake_case tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketMethod {
    Http,
    HttpResult,
    OpenWebsocket,
    OpenWebsocketResult,
    CloseWebsocket,
    CloseWebsocketResult,
    WebsocketMsg,
}

impl PacketMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketMethod::Http => "http",
            PacketMethod::HttpResult => "http_result",
            PacketMethod::OpenWebsocket => "open_websocket",
            PacketMethod::OpenWebsocketResult => "open_websocket_result",
            PacketMethod::CloseWebsocket => "close_websocket",
            PacketMethod::CloseWebsocketResult => "close_websocket_result",
            PacketMethod::WebsocketMsg => "websocket_msg",
        }
    }
}

impl fmt::Display for PacketMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The polymorphic payload of every tunneled message.
///
/// `body` carries request bytes and is encoded as a JSON array of signed
/// 8-bit integers for cross-language compatibility; in memory it is plain
/// bytes. `content` carries response text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(
        default,
        with = "signed_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Args {
    /// Copy with msg, body and content capped, to bound log-line size.
    fn truncated(&self) -> Args {
        let mut t = self.clone();
        t.msg = t.msg.map(|s| cut_str(&s, LOG_TRUNCATE_AT));
        t.content = t.content.map(|s| cut_str(&s, LOG_TRUNCATE_AT));
        t.body = t.body.map(|b| cut_bytes(&b, LOG_TRUNCATE_AT));
        t
    }
}

/// One tunneled message. `corr_id` pairs a request with its reply and is
/// echoed verbatim by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub corr_id: String,
    pub method: PacketMethod,
    #[serde(default)]
    pub args: Args,
}

impl Packet {
    pub fn new(corr_id: impl Into<String>, method: PacketMethod, args: Args) -> Self {
        Self {
            corr_id: corr_id.into(),
            method,
            args,
        }
    }
}

/// Renders the truncated form; payloads are capped so a single oversized
/// frame cannot flood the log.
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = Packet {
            corr_id: self.corr_id.clone(),
            method: self.method,
            args: self.args.truncated(),
        };
        match serde_json::to_string(&t) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unprintable packet>"),
        }
    }
}

fn cut_str(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn cut_bytes(b: &[u8], max: usize) -> Vec<u8> {
    b[..b.len().min(max)].to_vec()
}

/// Serde adapter mapping `Vec<u8>` to a JSON array of signed 8-bit values
/// (−128..127, reinterpreted bitwise). Counterparts that cannot represent
/// unsigned byte arrays natively rely on this form.
mod signed_bytes {
    use serde::de::{Deserialize, Deserializer};
    use serde::ser::{SerializeSeq, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for b in bytes {
                    seq.serialize_element(&(*b as i8))?;
                }
                seq.end()
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let signed: Option<Vec<i8>> = Option::deserialize(deserializer)?;
        Ok(signed.map(|v| v.into_iter().map(|b| b as u8).collect()))
    }
}
