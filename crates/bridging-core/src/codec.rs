//! gzip+JSON envelope for the bridge⇄gateway link.
//!
//! Every tunnel frame is a single binary WebSocket message whose payload is
//! gzip-compressed UTF-8 JSON of one [`Packet`]. Decode failures are typed so
//! callers can drop the frame and keep the link alive.

use crate::error::{BridgingError, BridgingResult};
use crate::packet::Packet;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Packet encoder/decoder at a fixed compression level.
#[derive(Debug, Clone)]
pub struct Codec {
    level: Compression,
}

impl Codec {
    /// gzip levels are 0..=9; out-of-range values are clamped.
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Compress a packet into a tunnel frame payload.
    pub fn encode(&self, packet: &Packet) -> BridgingResult<Vec<u8>> {
        let json = serde_json::to_vec(packet)?;
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(&json)
            .map_err(|e| BridgingError::Codec(format!("gzip write: {e}")))?;
        encoder
            .finish()
            .map_err(|e| BridgingError::Codec(format!("gzip finish: {e}")))
    }

    /// Decompress and parse a tunnel frame payload.
    ///
    /// Accepts any valid gzip stream. Malformed gzip, malformed JSON and
    /// unknown method tags all surface as [`BridgingError::Codec`].
    pub fn decode(data: &[u8]) -> BridgingResult<Packet> {
        let mut json = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut json)
            .map_err(|e| BridgingError::Codec(format!("gzip read: {e}")))?;
        serde_json::from_slice(&json).map_err(BridgingError::from)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Args, Headers, PacketMethod};

    fn sample_packet() -> Packet {
        let mut headers = Headers::new();
        headers.insert("Accept".into(), vec!["*/*".into()]);
        headers.insert("X-Tag".into(), vec!["a".into(), "b".into()]);
        Packet::new(
            "corr-1",
            PacketMethod::Http,
            Args {
                method: Some("POST".into()),
                url: Some("http://svc.internal:80/ping?x=1".into()),
                headers: Some(headers),
                client: Some("10.0.0.7:51234".into()),
                body: Some(vec![0, 255, 128, 42]),
                ..Default::default()
            },
        )
    }

    #[test]
    fn round_trip_at_every_level() {
        let packet = sample_packet();
        for level in 0..=9 {
            let codec = Codec::new(level);
            let frame = codec.encode(&packet).unwrap();
            let back = Codec::decode(&frame).unwrap();
            assert_eq!(back, packet, "level {level}");
        }
    }

    #[test]
    fn round_trip_empty_args() {
        let packet = Packet::new("corr-2", PacketMethod::CloseWebsocketResult, Args::default());
        let frame = Codec::default().encode(&packet).unwrap();
        assert_eq!(Codec::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn round_trip_large_body() {
        // Larger than a typical WebSocket read buffer.
        let packet = Packet::new(
            "corr-3",
            PacketMethod::Http,
            Args {
                body: Some((0..200_000u32).map(|i| (i % 251) as u8).collect()),
                ..Default::default()
            },
        );
        let frame = Codec::new(9).encode(&packet).unwrap();
        assert_eq!(Codec::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn round_trip_multibyte_msg() {
        let packet = Packet::new(
            "corr-4",
            PacketMethod::WebsocketMsg,
            Args {
                ws_id: Some("w-1".into()),
                msg: Some("héllo — 世界 🦀".into()),
                ..Default::default()
            },
        );
        let frame = Codec::default().encode(&packet).unwrap();
        assert_eq!(Codec::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let frame = Codec::default().encode(&sample_packet()).unwrap();
        let truncated = &frame[..frame.len() / 2];
        assert!(matches!(
            Codec::decode(truncated),
            Err(BridgingError::Codec(_))
        ));
    }

    #[test]
    fn raw_json_is_not_a_frame() {
        let json = serde_json::to_vec(&sample_packet()).unwrap();
        assert!(Codec::decode(&json).is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(Codec::decode(&[0x1f, 0x8b, 0xff, 0x00, 0x01]).is_err());
        assert!(Codec::decode(b"").is_err());
    }
}
