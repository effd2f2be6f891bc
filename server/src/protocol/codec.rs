//! Framing for the agent RPC channel.
//!
//! A connection starts with the raw [`RPC_PREFACE`] written by the agent,
//! which is what the transport mux keys on. Everything after it is a stream
//! of length-delimited JSON [`Frame`]s.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{Envelope, VersionInfo};

/// Connection preface that identifies the agent RPC protocol.
pub const RPC_PREFACE: &[u8] = b"PXFLEET/1\r\n";

/// Upper bound on a single frame (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub type RpcFramed<S> = Framed<S, LengthDelimitedCodec>;

/// Everything that can appear on the wire after the preface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from the agent.
    Hello {
        agent_id: String,
        token: String,
        version: VersionInfo,
    },
    /// Master's answer to `hello`.
    Welcome {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        version: VersionInfo,
    },
    Envelope(Envelope),
}

/// Wrap an I/O stream (positioned after the preface) in the frame codec.
pub fn framed<S: AsyncRead + AsyncWrite>(io: S) -> RpcFramed<S> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(io, codec)
}

pub fn encode_frame(frame: &Frame) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(frame).map(Bytes::from)
}

pub fn decode_frame(raw: &[u8]) -> Result<Frame, serde_json::Error> {
    serde_json::from_slice(raw)
}

/// Serde adapter: `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as an optional base64 string.
pub mod base64_opt_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};

    use super::*;
    use crate::protocol::Event;

    #[test]
    fn frames_are_tagged_by_type() {
        let hello = Frame::Hello {
            agent_id: "edge-1".into(),
            token: "t".into(),
            version: VersionInfo::current(),
        };
        let raw = encode_frame(&hello).unwrap();
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.starts_with(r#"{"type":"hello""#));

        let env = Frame::Envelope(Envelope::new(Event::Ping, "edge-1", "s1", b"hi".to_vec()));
        let raw = encode_frame(&env).unwrap();
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.contains(r#""type":"envelope""#));
        assert!(text.contains(r#""data":"aGk=""#));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_frame(b"not json").is_err());
        assert!(decode_frame(br#"{"type":"envelope","agentId":"a"}"#).is_err());
    }

    #[tokio::test]
    async fn frames_survive_a_byte_stream() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = framed(a);
        let mut reader = framed(b);

        let big = vec![7u8; 10_000];
        let first = Frame::Envelope(Envelope::new(Event::StartPty, "a", "s", big.clone()));
        let second = Frame::Envelope(Envelope::new(Event::Stop, "a", "t", Vec::new()));

        let send = async {
            writer.send(encode_frame(&first).unwrap()).await.unwrap();
            writer.send(encode_frame(&second).unwrap()).await.unwrap();
        };
        let recv = async {
            let one = reader.next().await.unwrap().unwrap();
            let two = reader.next().await.unwrap().unwrap();
            (decode_frame(&one).unwrap(), decode_frame(&two).unwrap())
        };
        let ((), (one, two)) = tokio::join!(send, recv);
        assert_eq!(one, first);
        assert_eq!(two, second);
    }
}
