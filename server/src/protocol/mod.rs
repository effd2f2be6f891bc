//! Master ⇄ agent envelope protocol.
//!
//! One [`Envelope`] is the unit of every exchange on an agent connection:
//! one-shot calls, their replies, and the tagged messages of long-lived
//! sessions (interactive shell, log tail). The `session_id` is the only
//! correlation key; ordering between unrelated calls is not guaranteed.
//!
//! ## Events
//!
//! | Wire name                | Direction        | Payload                               |
//! |--------------------------|------------------|---------------------------------------|
//! | `update-config`          | master → agent   | proxy configuration (opaque bytes)    |
//! | `remove-config`          | master → agent   | —                                     |
//! | `start` / `stop`         | master → agent   | —                                     |
//! | `get-status`             | master → agent   | reply: [`AgentStatus`] JSON           |
//! | `start-log-stream`       | both             | reply: session id; then log lines     |
//! | `stop-log-stream`        | master → agent   | session id                            |
//! | `start-pty`              | both             | [`PtyStartRequest`]; then PTY frames  |
//! | `get-proxy-info`         | master → agent   | reply: proxy configuration            |
//! | `create-worker` etc.     | master → agent   | worker spec (opaque bytes)            |
//! | `ping` / `pong`          | both             | [`VersionInfo`] JSON                  |
//! | `error`                  | both             | UTF-8 message                         |

pub mod codec;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use codec::{decode_frame, encode_frame, framed, Frame, RpcFramed, RPC_PREFACE};

/// Wire protocol revision carried in handshakes and pongs.
pub const PROTOCOL_VERSION: u32 = 1;

/// Data payload that terminates a PTY session in either direction.
pub const PTY_SENTINEL: &[u8] = b"bye!";

/// Closed set of envelope kinds.
///
/// Names that are not recognized decode to [`Event::Unknown`] so receivers
/// can answer with an explicit error instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    UpdateConfig,
    RemoveConfig,
    Start,
    Stop,
    GetStatus,
    StartLogStream,
    StopLogStream,
    StartPty,
    GetProxyInfo,
    CreateWorker,
    RemoveWorker,
    GetWorkerStatus,
    InstallWorkerRuntime,
    Ping,
    Pong,
    Error,
    Unknown(String),
}

impl Event {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UpdateConfig => "update-config",
            Self::RemoveConfig => "remove-config",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::GetStatus => "get-status",
            Self::StartLogStream => "start-log-stream",
            Self::StopLogStream => "stop-log-stream",
            Self::StartPty => "start-pty",
            Self::GetProxyInfo => "get-proxy-info",
            Self::CreateWorker => "create-worker",
            Self::RemoveWorker => "remove-worker",
            Self::GetWorkerStatus => "get-worker-status",
            Self::InstallWorkerRuntime => "install-worker-runtime",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Unknown(name) => name,
        }
    }

    pub fn from_wire(name: &str) -> Self {
        match name {
            "update-config" => Self::UpdateConfig,
            "remove-config" => Self::RemoveConfig,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "get-status" => Self::GetStatus,
            "start-log-stream" => Self::StartLogStream,
            "stop-log-stream" => Self::StopLogStream,
            "start-pty" => Self::StartPty,
            "get-proxy-info" => Self::GetProxyInfo,
            "create-worker" => Self::CreateWorker,
            "remove-worker" => Self::RemoveWorker,
            "get-worker-status" => Self::GetWorkerStatus,
            "install-worker-runtime" => Self::InstallWorkerRuntime,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&name))
    }
}

/// A single immutable protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    event: Event,
    agent_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default, with = "codec::base64_bytes")]
    data: Vec<u8>,
}

impl Envelope {
    pub fn new(
        event: Event,
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            event,
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    /// Build the reply to `self`: same agent and correlation key.
    pub fn reply(&self, event: Event, data: impl Into<Vec<u8>>) -> Self {
        Self::new(event, self.agent_id.clone(), self.session_id.clone(), data)
    }

    /// Build an `error` reply carrying a human-readable message.
    pub fn error_reply(&self, message: &str) -> Self {
        self.reply(Event::Error, message.as_bytes().to_vec())
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Lossy UTF-8 view of the payload, used for error messages and ids.
    pub fn data_str(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Version metadata exchanged in handshakes and ping/pong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub protocol: u32,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// `start-pty` request payload: optional initial terminal size.
///
/// Unknown fields are rejected: session traffic shares the `start-pty`
/// event, and a `{data, done}` message must not parse as a new shell request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PtyStartRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u16>,
}

/// Master → agent message inside a PTY session.
///
/// Data and resize updates share one stream so their relative order is
/// exactly the order the terminal client produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyServerMessage {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "codec::base64_opt_bytes"
    )]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u16>,
    #[serde(default)]
    pub done: bool,
}

impl PtyServerMessage {
    pub fn resize(height: u16, width: u16) -> Self {
        Self {
            height: Some(height),
            width: Some(width),
            ..Self::default()
        }
    }

    pub fn terminate() -> Self {
        Self {
            data: Some(PTY_SENTINEL.to_vec()),
            done: true,
            ..Self::default()
        }
    }
}

/// Agent → master message inside a PTY session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyClientMessage {
    #[serde(default, with = "codec::base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub done: bool,
}

impl PtyClientMessage {
    pub fn output(data: Vec<u8>) -> Self {
        Self { data, done: false }
    }

    pub fn terminate() -> Self {
        Self {
            data: PTY_SENTINEL.to_vec(),
            done: true,
        }
    }
}

/// `get-status` reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub version: VersionInfo,
    pub proxy_running: bool,
    pub pty_sessions: usize,
    pub log_streams: usize,
}

/// Serialize a JSON payload for an envelope, falling back to an empty body.
pub fn to_payload<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Parse a JSON envelope payload; an empty body decodes as `T::default()`.
pub fn from_payload<T: DeserializeOwned + Default>(data: &[u8]) -> Result<T, String> {
    if data.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(data).map_err(|e| format!("invalid payload: {e}"))
}
