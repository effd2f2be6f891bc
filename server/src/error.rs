//! Transport-level error taxonomy.
//!
//! Every outcome a master-side caller can observe from the RPC layer other
//! than a successful reply is one of these variants. Handler failures on the
//! agent side travel back as `error` envelopes and surface here as
//! [`TransportError::Remote`] only when the caller asks for it
//! (see [`crate::rpc::Transport::call_ok`]).

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No live connection is registered for the agent.
    #[error("agent '{0}' is offline")]
    Offline(String),
    /// The call deadline elapsed before a matching reply arrived.
    #[error("agent did not respond within {0:?}")]
    Timeout(Duration),
    /// The physical connection closed (or was superseded) while the call or
    /// session was outstanding.
    #[error("connection to agent lost: {0}")]
    ConnectionLost(String),
    /// Malformed envelope, unknown event, or a correlation-key collision.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The agent answered with an `error` envelope.
    #[error("agent error: {0}")]
    Remote(String),
}

impl TransportError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Offline(_) => "AGENT_OFFLINE",
            Self::Timeout(_) => "TIMEOUT",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Remote(_) => "AGENT_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Offline(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ConnectionLost(_) | Self::Remote(_) => StatusCode::BAD_GATEWAY,
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.to_string(), "code": self.code()});
        (self.status(), Json(body)).into_response()
    }
}
