//! Agent fleet endpoints.
//!
//! - `GET /api/agents` — live connections
//! - `POST /api/agents/{id}/rpc` — one request/reply call to an agent

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::TransportError;
use crate::protocol::Event;
use crate::rpc::AgentSummary;
use crate::state::AppState;

/// `GET /api/agents` — every live agent connection, sorted by id.
pub async fn list(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    Json(state.registry().list().await)
}

/// Request body for `POST /api/agents/{id}/rpc`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    /// Wire name of the event, e.g. `get-status`.
    pub event: String,
    /// Base64 payload. Omitted means empty.
    #[serde(default)]
    pub data: Option<String>,
    /// Per-call deadline. Defaults to `master.call_timeout_secs`.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub event: Event,
    /// Base64 payload of the reply.
    pub data: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into(), "code": "BAD_REQUEST"})),
    )
        .into_response()
}

/// Events that open sessions or belong to the liveness/error plumbing are
/// not valid one-shot calls.
fn callable(event: &Event) -> Result<(), String> {
    match event {
        Event::StartPty => Err("start-pty is only available through /pty".into()),
        Event::StartLogStream => Err("start-log-stream is only available through /logs".into()),
        Event::Pong | Event::Error => Err(format!("{event} cannot be sent as a request")),
        Event::Unknown(name) => Err(format!("unknown event: {name}")),
        _ => Ok(()),
    }
}

/// `POST /api/agents/{id}/rpc` — send one event and wait for the reply.
///
/// # Errors
///
/// - `400` with `{"code":"BAD_REQUEST"}` — unknown/unsupported event or bad base64
/// - `404` `AGENT_OFFLINE`, `504` `TIMEOUT`, `502` `CONNECTION_LOST` / `AGENT_ERROR`
pub async fn rpc(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RpcResponse>, Response> {
    let event = Event::from_wire(&request.event);
    callable(&event).map_err(bad_request)?;
    let data = match request.data.as_deref() {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| bad_request(format!("invalid base64 data: {e}")))?,
        None => Vec::new(),
    };
    let timeout = request.timeout_secs.map(Duration::from_secs);

    debug!(agent_id = %agent_id, event = %event, "Forwarding RPC");
    let reply = state
        .transport
        .call(&agent_id, event, data, timeout)
        .await
        .map_err(IntoResponse::into_response)?;
    if *reply.event() == Event::Error {
        return Err(TransportError::Remote(reply.data_str()).into_response());
    }
    let event = reply.event().clone();
    Ok(Json(RpcResponse {
        event,
        data: STANDARD.encode(reply.data()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::{fake_agent, test_state};

    fn request(event: &str, data: Option<&str>, timeout_secs: Option<u64>) -> Json<RpcRequest> {
        Json(RpcRequest {
            event: event.into(),
            data: data.map(String::from),
            timeout_secs,
        })
    }

    #[tokio::test]
    async fn offline_agent_is_404() {
        let state = test_state();
        let err = rpc(State(state), Path("ghost".into()), request("get-status", None, None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_event_and_bad_base64_are_400() {
        let state = test_state();
        let err = rpc(State(state.clone()), Path("a".into()), request("reboot", None, None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = rpc(State(state), Path("a".into()), request("update-config", Some("%%%"), None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reply_payload_is_returned_base64() {
        let state = test_state();
        let (conn, mut wire) = fake_agent(&state, "edge-1").await;
        let agent = tokio::spawn(async move {
            let req = wire.recv().await.unwrap();
            assert_eq!(req.event(), &Event::UpdateConfig);
            assert_eq!(req.data(), b"[common]");
            conn.deliver(req.reply(Event::UpdateConfig, b"ok".to_vec()));
        });

        let Json(resp) = rpc(
            State(state),
            Path("edge-1".into()),
            request("update-config", Some(&STANDARD.encode("[common]")), None),
        )
        .await
        .unwrap();
        agent.await.unwrap();
        assert_eq!(resp.event, Event::UpdateConfig);
        assert_eq!(resp.data, STANDARD.encode("ok"));
    }

    #[tokio::test]
    async fn error_reply_is_502() {
        let state = test_state();
        let (conn, mut wire) = fake_agent(&state, "edge-1").await;
        tokio::spawn(async move {
            let req = wire.recv().await.unwrap();
            conn.deliver(req.error_reply("proxy not configured"));
        });
        let err = rpc(State(state), Path("edge-1".into()), request("start", None, None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out_with_504() {
        let state = test_state();
        let (_conn, _wire) = fake_agent(&state, "edge-1").await;
        let err = rpc(State(state), Path("edge-1".into()), request("get-proxy-info", None, Some(2)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn list_shows_registered_agents() {
        let state = test_state();
        let _a = fake_agent(&state, "edge-b").await;
        let _b = fake_agent(&state, "edge-a").await;
        let Json(agents) = list(State(state)).await;
        let ids: Vec<_> = agents.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, ["edge-a", "edge-b"]);
    }
}
