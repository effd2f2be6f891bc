//! `GET /api/agents/{id}/pty` — interactive shell on an agent over WebSocket.
//!
//! The agent session is started before the upgrade is accepted, so an
//! offline agent or a failed `start-pty` surfaces as an ordinary HTTP error.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth;
use crate::bridge::{terminal, PtyBridge};
use crate::protocol::PtyStartRequest;
use crate::state::AppState;

/// Query parameters for the upgrade request. Sizes are taken as strings so
/// malformed values can be rejected with a JSON 400.
#[derive(Debug, Default, Deserialize)]
pub struct PtyQuery {
    pub token: Option<String>,
    pub height: Option<String>,
    pub width: Option<String>,
}

fn parse_dimension(name: &str, raw: Option<&str>) -> Result<Option<u16>, Response> {
    let Some(raw) = raw.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<u16>().map(Some).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid {name}: {raw}"), "code": "BAD_REQUEST"})),
        )
            .into_response()
    })
}

/// Validate the query into a start request. Runs before any agent traffic.
pub fn start_request(query: &PtyQuery) -> Result<PtyStartRequest, Response> {
    Ok(PtyStartRequest {
        height: parse_dimension("height", query.height.as_deref())?,
        width: parse_dimension("width", query.width.as_deref())?,
    })
}

pub async fn pty_upgrade(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<PtyQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = auth::check_query_token(&state.config.master.api_key, query.token.as_deref()) {
        return resp;
    }
    let request = match start_request(&query) {
        Ok(request) => request,
        Err(resp) => return resp,
    };

    let bridge = match PtyBridge::start(state.registry(), &agent_id, request, state.bridge).await {
        Ok(bridge) => bridge,
        Err(e) => {
            warn!(agent_id = %agent_id, "PTY start failed: {e}");
            return e.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let (source, sink) = terminal::split(socket);
        let report = bridge.run(source, sink).await;
        info!(
            agent_id = %agent_id,
            session_id = %report.session_id,
            reason = ?report.reason,
            "PTY websocket closed"
        );
    })
}
