//! `GET /api/agents/{id}/logs` — follow an agent's proxy log over WebSocket.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth;
use crate::bridge::{logs::LogTail, terminal};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub token: Option<String>,
}

pub async fn logs_upgrade(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<LogsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = auth::check_query_token(&state.config.master.api_key, query.token.as_deref()) {
        return resp;
    }

    let timeout = state.transport.default_timeout();
    let tail = match LogTail::start(state.registry(), &agent_id, timeout).await {
        Ok(tail) => tail,
        Err(e) => {
            warn!(agent_id = %agent_id, "Log stream start failed: {e}");
            return e.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let (source, sink) = terminal::split(socket);
        let reason = tail.run(source, sink).await;
        info!(agent_id = %agent_id, reason = ?reason, "Log websocket closed");
    })
}
