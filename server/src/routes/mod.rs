//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication: REST routes via the
//! [`crate::auth::require_api_key`] middleware, WebSocket upgrades via a
//! `?token=` query parameter.

pub mod agents;
pub mod health;
pub mod logs;
pub mod pty;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::state::AppState;

/// The master's full HTTP surface.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/agents", get(agents::list))
        .route("/api/agents/{id}/rpc", post(agents::rpc))
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/api/agents/{id}/pty", get(pty::pty_upgrade))
        .route("/api/agents/{id}/logs", get(logs::logs_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.master.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::config::Config;
    use crate::protocol::Envelope;
    use crate::rpc::{Connection, Registry};
    use crate::state::AppState;

    /// State with an empty registry and a known API key.
    pub(crate) fn test_state() -> AppState {
        let mut config = Config::default();
        config.master.api_key = "test-key".into();
        AppState::new(Arc::new(config), Arc::new(Registry::new()))
    }

    /// Register a channel-backed agent; the receiver sees what the master sends.
    pub(crate) async fn fake_agent(
        state: &AppState,
        agent_id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = state.registry().connection(agent_id, None, None, tx);
        state.registry().register(Arc::clone(&conn)).await;
        (conn, rx)
    }

    #[test]
    fn router_builds() {
        let _ = super::router(test_state());
    }
}
