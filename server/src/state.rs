//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::BridgeConfig;
use crate::config::Config;
use crate::rpc::{Registry, Transport};

/// Shared state for the master's HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the master started (for uptime calculation).
    pub start_time: Instant,
    /// Request/reply facade over the connection registry.
    pub transport: Transport,
    /// Tuning applied to every PTY bridge.
    pub bridge: BridgeConfig,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>) -> Self {
        let transport = Transport::new(registry, config.master.call_timeout());
        let bridge = BridgeConfig {
            keepalive_timeout: Duration::from_secs(config.pty.keepalive_timeout_secs),
            error_limit: config.pty.error_limit,
            start_timeout: Duration::from_secs(config.pty.start_timeout_secs),
        };
        Self {
            config,
            start_time: Instant::now(),
            transport,
            bridge,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.transport.registry()
    }
}
