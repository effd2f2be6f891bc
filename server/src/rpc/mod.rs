//! Master-side RPC over agent connections.
//!
//! ```text
//! pending.rs   — PendingCalls: one-shot waiters keyed by session id
//! session.rs   — SessionTable: session id → inbound stream
//! registry.rs  — Connection + Registry (one live connection per agent)
//! acceptor.rs  — handshake, reader/writer tasks for one physical stream
//! ```
//!
//! [`Transport`] is the handle the rest of the master uses: it is built once
//! at startup around a [`Registry`] and cloned into every consumer.

pub mod acceptor;
pub mod pending;
pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

pub use registry::{AgentSummary, Connection, Delivery, Registry, SessionInbound, SessionSender};

use crate::error::TransportError;
use crate::protocol::{Envelope, Event};

#[derive(Clone)]
pub struct Transport {
    registry: Arc<Registry>,
    default_timeout: Duration,
}

impl Transport {
    pub fn new(registry: Arc<Registry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `event` to `agent_id` and wait for the correlated reply.
    ///
    /// Resolves to the reply envelope (which may itself be an `error`
    /// envelope), or to offline, timeout or connection-lost. Calls on the
    /// same connection are independent of each other.
    pub async fn call(
        &self,
        agent_id: &str,
        event: Event,
        data: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Envelope, TransportError> {
        let conn = self.registry.require(agent_id).await?;
        conn.call(event, data, timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// [`Transport::call`], treating an `error` reply as a failure and
    /// returning just the payload otherwise.
    pub async fn call_ok(
        &self,
        agent_id: &str,
        event: Event,
        data: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let reply = self.call(agent_id, event, data, timeout).await?;
        into_payload(reply)
    }
}

/// Split a reply into its payload, mapping `error` envelopes to
/// [`TransportError::Remote`].
pub fn into_payload(reply: Envelope) -> Result<Vec<u8>, TransportError> {
    if *reply.event() == Event::Error {
        return Err(TransportError::Remote(reply.data_str()));
    }
    Ok(reply.into_data())
}
