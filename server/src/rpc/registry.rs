//! Connection registry: at most one live connection per agent identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pending::PendingCalls;
use super::session::SessionTable;
use crate::error::TransportError;
use crate::protocol::{Envelope, Event, VersionInfo};

/// Where an inbound envelope ended up.
#[derive(Debug)]
pub enum Delivery {
    /// Fulfilled an outstanding call.
    Call,
    /// Forwarded to a live session.
    Session,
    /// Nothing claimed it; the envelope is handed back to the reader.
    Unmatched(Envelope),
}

/// One agent's live duplex connection.
///
/// The outbound half is an mpsc sender drained by a single writer task, so
/// frames from concurrent callers and session relays never interleave.
pub struct Connection {
    agent_id: String,
    conn_id: u64,
    peer: Option<String>,
    version: Option<VersionInfo>,
    outbound: mpsc::Sender<Envelope>,
    pending: Arc<PendingCalls>,
    sessions: SessionTable,
    epoch: Instant,
    connected_since: Instant,
    last_seen_ms: AtomicU64,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Generation number, unique per registry.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn version(&self) -> Option<&VersionInfo> {
        self.version.as_ref()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` once the connection is closed.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Queue an envelope for the writer. Fails cleanly once the connection is
    /// closed or its writer is gone.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionLost("connection closed".into()));
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| TransportError::ConnectionLost("writer stopped".into()))
    }

    /// Queue without waiting. Returns `false` when the queue is full or the
    /// connection is gone; the envelope is dropped.
    pub fn try_send(&self, envelope: Envelope) -> bool {
        !self.is_closed() && self.outbound.try_send(envelope).is_ok()
    }

    /// One-shot request/reply on this connection.
    ///
    /// The deadline covers both queuing the request and waiting for the
    /// reply. Whatever the outcome, no waiter is left behind.
    pub async fn call(
        &self,
        event: Event,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        let session_id = Uuid::new_v4().to_string();
        let waiter = self.pending.register(&session_id)?;
        // `close` flags first and drains second, so a waiter registered
        // before this check is guaranteed to be drained.
        if self.is_closed() {
            return Err(TransportError::ConnectionLost("connection closed".into()));
        }
        let request = Envelope::new(event, self.agent_id.clone(), session_id, data);
        let exchange = async move {
            self.send(request).await?;
            waiter.wait().await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(agent_id = %self.agent_id, ?timeout, "Call timed out");
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Register a session route bound to this connection.
    pub fn open_session(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<(SessionSender, SessionInbound), TransportError> {
        let inbound = self.sessions.insert(session_id);
        if self.is_closed() {
            self.sessions.remove(session_id);
            return Err(TransportError::ConnectionLost("connection closed".into()));
        }
        let sender = SessionSender {
            conn: Arc::clone(self),
            session_id: session_id.to_string(),
        };
        let inbound = SessionInbound {
            conn: Arc::clone(self),
            session_id: session_id.to_string(),
            rx: inbound,
        };
        Ok((sender, inbound))
    }

    /// Route an inbound envelope: pending call first, then session.
    pub fn deliver(&self, envelope: Envelope) -> Delivery {
        if envelope.session_id().is_empty() {
            return Delivery::Unmatched(envelope);
        }
        let envelope = match self.pending.fulfill(envelope) {
            Ok(()) => return Delivery::Call,
            Err(envelope) => envelope,
        };
        match self.sessions.forward(envelope) {
            Ok(()) => Delivery::Session,
            Err(envelope) => Delivery::Unmatched(envelope),
        }
    }

    /// Tear the connection down. Every pending call resolves to
    /// connection-lost and every session stream ends. Returns `false` if the
    /// connection was already closed.
    pub fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(true);
        let failed = self
            .pending
            .fail_all(&TransportError::ConnectionLost(reason.to_string()));
        let sessions = self.sessions.close_all();
        info!(
            agent_id = %self.agent_id,
            conn_id = self.conn_id,
            failed_calls = failed,
            closed_sessions = sessions,
            "Connection closed: {reason}"
        );
        true
    }

    fn summary(&self) -> AgentSummary {
        #[allow(clippy::cast_possible_truncation)]
        let connected_ms = self.connected_since.elapsed().as_millis() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let idle_ms = self.idle_for().as_millis() as u64;
        AgentSummary {
            agent_id: self.agent_id.clone(),
            conn_id: self.conn_id,
            peer: self.peer.clone(),
            version: self.version.clone(),
            connected_for_ms: connected_ms,
            last_seen_ago_ms: idle_ms,
            pending_calls: self.pending.len(),
            sessions: self.sessions.len(),
        }
    }
}

/// Outbound half of a session, bound to the connection that owns it.
#[derive(Clone)]
pub struct SessionSender {
    conn: Arc<Connection>,
    session_id: String,
}

impl SessionSender {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent_id(&self) -> &str {
        self.conn.agent_id()
    }

    pub async fn send(&self, event: Event, data: Vec<u8>) -> Result<(), TransportError> {
        let envelope = Envelope::new(event, self.conn.agent_id(), self.session_id.clone(), data);
        self.conn.send(envelope).await
    }
}

/// Inbound half of a session. Dropping it unregisters the route.
pub struct SessionInbound {
    conn: Arc<Connection>,
    session_id: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl SessionInbound {
    /// Next envelope for this session; `None` once the route is gone
    /// (session removed or connection closed).
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Drop for SessionInbound {
    fn drop(&mut self) {
        self.conn.sessions.remove(&self.session_id);
    }
}

/// Row in the `/api/agents` listing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub conn_id: u64,
    pub peer: Option<String>,
    pub version: Option<VersionInfo>,
    pub connected_for_ms: u64,
    pub last_seen_ago_ms: u64,
    pub pending_calls: usize,
    pub sessions: usize,
}

/// Live connections keyed by agent id.
pub struct Registry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    epoch: Instant,
    next_conn_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Build a connection record around an outbound channel. The caller owns
    /// the receiving end and must drain it onto the wire.
    pub fn connection(
        &self,
        agent_id: &str,
        version: Option<VersionInfo>,
        peer: Option<String>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Arc<Connection> {
        let (shutdown_tx, _) = watch::channel(false);
        let conn = Connection {
            agent_id: agent_id.to_string(),
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            peer,
            version,
            outbound,
            pending: Arc::new(PendingCalls::new()),
            sessions: SessionTable::new(),
            epoch: self.epoch,
            connected_since: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown_tx,
        };
        conn.touch();
        Arc::new(conn)
    }

    /// Install `conn` as the live connection for its agent. A superseded
    /// connection is closed, failing its pending calls and sessions.
    pub async fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = {
            let mut connections = self.connections.write().await;
            connections.insert(conn.agent_id.clone(), Arc::clone(&conn))
        };
        if let Some(old) = &previous {
            warn!(
                agent_id = %conn.agent_id,
                old_conn = old.conn_id,
                new_conn = conn.conn_id,
                "Agent re-registered, evicting previous connection"
            );
            old.close("replaced by new connection");
        } else {
            info!(agent_id = %conn.agent_id, conn_id = conn.conn_id, "Agent registered");
        }
        previous
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(agent_id).cloned()
    }

    /// Like [`Registry::lookup`] but with the offline case as an error.
    pub async fn require(&self, agent_id: &str) -> Result<Arc<Connection>, TransportError> {
        self.lookup(agent_id)
            .await
            .ok_or_else(|| TransportError::Offline(agent_id.to_string()))
    }

    /// Close `conn` and drop it from the map if it is still the live entry.
    /// A newer connection for the same agent is left alone.
    pub async fn remove(&self, conn: &Connection, reason: &str) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&conn.agent_id) {
                Some(current) if current.conn_id == conn.conn_id => {
                    connections.remove(&conn.agent_id);
                    true
                }
                _ => false,
            }
        };
        conn.close(reason);
        removed
    }

    pub async fn list(&self) -> Vec<AgentSummary> {
        let connections = self.connections.read().await;
        let mut rows: Vec<AgentSummary> = connections.values().map(|c| c.summary()).collect();
        rows.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        rows
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Evict connections with no inbound traffic for longer than `timeout`.
    /// Returns the evicted agent ids.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let stale: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write().await;
            let ids: Vec<String> = connections
                .iter()
                .filter(|(_, c)| c.idle_for() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };
        stale
            .into_iter()
            .map(|conn| {
                warn!(agent_id = %conn.agent_id, idle = ?conn.idle_for(), "Evicted agent (heartbeat timeout)");
                conn.close("heartbeat timeout");
                conn.agent_id.clone()
            })
            .collect()
    }

    /// Periodic [`Registry::sweep_stale`] until the task is aborted.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = self.sweep_stale(timeout).await;
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "Sweep evicted stale agents");
            }
        }
    }

    /// Close and forget every connection (server shutdown).
    pub async fn drain_all(&self, reason: &str) -> usize {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, c)| c).collect()
        };
        for conn in &drained {
            conn.close(reason);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_conn(registry: &Registry, agent_id: &str) -> (Arc<Connection>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(64);
        (registry.connection(agent_id, None, None, tx), rx)
    }

    #[tokio::test]
    async fn lookup_misses_are_offline() {
        let registry = Registry::new();
        assert!(registry.lookup("edge-1").await.is_none());
        assert_eq!(
            registry.require("edge-1").await.err(),
            Some(TransportError::Offline("edge-1".into()))
        );
    }

    #[tokio::test]
    async fn replacement_fails_every_pending_call_once() {
        let registry = Registry::new();
        let (old, mut wire) = fake_conn(&registry, "edge-1");
        registry.register(Arc::clone(&old)).await;

        let mut calls = Vec::new();
        for _ in 0..4 {
            let conn = Arc::clone(&old);
            calls.push(tokio::spawn(async move {
                conn.call(Event::GetStatus, Vec::new(), Duration::from_secs(30)).await
            }));
        }
        for _ in 0..4 {
            wire.recv().await.unwrap();
        }
        assert_eq!(old.pending_calls(), 4);

        let (new, _wire2) = fake_conn(&registry, "edge-1");
        let replaced = registry.register(Arc::clone(&new)).await.unwrap();
        assert_eq!(replaced.conn_id(), old.conn_id());

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(TransportError::ConnectionLost(_))
            ));
        }
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(old.pending_calls(), 0);
        assert!(!old.close("again"));
    }

    #[tokio::test]
    async fn stale_generation_does_not_remove_newer_connection() {
        let registry = Registry::new();
        let (old, _w1) = fake_conn(&registry, "edge-1");
        let (new, _w2) = fake_conn(&registry, "edge-1");
        registry.register(Arc::clone(&old)).await;
        registry.register(Arc::clone(&new)).await;

        assert!(!registry.remove(&old, "reader exited").await);
        let live = registry.lookup("edge-1").await.unwrap();
        assert_eq!(live.conn_id(), new.conn_id());
    }

    #[tokio::test]
    async fn send_after_close_fails_cleanly() {
        let registry = Registry::new();
        let (conn, _wire) = fake_conn(&registry, "edge-1");
        registry.register(Arc::clone(&conn)).await;
        registry.remove(&conn, "gone").await;

        let env = Envelope::new(Event::Stop, "edge-1", "x", Vec::new());
        assert!(matches!(
            conn.send(env).await,
            Err(TransportError::ConnectionLost(_))
        ));
        assert!(matches!(
            conn.call(Event::Stop, Vec::new(), Duration::from_secs(1)).await,
            Err(TransportError::ConnectionLost(_))
        ));
        assert!(conn.open_session("pty-1").is_err());
    }

    #[tokio::test]
    async fn deliver_prefers_pending_then_session() {
        let registry = Registry::new();
        let (conn, mut wire) = fake_conn(&registry, "edge-1");
        let (_tx, mut inbound) = conn.open_session("pty-1").unwrap();

        let caller = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.call(Event::GetProxyInfo, Vec::new(), Duration::from_secs(5)).await
            })
        };
        let request = wire.recv().await.unwrap();
        assert!(matches!(
            conn.deliver(request.reply(Event::GetProxyInfo, b"cfg".to_vec())),
            Delivery::Call
        ));
        assert_eq!(caller.await.unwrap().unwrap().data(), b"cfg");

        let chunk = Envelope::new(Event::StartPty, "edge-1", "pty-1", b"out".to_vec());
        assert!(matches!(conn.deliver(chunk), Delivery::Session));
        assert_eq!(inbound.recv().await.unwrap().data(), b"out");

        let late = Envelope::new(Event::Pong, "edge-1", "nobody", Vec::new());
        assert!(matches!(conn.deliver(late), Delivery::Unmatched(_)));
    }

    #[tokio::test]
    async fn dropping_inbound_unregisters_session() {
        let registry = Registry::new();
        let (conn, _wire) = fake_conn(&registry, "edge-1");
        let (_tx, inbound) = conn.open_session("pty-1").unwrap();
        assert_eq!(conn.sessions().len(), 1);
        drop(inbound);
        assert!(conn.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_idle_connections() {
        let registry = Registry::new();
        let (quiet, _w1) = fake_conn(&registry, "quiet");
        let (chatty, _w2) = fake_conn(&registry, "chatty");
        registry.register(Arc::clone(&quiet)).await;
        registry.register(Arc::clone(&chatty)).await;

        tokio::time::advance(Duration::from_secs(60)).await;
        chatty.touch();
        tokio::time::advance(Duration::from_secs(40)).await;

        let evicted = registry.sweep_stale(Duration::from_secs(90)).await;
        assert_eq!(evicted, vec!["quiet".to_string()]);
        assert!(quiet.is_closed());
        assert!(registry.lookup("chatty").await.is_some());
    }

    #[tokio::test]
    async fn drain_all_closes_everything() {
        let registry = Registry::new();
        let (a, _w1) = fake_conn(&registry, "a");
        let (b, _w2) = fake_conn(&registry, "b");
        registry.register(Arc::clone(&a)).await;
        registry.register(Arc::clone(&b)).await;
        assert_eq!(registry.list().await.len(), 2);
        assert_eq!(registry.drain_all("shutdown").await, 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.len().await, 0);
    }
}
