//! Live session routes on one connection.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// Session id → inbound channel of the bridge that owns the session.
///
/// Channels are unbounded so the connection reader never stalls behind a
/// slow terminal; per-session order is the order envelopes were read off
/// the wire.
#[derive(Default)]
pub struct SessionTable {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Envelope>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session_id` and return its inbound stream. An existing route
    /// with the same id is replaced; its receiver observes end-of-stream.
    pub fn insert(&self, session_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(session_id.to_string(), tx);
        rx
    }

    /// Forward a session-tagged envelope. Hands the envelope back if no live
    /// route exists.
    pub fn forward(&self, envelope: Envelope) -> Result<(), Envelope> {
        let mut routes = self.lock();
        let Some(tx) = routes.get(envelope.session_id()) else {
            return Err(envelope);
        };
        match tx.send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(envelope)) => {
                // Owner went away without unregistering.
                routes.remove(envelope.session_id());
                Err(envelope)
            }
        }
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Drop every route. Owners see their inbound stream end, which is how a
    /// bridge learns the agent connection is gone.
    pub fn close_all(&self) -> usize {
        let mut routes = self.lock();
        let count = routes.len();
        routes.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Event;

    fn tagged(session_id: &str, body: &str) -> Envelope {
        Envelope::new(Event::StartPty, "edge-1", session_id, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn forward_preserves_order() {
        let table = SessionTable::new();
        let mut rx = table.insert("pty-1");
        for i in 0..20 {
            assert!(table.forward(tagged("pty-1", &i.to_string())).is_ok());
        }
        for i in 0..20 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.data_str(), i.to_string());
        }
    }

    #[test]
    fn unknown_session_is_handed_back() {
        let table = SessionTable::new();
        let env = table.forward(tagged("ghost", "x")).unwrap_err();
        assert_eq!(env.session_id(), "ghost");
    }

    #[test]
    fn dead_owner_is_pruned() {
        let table = SessionTable::new();
        let rx = table.insert("pty-1");
        drop(rx);
        assert!(table.forward(tagged("pty-1", "x")).is_err());
        assert!(!table.contains("pty-1"));
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let table = SessionTable::new();
        let mut a = table.insert("a");
        let mut b = table.insert("b");
        assert_eq!(table.close_all(), 2);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(table.is_empty());
    }
}
