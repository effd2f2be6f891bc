//! Outstanding one-shot calls awaiting their reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::protocol::Envelope;

type Waiter = oneshot::Sender<Result<Envelope, TransportError>>;

/// Waiters keyed by correlation id.
///
/// Each waiter is resolved at most once: whichever of reply, timeout cleanup
/// or connection loss removes it from the map first wins, and every later
/// attempt finds nothing and is a no-op.
#[derive(Default)]
pub struct PendingCalls {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a waiter under `session_id`.
    ///
    /// The returned [`PendingCall`] removes the entry when dropped, so a
    /// caller that times out or is cancelled leaves nothing behind.
    pub fn register(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<PendingCall, TransportError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        if waiters.contains_key(session_id) {
            return Err(TransportError::Protocol(format!(
                "session id {session_id} already has a pending call"
            )));
        }
        waiters.insert(session_id.to_string(), tx);
        Ok(PendingCall {
            session_id: session_id.to_string(),
            rx: Some(rx),
            table: Arc::clone(self),
        })
    }

    /// Deliver a reply. When no waiter matches (late or unexpected message)
    /// the envelope is handed back so the caller can try other routes.
    pub fn fulfill(&self, envelope: Envelope) -> Result<(), Envelope> {
        let waiter = self.lock().remove(envelope.session_id());
        match waiter {
            Some(tx) => {
                // A dropped receiver means the caller already gave up.
                let _ = tx.send(Ok(envelope));
                Ok(())
            }
            None => Err(envelope),
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    fn remove(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    /// Resolve every waiter with `err`. Returns how many were resolved.
    pub fn fail_all(&self, err: &TransportError) -> usize {
        let drained: Vec<Waiter> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Caller-side handle for one parked call.
pub struct PendingCall {
    session_id: String,
    rx: Option<oneshot::Receiver<Result<Envelope, TransportError>>>,
    table: Arc<PendingCalls>,
}

impl PendingCall {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for resolution. A closed channel means the table was torn down
    /// without an explicit error, which is reported as connection loss.
    pub async fn wait(mut self) -> Result<Envelope, TransportError> {
        let Some(rx) = self.rx.take() else {
            return Err(TransportError::ConnectionLost("waiter already consumed".into()));
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionLost("connection closed".into())),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.remove(&self.session_id);
    }
}
