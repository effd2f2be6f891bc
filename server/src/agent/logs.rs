//! Log streaming: follow the agent's log file and ship appended bytes to
//! the master as `start-log-stream` envelopes tagged with the stream id.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::protocol::{Envelope, Event};

/// Bytes of existing log replayed when a stream starts.
const BACKLOG: u64 = 8 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CHUNK: usize = 16 * 1024;

struct Stream {
    attach: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Active log streams on one master connection.
#[derive(Default)]
pub struct LogStreams {
    inner: Mutex<HashMap<String, Stream>>,
}

impl LogStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Stream>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start following `path`. Nothing is sent until the master attaches.
    pub fn start(
        &self,
        agent_id: &str,
        outbound: mpsc::Sender<Envelope>,
        path: &Path,
    ) -> Result<String, String> {
        if !path.is_file() {
            return Err(format!("log file not found: {}", path.display()));
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let (attach_tx, attach_rx) = oneshot::channel();
        let task = tokio::spawn(follow(
            path.to_path_buf(),
            agent_id.to_string(),
            session_id.clone(),
            outbound,
            attach_rx,
        ));
        self.lock().insert(
            session_id.clone(),
            Stream {
                attach: Some(attach_tx),
                task,
            },
        );
        info!(session_id = %session_id, path = %path.display(), "Log stream started");
        Ok(session_id)
    }

    /// Mark a stream attached. Returns `false` for unknown ids.
    pub fn route(&self, envelope: &Envelope) -> bool {
        let mut streams = self.lock();
        let Some(stream) = streams.get_mut(envelope.session_id()) else {
            return false;
        };
        if let Some(gate) = stream.attach.take() {
            let _ = gate.send(());
        }
        true
    }

    pub fn stop(&self, session_id: &str) -> Result<(), String> {
        let stream = self
            .lock()
            .remove(session_id)
            .ok_or_else(|| format!("unknown log stream: {session_id}"))?;
        stream.task.abort();
        info!(session_id, "Log stream stopped");
        Ok(())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, stream) in &drained {
            stream.task.abort();
        }
        drained.len()
    }
}

async fn follow(
    path: PathBuf,
    agent_id: String,
    session_id: String,
    outbound: mpsc::Sender<Envelope>,
    attach: oneshot::Receiver<()>,
) {
    if attach.await.is_err() {
        return;
    }
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            let _ = outbound
                .send(Envelope::new(
                    Event::Error,
                    agent_id.as_str(),
                    session_id.as_str(),
                    format!("cannot open {}: {e}", path.display()),
                ))
                .await;
            return;
        }
    };
    let mut pos = match file.metadata().await {
        Ok(meta) => meta.len().saturating_sub(BACKLOG),
        Err(_) => 0,
    };
    let mut buf = vec![0u8; CHUNK];
    loop {
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!("Log file unavailable: {e}");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };
        if len < pos {
            // Truncated or rotated in place.
            pos = 0;
            match tokio::fs::File::open(&path).await {
                Ok(reopened) => file = reopened,
                Err(_) => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            }
        }
        if len == pos {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }
        if file.seek(SeekFrom::Start(pos)).await.is_err() {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }
        match file.read(&mut buf).await {
            Ok(0) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(n) => {
                pos += n as u64;
                let env = Envelope::new(
                    Event::StartLogStream,
                    agent_id.as_str(),
                    session_id.as_str(),
                    buf[..n].to_vec(),
                );
                if outbound.send(env).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Log read failed: {e}");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}
