//! Agent-side PTY sessions.
//!
//! Uses the `nix` crate for POSIX PTY APIs. Each session is one shell on the
//! slave side of a PTY and two tasks on the master side:
//!
//! - input: master-sent [`PtyServerMessage`]s → keystrokes / resize
//! - output: PTY reads → session-tagged `start-pty` envelopes
//!
//! Output is held back until the first session-tagged message arrives from
//! the master, so it can never reach the master before the session is
//! registered there.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{
    from_payload, to_payload, Envelope, Event, PtyClientMessage, PtyServerMessage, PtyStartRequest,
};

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;
/// Ended session ids remembered so late master messages for them are dropped.
const ENDED_MEMORY: usize = 64;

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn a shell on the slave side of the PTY.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal. stdin/stdout/stderr are all connected to the slave fd.
pub fn spawn_shell_pty(pty: &PtyPair, shell: &str, working_dir: &str) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(shell);
    cmd.arg("-l");
    cmd.current_dir(working_dir).kill_on_drop(true);
    cmd.env("TERM", "xterm-256color");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let size = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(size)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

#[derive(Default)]
struct Table {
    live: HashMap<String, mpsc::UnboundedSender<PtyServerMessage>>,
    ended: VecDeque<String>,
}

impl Table {
    fn end(&mut self, session_id: &str) {
        if self.live.remove(session_id).is_none() {
            return;
        }
        if self.ended.len() == ENDED_MEMORY {
            self.ended.pop_front();
        }
        self.ended.push_back(session_id.to_string());
    }

    fn has_ended(&self, session_id: &str) -> bool {
        self.ended.iter().any(|id| id == session_id)
    }
}

/// Live PTY sessions on one master connection, keyed by session id.
#[derive(Default)]
pub struct PtySessions {
    inner: Arc<Mutex<Table>>,
}

impl PtySessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a shell and return its session id. Output flows to `outbound`
    /// once the master's first message for the session arrives.
    pub fn start(
        &self,
        agent_id: &str,
        outbound: mpsc::Sender<Envelope>,
        request: PtyStartRequest,
        shell: &str,
        working_dir: &str,
    ) -> Result<String, String> {
        let rows = request.height.unwrap_or(DEFAULT_ROWS);
        let cols = request.width.unwrap_or(DEFAULT_COLS);
        let pty = allocate_pty(rows, cols).map_err(|e| format!("openpty failed: {e}"))?;
        let child = spawn_shell_pty(&pty, shell, working_dir)
            .map_err(|e| format!("failed to spawn {shell}: {e}"))?;
        let PtyPair { master, slave } = pty;
        // Our copy of the slave must go, or reads never see EOF.
        drop(slave);

        let reader = master.try_clone().map_err(|e| format!("dup failed: {e}"))?;
        let writer = master.try_clone().map_err(|e| format!("dup failed: {e}"))?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (attached_tx, attached_rx) = oneshot::channel();
        self.lock().live.insert(session_id.clone(), input_tx);

        let pid = child.id().and_then(|p| i32::try_from(p).ok());
        info!(session_id = %session_id, ?pid, rows, cols, "PTY session spawned");

        tokio::spawn(input_task(
            session_id.clone(),
            input_rx,
            attached_tx,
            writer,
            master,
            pid,
            (rows, cols),
        ));
        tokio::spawn(output_task(
            session_id.clone(),
            agent_id.to_string(),
            reader,
            outbound,
            attached_rx,
            Arc::clone(&self.inner),
        ));
        tokio::spawn(reap(session_id.clone(), child));
        Ok(session_id)
    }

    /// Hand a master-sent session message to its PTY. Messages for a
    /// recently ended session are consumed and dropped. Returns `false` when
    /// the id names no session at all.
    pub fn route(&self, envelope: &Envelope) -> bool {
        let tx = {
            let table = self.lock();
            match table.live.get(envelope.session_id()) {
                Some(tx) => tx.clone(),
                None if table.has_ended(envelope.session_id()) => {
                    debug!(session_id = %envelope.session_id(), "Dropping message for ended PTY session");
                    return true;
                }
                None => return false,
            }
        };
        match from_payload::<PtyServerMessage>(envelope.data()) {
            Ok(message) => {
                let _ = tx.send(message);
            }
            Err(e) => warn!(session_id = %envelope.session_id(), "Dropping PTY input: {e}"),
        }
        true
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().live.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every session; their shells are killed as the inputs close.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().live.drain().collect();
        drained.len()
    }
}

fn kill_group(pid: Option<i32>) {
    if let Some(pgid) = pid.filter(|p| *p > 0) {
        // SAFETY: kill(2) on the process group led by our own child.
        unsafe {
            libc::kill(-pgid, libc::SIGHUP);
        }
    }
}

async fn input_task(
    session_id: String,
    mut input: mpsc::UnboundedReceiver<PtyServerMessage>,
    attached: oneshot::Sender<()>,
    writer: OwnedFd,
    master: OwnedFd,
    pid: Option<i32>,
    mut size: (u16, u16),
) {
    let mut writer = tokio::fs::File::from_std(std::fs::File::from(writer));
    let mut attached = Some(attached);
    while let Some(message) = input.recv().await {
        if let Some(gate) = attached.take() {
            let _ = gate.send(());
        }
        if message.done {
            debug!(session_id = %session_id, "Master ended PTY session");
            break;
        }
        if message.height.is_some() || message.width.is_some() {
            size = (message.height.unwrap_or(size.0), message.width.unwrap_or(size.1));
            if let Err(e) = resize_pty(&master, size.0, size.1) {
                warn!(session_id = %session_id, "Resize failed: {e}");
            }
        }
        if let Some(data) = message.data.filter(|d| !d.is_empty()) {
            if writer.write_all(&data).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    }
    kill_group(pid);
}

async fn output_task(
    session_id: String,
    agent_id: String,
    reader: OwnedFd,
    outbound: mpsc::Sender<Envelope>,
    attached: oneshot::Receiver<()>,
    sessions: Arc<Mutex<Table>>,
) {
    if attached.await.is_err() {
        // Session dropped before the master attached.
        return;
    }
    let mut reader = tokio::fs::File::from_std(std::fs::File::from(reader));
    let mut buf = [0u8; 4096];
    let send = |message: PtyClientMessage| {
        Envelope::new(Event::StartPty, agent_id.as_str(), session_id.as_str(), to_payload(&message))
    };
    loop {
        match reader.read(&mut buf).await {
            // EIO once the shell and all its children are gone.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if outbound.send(send(PtyClientMessage::output(buf[..n].to_vec()))).await.is_err() {
                    break;
                }
            }
        }
    }
    // Ended before the sentinel goes out, so the master's own terminate
    // can never find the session live again.
    sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .end(&session_id);
    let _ = outbound.send(send(PtyClientMessage::terminate())).await;
    info!(session_id = %session_id, "PTY session ended");
}

async fn reap(session_id: String, mut child: Child) {
    match child.wait().await {
        Ok(status) => debug!(session_id = %session_id, %status, "Shell exited"),
        Err(e) => warn!(session_id = %session_id, "Shell wait error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn collect_until_done(rx: &mut mpsc::Receiver<Envelope>) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let env = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("pty output")
                .expect("outbound open");
            let msg: PtyClientMessage = serde_json::from_slice(env.data()).unwrap();
            if msg.done {
                assert_eq!(msg, PtyClientMessage::terminate());
                return out;
            }
            out.extend_from_slice(&msg.data);
        }
    }

    fn input(session_id: &str, message: &PtyServerMessage) -> Envelope {
        Envelope::new(Event::StartPty, "", session_id, to_payload(message))
    }

    #[tokio::test]
    async fn output_waits_for_attach_then_ends_with_sentinel() {
        let sessions = PtySessions::new();
        let (tx, mut rx) = mpsc::channel(64);
        let id = sessions
            .start("edge-1", tx, PtyStartRequest::default(), "/bin/sh", "/")
            .unwrap();
        assert!(sessions.contains(&id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "output before attach");

        assert!(sessions.route(&input(&id, &PtyServerMessage::resize(30, 100))));
        let typed = PtyServerMessage {
            data: Some(b"echo marker-$((40+2)); exit\n".to_vec()),
            ..PtyServerMessage::default()
        };
        assert!(sessions.route(&input(&id, &typed)));

        let out = collect_until_done(&mut rx).await;
        assert!(String::from_utf8_lossy(&out).contains("marker-42"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sessions.contains(&id));
    }

    #[tokio::test]
    async fn master_terminate_kills_shell() {
        let sessions = PtySessions::new();
        let (tx, mut rx) = mpsc::channel(64);
        let id = sessions
            .start("edge-1", tx, PtyStartRequest::default(), "/bin/sh", "/")
            .unwrap();
        assert!(sessions.route(&input(&id, &PtyServerMessage::default())));
        assert!(sessions.route(&input(&id, &PtyServerMessage::terminate())));
        collect_until_done(&mut rx).await;
    }

    #[tokio::test]
    async fn late_messages_for_ended_session_are_dropped() {
        let sessions = PtySessions::new();
        let (tx, mut rx) = mpsc::channel(64);
        let id = sessions
            .start("edge-1", tx, PtyStartRequest::default(), "/bin/sh", "/")
            .unwrap();
        let typed = PtyServerMessage {
            data: Some(b"exit\n".to_vec()),
            ..PtyServerMessage::default()
        };
        assert!(sessions.route(&input(&id, &typed)));
        collect_until_done(&mut rx).await;
        assert!(!sessions.contains(&id));

        // The master's terminate crosses the agent's sentinel on the wire.
        assert!(sessions.route(&input(&id, &PtyServerMessage::terminate())));
        assert!(sessions.is_empty());
        assert!(!sessions.route(&input("never-started", &PtyServerMessage::terminate())));
    }

    #[test]
    fn unknown_session_is_not_routed() {
        let sessions = PtySessions::new();
        assert!(!sessions.route(&input("nope", &PtyServerMessage::default())));
        assert_eq!(sessions.close_all(), 0);
    }
}
