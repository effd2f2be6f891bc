//! Interactive session bridge.
//!
//! Relays a PTY session on an agent to an external terminal endpoint
//! (in production a browser WebSocket, see [`terminal`]). A session moves
//! through `Starting → Active → Closing → Closed`; while active, three flows
//! run side by side and any one of them may trigger teardown:
//!
//! - **input**: terminal input and resize updates → session envelopes
//! - **output**: session envelopes from the agent → terminal output
//! - **keepalive**: pings the terminal every half timeout and closes the
//!   session if no pong arrived within the timeout
//!
//! Teardown runs once no matter how many flows race into it.

pub mod logs;
pub mod terminal;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::TransportError;
use crate::protocol::{to_payload, Event, PtyClientMessage, PtyServerMessage, PtyStartRequest};
use crate::rpc::{into_payload, Registry, SessionInbound, SessionSender};

/// Upper bound on the final terminal close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Something the bridge writes to the terminal side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalFrame {
    Output(Vec<u8>),
    Ping,
}

/// Something the terminal side produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Keystrokes and/or a resize, in the order the terminal sent them.
    Input(PtyServerMessage),
    Pong,
}

/// Write half of an external terminal endpoint.
#[async_trait]
pub trait TerminalSink: Send {
    async fn send(&mut self, frame: TerminalFrame) -> Result<(), String>;
    /// Signal end of session to the terminal. Called exactly once.
    async fn close(&mut self);
}

/// Read half of an external terminal endpoint. `None` means it closed.
#[async_trait]
pub trait TerminalSource: Send {
    async fn recv(&mut self) -> Option<TerminalEvent>;
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub keepalive_timeout: Duration,
    /// Consecutive terminal write failures tolerated before giving up.
    pub error_limit: u32,
    pub start_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(10),
            error_limit: 10,
            start_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Agent sent the termination sentinel.
    AgentDone,
    /// Agent reported an error on the session.
    AgentError(String),
    /// Agent connection went away or rejected a send.
    AgentLost,
    /// Terminal endpoint closed.
    TerminalClosed,
    KeepaliveTimeout,
    ErrorLimit,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: String,
    pub reason: CloseReason,
    pub teardowns: usize,
}

/// A started PTY session, ready to be attached to a terminal.
pub struct PtyBridge {
    sender: SessionSender,
    inbound: SessionInbound,
    config: BridgeConfig,
    state: Arc<AtomicU8>,
}

impl PtyBridge {
    /// Issue `start-pty` to `agent_id` and bind the resulting session.
    ///
    /// The session is registered on the same connection that answered the
    /// call, then an initial size message is sent; the agent holds back
    /// output until it sees that message.
    pub async fn start(
        registry: &Registry,
        agent_id: &str,
        request: PtyStartRequest,
        config: BridgeConfig,
    ) -> Result<Self, TransportError> {
        let state = Arc::new(AtomicU8::new(SessionState::Starting as u8));
        let conn = registry.require(agent_id).await?;
        let reply = conn
            .call(Event::StartPty, to_payload(&request), config.start_timeout)
            .await?;
        let raw = into_payload(reply)?;
        let session_id = String::from_utf8_lossy(&raw).trim().to_string();
        if session_id.is_empty() {
            return Err(TransportError::Protocol("start-pty reply carried no session id".into()));
        }
        let (sender, inbound) = conn.open_session(&session_id)?;

        let attach = PtyServerMessage {
            height: request.height,
            width: request.width,
            ..PtyServerMessage::default()
        };
        sender.send(Event::StartPty, to_payload(&attach)).await?;

        state.store(SessionState::Active as u8, Ordering::SeqCst);
        info!(agent_id, session_id = %session_id, "PTY session started");
        Ok(Self {
            sender,
            inbound,
            config,
            state,
        })
    }

    pub fn session_id(&self) -> &str {
        self.sender.session_id()
    }

    /// Shared view of the session state, readable while [`PtyBridge::run`]
    /// is in progress.
    pub fn state_handle(&self) -> StateHandle {
        StateHandle(Arc::clone(&self.state))
    }

    /// Relay until any flow ends the session, then tear down.
    pub async fn run<Src, Snk>(self, source: Src, sink: Snk) -> SessionReport
    where
        Src: TerminalSource,
        Snk: TerminalSink,
    {
        let span = info_span!(
            "pty_session",
            agent_id = %self.sender.agent_id(),
            session_id = %self.sender.session_id()
        );
        self.relay(source, sink).instrument(span).await
    }

    async fn relay<Src, Snk>(self, mut source: Src, sink: Snk) -> SessionReport
    where
        Src: TerminalSource,
        Snk: TerminalSink,
    {
        let Self {
            sender,
            mut inbound,
            config,
            state,
        } = self;
        let session_id = sender.session_id().to_string();
        let (shutdown_tx, _) = watch::channel(false);
        let teardown = Teardown {
            closed: AtomicBool::new(false),
            count: AtomicU64::new(0),
            reason: OnceLock::new(),
            state: Arc::clone(&state),
            shutdown_tx,
            sender: sender.clone(),
        };
        let sink = Mutex::new(sink);
        let epoch = Instant::now();
        let last_pong_ms = AtomicU64::new(0);
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = || epoch.elapsed().as_millis() as u64;

        let input = async {
            let mut shutdown = teardown.subscribe();
            loop {
                let event = tokio::select! {
                    event = source.recv() => event,
                    _ = shutdown.wait_for(|closed| *closed) => break,
                };
                match event {
                    None => {
                        teardown.run(CloseReason::TerminalClosed).await;
                        break;
                    }
                    Some(TerminalEvent::Pong) => last_pong_ms.store(now_ms(), Ordering::Relaxed),
                    Some(TerminalEvent::Input(message)) => {
                        if let Err(e) = sender.send(Event::StartPty, to_payload(&message)).await {
                            debug!("Input not delivered: {e}");
                            teardown.run(CloseReason::AgentLost).await;
                            break;
                        }
                    }
                }
            }
        };

        let output = async {
            let mut shutdown = teardown.subscribe();
            let mut errors: u32 = 0;
            loop {
                let envelope = tokio::select! {
                    envelope = inbound.recv() => envelope,
                    _ = shutdown.wait_for(|closed| *closed) => break,
                };
                let Some(envelope) = envelope else {
                    teardown.run(CloseReason::AgentLost).await;
                    break;
                };
                if *envelope.event() == Event::Error {
                    teardown.run(CloseReason::AgentError(envelope.data_str())).await;
                    break;
                }
                let message: PtyClientMessage = match serde_json::from_slice(envelope.data()) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Malformed PTY output: {e}");
                        continue;
                    }
                };
                if message.done {
                    teardown.run(CloseReason::AgentDone).await;
                    break;
                }
                let write = async { sink.lock().await.send(TerminalFrame::Output(message.data)).await };
                let result = tokio::select! {
                    result = write => result,
                    _ = shutdown.wait_for(|closed| *closed) => break,
                };
                match result {
                    Ok(()) => errors = 0,
                    Err(e) => {
                        errors += 1;
                        warn!(errors, "Terminal write failed: {e}");
                        if errors > config.error_limit {
                            teardown.run(CloseReason::ErrorLimit).await;
                            break;
                        }
                    }
                }
            }
        };

        let keepalive = async {
            let mut shutdown = teardown.subscribe();
            let probe = (config.keepalive_timeout / 2).max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(probe);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait_for(|closed| *closed) => break,
                }
                let since_pong = now_ms().saturating_sub(last_pong_ms.load(Ordering::Relaxed));
                if Duration::from_millis(since_pong) > config.keepalive_timeout {
                    warn!(since_pong_ms = since_pong, "Terminal keepalive timed out");
                    teardown.run(CloseReason::KeepaliveTimeout).await;
                    break;
                }
                // A write stuck on the terminal must not stall the deadline
                // check above, so never wait for the sink here.
                let Ok(mut guard) = sink.try_lock() else {
                    debug!("Terminal busy, ping skipped");
                    continue;
                };
                tokio::select! {
                    result = guard.send(TerminalFrame::Ping) => {
                        if let Err(e) = result {
                            debug!("Ping failed: {e}");
                        }
                    }
                    () = tokio::time::sleep(probe) => debug!("Ping write stalled"),
                    _ = shutdown.wait_for(|closed| *closed) => break,
                }
            }
        };

        tokio::join!(input, output, keepalive);

        // Every flow has exited, so nothing else can touch either endpoint.
        if tokio::time::timeout(CLOSE_GRACE, sink.into_inner().close()).await.is_err() {
            warn!("Terminal close timed out");
        }
        drop(inbound);
        state.store(SessionState::Closed as u8, Ordering::SeqCst);

        let reason = teardown
            .reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::TerminalClosed);
        info!(reason = ?reason, "PTY session closed");
        SessionReport {
            session_id,
            reason,
            teardowns: usize::try_from(teardown.count.load(Ordering::SeqCst)).unwrap_or(usize::MAX),
        }
    }
}

/// Read-only handle on a session's state.
#[derive(Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }
}

struct Teardown {
    closed: AtomicBool,
    count: AtomicU64,
    reason: OnceLock<CloseReason>,
    state: Arc<AtomicU8>,
    shutdown_tx: watch::Sender<bool>,
    sender: SessionSender,
}

impl Teardown {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// First caller wins; later callers return immediately.
    async fn run(&self, reason: CloseReason) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        self.state.store(SessionState::Closing as u8, Ordering::SeqCst);
        debug!(reason = ?reason, "Closing PTY session");
        let _ = self.reason.set(reason);
        let _ = self.shutdown_tx.send(true);

        let bye = to_payload(&PtyServerMessage::terminate());
        if let Err(e) = self.sender.send(Event::StartPty, bye).await {
            debug!("Termination notice not delivered: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::{from_payload, Envelope, PTY_SENTINEL};
    use crate::rpc::Connection;

    /// Terminal sink that records output and can be told to fail.
    pub(crate) struct FakeSink {
        pub frames: mpsc::UnboundedSender<TerminalFrame>,
        pub fail: bool,
        pub closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TerminalSink for FakeSink {
        async fn send(&mut self, frame: TerminalFrame) -> Result<(), String> {
            if self.fail && matches!(frame, TerminalFrame::Output(_)) {
                return Err("broken pipe".into());
            }
            let _ = self.frames.send(frame);
            Ok(())
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Terminal source fed from a channel.
    pub(crate) struct FakeSource(pub mpsc::UnboundedReceiver<TerminalEvent>);

    #[async_trait]
    impl TerminalSource for FakeSource {
        async fn recv(&mut self) -> Option<TerminalEvent> {
            self.0.recv().await
        }
    }

    struct Harness {
        registry: Arc<Registry>,
        conn: Arc<Connection>,
        wire: mpsc::Receiver<Envelope>,
    }

    async fn harness() -> Harness {
        let registry = Arc::new(Registry::new());
        let (tx, wire) = mpsc::channel(256);
        let conn = registry.connection("edge-1", None, None, tx);
        registry.register(Arc::clone(&conn)).await;
        Harness {
            registry,
            conn,
            wire,
        }
    }

    /// Plays the agent side of `start-pty`: answers with `pty-1` and
    /// swallows the attach message.
    async fn start(h: &mut Harness, config: BridgeConfig) -> PtyBridge {
        let registry = Arc::clone(&h.registry);
        let starting = tokio::spawn(async move {
            let size = PtyStartRequest {
                height: Some(40),
                width: Some(120),
            };
            PtyBridge::start(&registry, "edge-1", size, config).await
        });
        let request = h.wire.recv().await.unwrap();
        assert_eq!(request.event(), &Event::StartPty);
        let size: PtyStartRequest = from_payload(request.data()).unwrap();
        assert_eq!(size.height, Some(40));
        h.conn.deliver(request.reply(Event::StartPty, b"pty-1".to_vec()));
        let bridge = starting.await.unwrap().unwrap();

        let attach = h.wire.recv().await.unwrap();
        assert_eq!(attach.session_id(), "pty-1");
        let attach: PtyServerMessage = serde_json::from_slice(attach.data()).unwrap();
        assert_eq!((attach.height, attach.width), (Some(40), Some(120)));
        bridge
    }

    fn agent_output(data: &[u8], done: bool) -> Envelope {
        let message = PtyClientMessage {
            data: data.to_vec(),
            done,
        };
        Envelope::new(Event::StartPty, "edge-1", "pty-1", to_payload(&message))
    }

    fn terminal() -> (
        FakeSource,
        mpsc::UnboundedSender<TerminalEvent>,
        FakeSink,
        mpsc::UnboundedReceiver<TerminalFrame>,
        Arc<AtomicUsize>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let sink = FakeSink {
            frames: frame_tx,
            fail: false,
            closes: Arc::clone(&closes),
        };
        (FakeSource(event_rx), event_tx, sink, frame_rx, closes)
    }

    fn is_terminate(envelope: &Envelope) -> bool {
        let message: PtyServerMessage = serde_json::from_slice(envelope.data()).unwrap();
        message.done && message.data.as_deref() == Some(PTY_SENTINEL)
    }

    #[tokio::test]
    async fn agent_chunks_arrive_in_order_then_session_closes() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let state = bridge.state_handle();
        assert_eq!(state.get(), SessionState::Active);
        let (source, _events, sink, mut frames, closes) = terminal();

        for chunk in [&b"one"[..], b"two", b"three"] {
            h.conn.deliver(agent_output(chunk, false));
        }
        h.conn.deliver(agent_output(PTY_SENTINEL, true));

        let report = bridge.run(source, sink).await;
        assert_eq!(report.reason, CloseReason::AgentDone);
        assert_eq!(report.teardowns, 1);
        assert_eq!(state.get(), SessionState::Closed);

        let mut got = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            if let TerminalFrame::Output(data) = frame {
                got.push(data);
            }
        }
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(h.conn.sessions().is_empty());
    }

    #[tokio::test]
    async fn input_and_resize_keep_terminal_order() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let (source, events, sink, _frames, _closes) = terminal();

        let sequence = vec![
            PtyServerMessage {
                data: Some(b"ls".to_vec()),
                ..PtyServerMessage::default()
            },
            PtyServerMessage::resize(50, 200),
            PtyServerMessage {
                data: Some(b"\r".to_vec()),
                ..PtyServerMessage::default()
            },
        ];
        for message in &sequence {
            events.send(TerminalEvent::Input(message.clone())).unwrap();
        }
        drop(events);

        let report = bridge.run(source, sink).await;
        assert_eq!(report.reason, CloseReason::TerminalClosed);

        let mut relayed = Vec::new();
        while let Ok(envelope) = h.wire.try_recv() {
            assert_eq!(envelope.session_id(), "pty-1");
            relayed.push(envelope);
        }
        let (last, inputs) = relayed.split_last().unwrap();
        assert!(is_terminate(last));
        let inputs: Vec<PtyServerMessage> = inputs
            .iter()
            .map(|e| serde_json::from_slice(e.data()).unwrap())
            .collect();
        assert_eq!(inputs, sequence);
    }

    #[tokio::test]
    async fn write_failures_past_limit_close_the_session() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let (source, _events, mut sink, _frames, closes) = terminal();
        sink.fail = true;

        for i in 0..11 {
            h.conn.deliver(agent_output(format!("chunk {i}").as_bytes(), false));
        }
        let report = bridge.run(source, sink).await;
        assert_eq!(report.reason, CloseReason::ErrorLimit);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let terminate = h.wire.recv().await.unwrap();
        assert!(is_terminate(&terminate));
        assert!(h.conn.sessions().is_empty());
    }

    #[tokio::test]
    async fn ten_failures_are_tolerated() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let (source, _events, mut sink, _frames, _closes) = terminal();
        sink.fail = true;

        for i in 0..10 {
            h.conn.deliver(agent_output(format!("chunk {i}").as_bytes(), false));
        }
        h.conn.deliver(agent_output(PTY_SENTINEL, true));
        let report = bridge.run(source, sink).await;
        assert_eq!(report.reason, CloseReason::AgentDone);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pongs_time_out() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let (source, _events, sink, mut frames, closes) = terminal();

        let started = Instant::now();
        let report = bridge.run(source, sink).await;
        assert_eq!(report.reason, CloseReason::KeepaliveTimeout);
        assert!(started.elapsed() <= Duration::from_secs(16));
        assert!(matches!(frames.try_recv(), Ok(TerminalFrame::Ping)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    /// Terminal whose output writes never complete.
    struct WedgedSink {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TerminalSink for WedgedSink {
        async fn send(&mut self, frame: TerminalFrame) -> Result<(), String> {
            if matches!(frame, TerminalFrame::Output(_)) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wedged_terminal_write_still_times_out() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let state = bridge.state_handle();
        let (source, _events, _sink, _frames, _) = terminal();
        let closes = Arc::new(AtomicUsize::new(0));
        let sink = WedgedSink {
            closes: Arc::clone(&closes),
        };

        h.conn.deliver(agent_output(b"stuck", false));
        let report = tokio::time::timeout(Duration::from_secs(60), bridge.run(source, sink))
            .await
            .expect("session must close on keepalive timeout");
        assert_eq!(report.reason, CloseReason::KeepaliveTimeout);
        assert_eq!(report.teardowns, 1);
        assert_eq!(state.get(), SessionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let terminate = h.wire.recv().await.unwrap();
        assert!(is_terminate(&terminate));
        assert!(h.conn.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_session_alive() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let (source, events, sink, mut frames, _closes) = terminal();

        // Answer every ping for a while, then hang up.
        let responder = tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(60);
            while let Some(frame) = frames.recv().await {
                if frame == TerminalFrame::Ping {
                    if Instant::now() >= deadline {
                        break;
                    }
                    let _ = events.send(TerminalEvent::Pong);
                }
            }
        });
        let started = Instant::now();
        let report = bridge.run(source, sink).await;
        assert_eq!(report.reason, CloseReason::TerminalClosed);
        assert!(started.elapsed() >= Duration::from_secs(60));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn connection_loss_ends_session() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let (source, _events, sink, _frames, closes) = terminal();

        h.conn.close("replaced by new connection");
        let report = bridge.run(source, sink).await;
        assert_eq!(report.reason, CloseReason::AgentLost);
        assert_eq!(report.teardowns, 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn racing_triggers_tear_down_once() {
        let mut h = harness().await;
        let bridge = start(&mut h, BridgeConfig::default()).await;
        let (source, events, sink, _frames, closes) = terminal();

        // Terminal hangs up and agent finishes at the same moment.
        drop(events);
        h.conn.deliver(agent_output(PTY_SENTINEL, true));
        let report = bridge.run(source, sink).await;
        assert!(matches!(
            report.reason,
            CloseReason::TerminalClosed | CloseReason::AgentDone
        ));
        assert_eq!(report.teardowns, 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let mut terminates = 0;
        while let Ok(envelope) = h.wire.try_recv() {
            if is_terminate(&envelope) {
                terminates += 1;
            }
        }
        assert_eq!(terminates, 1);
    }

    #[tokio::test]
    async fn start_against_offline_agent_fails_fast() {
        let registry = Registry::new();
        let err = PtyBridge::start(&registry, "ghost", PtyStartRequest::default(), BridgeConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, TransportError::Offline("ghost".into()));
    }

    #[tokio::test]
    async fn start_error_reply_is_remote() {
        let mut h = harness().await;
        let registry = Arc::clone(&h.registry);
        let starting = tokio::spawn(async move {
            PtyBridge::start(&registry, "edge-1", PtyStartRequest::default(), BridgeConfig::default())
                .await
                .err()
        });
        let request = h.wire.recv().await.unwrap();
        h.conn.deliver(request.error_reply("no pty support"));
        assert_eq!(
            starting.await.unwrap(),
            Some(TransportError::Remote("no pty support".into()))
        );
        assert!(h.conn.sessions().is_empty());
    }
}
