//! Agent side: one persistent connection to the master.
//!
//! ```text
//! mod.rs       — connect/handshake, reconnect with backoff, reader/writer/heartbeat
//! dispatch.rs  — request → handler → exactly one reply
//! engine.rs    — proxy process management, worker runtime seam
//! pty.rs       — PTY sessions
//! logs.rs      — log file streaming
//! ```
//!
//! Sessions (PTY, log streams) live on a [`Link`], which is scoped to one
//! physical connection: when it drops, every shell is hung up and every log
//! stream stopped, matching the master which forgets them at the same time.

pub mod dispatch;
pub mod engine;
pub mod logs;
pub mod pty;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::AgentConfig;
use crate::mux::tls::{self, TlsError};
use crate::mux::Io;
use crate::protocol::{
    decode_frame, encode_frame, framed, Envelope, Event, Frame, RpcFramed, VersionInfo, RPC_PREFACE,
};

pub use dispatch::Dispatcher;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("invalid TLS server name: {0}")]
    ServerName(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("master closed the connection during handshake")]
    Closed,
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("unexpected handshake frame")]
    Unexpected,
    #[error("master rejected registration: {0}")]
    Rejected(String),
}

/// Per-connection agent state shared by the reader and request handlers.
pub struct Link {
    outbound: mpsc::Sender<Envelope>,
    ptys: pty::PtySessions,
    logs: logs::LogStreams,
    agent_id: String,
}

impl Link {
    pub fn new(agent_id: &str, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            outbound,
            ptys: pty::PtySessions::new(),
            logs: logs::LogStreams::new(),
            agent_id: agent_id.to_string(),
        }
    }

    pub fn outbound(&self) -> mpsc::Sender<Envelope> {
        self.outbound.clone()
    }

    pub fn ptys(&self) -> &pty::PtySessions {
        &self.ptys
    }

    pub fn logs(&self) -> &logs::LogStreams {
        &self.logs
    }

    /// Deliver a master message addressed to a live local session.
    fn route_session(&self, envelope: &Envelope) -> bool {
        match envelope.event() {
            Event::StartPty => self.ptys.route(envelope),
            Event::StartLogStream => self.logs.route(envelope),
            _ => false,
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let ptys = self.ptys.close_all();
        let logs = self.logs.close_all();
        if ptys + logs > 0 {
            info!(agent_id = %self.agent_id, ptys, logs, "Closed local sessions");
        }
    }
}

/// Reconnect forever (until `shutdown`), with exponential backoff between
/// `reconnect_delay_secs` and `reconnect_max_delay_secs`.
pub async fn run(
    config: Arc<AgentConfig>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let initial = Duration::from_secs(config.reconnect_delay_secs.max(1));
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs).max(initial);
    let mut delay = initial;

    loop {
        info!(master = %config.master_addr, agent_id = %config.id, "Connecting to master");
        let outcome = tokio::select! {
            outcome = connect_and_serve(&config, &dispatcher) => outcome,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        match outcome {
            Ok(reason) => {
                info!("Disconnected from master ({reason}), reconnecting...");
                delay = initial;
            }
            Err(e) => warn!("Connection failed: {e}, reconnecting in {}s", delay.as_secs()),
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        delay = (delay * 2).min(max_delay);
    }
    info!("Agent stopped");
}

/// One attempt: dial, handshake, then serve until the link drops.
async fn connect_and_serve(
    config: &AgentConfig,
    dispatcher: &Arc<Dispatcher>,
) -> Result<&'static str, AgentError> {
    let tcp = TcpStream::connect(&config.master_addr).await?;
    tcp.set_nodelay(true)?;
    let io: Box<dyn Io> = if config.tls {
        let client = tls::client_config(config.ca_cert.as_deref(), config.insecure_skip_verify)?;
        let name = ServerName::try_from(config.tls_server_name())
            .map_err(|e| AgentError::ServerName(e.to_string()))?;
        Box::new(TlsConnector::from(client).connect(name, tcp).await?)
    } else {
        Box::new(tcp)
    };
    let framed = handshake(io, &config.id, &config.token).await?;
    info!(agent_id = %config.id, tls = config.tls, "Registered with master");

    let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let span = info_span!("master_link", agent_id = %config.id);
    Ok(serve(framed, &config.id, Arc::clone(dispatcher), heartbeat)
        .instrument(span)
        .await)
}

/// Write the preface and `hello`, then wait for the master's `welcome`.
pub async fn handshake<S: Io>(
    io: S,
    agent_id: &str,
    token: &str,
) -> Result<RpcFramed<S>, AgentError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, greet(io, agent_id, token))
        .await
        .map_err(|_| AgentError::Timeout)?
}

async fn greet<S: Io>(mut io: S, agent_id: &str, token: &str) -> Result<RpcFramed<S>, AgentError> {
    io.write_all(RPC_PREFACE).await?;
    let mut framed = framed(io);
    let hello = Frame::Hello {
        agent_id: agent_id.to_string(),
        token: token.to_string(),
        version: VersionInfo::current(),
    };
    framed.send(encode_frame(&hello)?).await?;
    let raw = framed.next().await.ok_or(AgentError::Closed)??;
    match decode_frame(&raw)? {
        Frame::Welcome {
            accepted: true,
            version,
            ..
        } => {
            debug!(master_version = %version.version, "Welcome received");
            Ok(framed)
        }
        Frame::Welcome { reason, .. } => Err(AgentError::Rejected(
            reason.unwrap_or_else(|| "no reason given".into()),
        )),
        _ => Err(AgentError::Unexpected),
    }
}

/// Serve an established link until either side closes it.
pub async fn serve<S: Io>(
    framed: RpcFramed<S>,
    agent_id: &str,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Duration,
) -> &'static str {
    let (mut sink, mut stream) = framed.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let link = Arc::new(Link::new(agent_id, outbound_tx.clone()));

    let mut writer = tokio::spawn(
        async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let bytes = match encode_frame(&Frame::Envelope(envelope)) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Dropping unencodable envelope: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    debug!("Write to master failed: {e}");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let heartbeat_task = tokio::spawn({
        let outbound = outbound_tx.clone();
        let agent_id = agent_id.to_string();
        async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ping = Envelope::new(Event::Ping, agent_id.as_str(), "", VersionInfo::current().to_bytes());
                if outbound.send(ping).await.is_err() {
                    break;
                }
            }
        }
    });
    drop(outbound_tx);

    let reason = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut writer => break "writer stopped",
        };
        let raw = match frame {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                debug!("Read failed: {e}");
                break "read error";
            }
            None => break "master closed the connection",
        };
        match decode_frame(&raw) {
            Ok(Frame::Envelope(envelope)) => handle_inbound(&link, &dispatcher, envelope).await,
            Ok(_) => warn!("Ignoring handshake frame after handshake"),
            Err(e) => warn!("Malformed frame from master: {e}"),
        }
    };

    heartbeat_task.abort();
    writer.abort();
    reason
}

async fn handle_inbound(link: &Arc<Link>, dispatcher: &Arc<Dispatcher>, envelope: Envelope) {
    match envelope.event() {
        Event::Ping => {
            let _ = link.outbound.send(Dispatcher::pong(&envelope)).await;
        }
        Event::Pong => trace!("Heartbeat acknowledged"),
        Event::Error => warn!(
            session_id = %envelope.session_id(),
            "Master reported error: {}",
            envelope.data_str()
        ),
        _ if link.route_session(&envelope) => {}
        _ => {
            let link = Arc::clone(link);
            let dispatcher = Arc::clone(dispatcher);
            tokio::spawn(
                async move {
                    let reply = dispatcher.dispatch(&link, envelope).await;
                    if link.outbound.send(reply).await.is_err() {
                        debug!("Reply dropped, link closed");
                    }
                }
                .in_current_span(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;
    use crate::agent::engine::{NoWorkerRuntime, ProcessEngine};
    use crate::error::TransportError;
    use crate::protocol::AgentStatus;
    use crate::rpc::acceptor::{serve_connection, AcceptorOptions};
    use crate::rpc::{Registry, Transport};

    fn opts() -> Arc<AcceptorOptions> {
        Arc::new(AcceptorOptions {
            agent_token: "fleet-secret".into(),
            handshake_timeout: Duration::from_secs(5),
        })
    }

    fn dispatcher(agent_id: &str) -> Arc<Dispatcher> {
        let dir = std::env::temp_dir().join(format!("proxyfleet-agent-{agent_id}-{}", std::process::id()));
        let config = AgentConfig {
            id: agent_id.into(),
            data_dir: dir.clone(),
            log_file: dir.join("proxy.log"),
            ..AgentConfig::default()
        };
        Arc::new(Dispatcher::new(
            &config,
            Arc::new(ProcessEngine::from_config(&config)),
            Arc::new(NoWorkerRuntime),
        ))
    }

    async fn pair(registry: &Arc<Registry>, token: &str) -> Result<RpcFramed<DuplexStream>, AgentError> {
        let (master_io, agent_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(master_io, None, Arc::clone(registry), opts()));
        handshake(agent_io, "edge-1", token).await
    }

    #[tokio::test]
    async fn master_calls_reach_agent_handlers() {
        let registry = Arc::new(Registry::new());
        let framed = pair(&registry, "fleet-secret").await.unwrap();
        tokio::spawn(async move {
            serve(framed, "edge-1", dispatcher("edge-1"), Duration::from_secs(30)).await
        });
        let transport = Transport::new(Arc::clone(&registry), Duration::from_secs(5));

        let status = transport
            .call_ok("edge-1", Event::GetStatus, Vec::new(), None)
            .await
            .unwrap();
        let status: AgentStatus = serde_json::from_slice(&status).unwrap();
        assert_eq!(status.agent_id, "edge-1");

        let err = transport
            .call_ok("edge-1", Event::from_wire("self-destruct"), Vec::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Remote("unknown event: self-destruct".into()));

        let pong = transport.call("edge-1", Event::Ping, Vec::new(), None).await.unwrap();
        assert_eq!(pong.event(), &Event::Pong);
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently() {
        let registry = Arc::new(Registry::new());
        let framed = pair(&registry, "fleet-secret").await.unwrap();
        tokio::spawn(async move {
            serve(framed, "edge-1", dispatcher("edge-1-conc"), Duration::from_secs(30)).await
        });
        let transport = Transport::new(Arc::clone(&registry), Duration::from_secs(5));

        let (a, b) = tokio::join!(
            transport.call_ok("edge-1", Event::GetStatus, Vec::new(), None),
            transport.call_ok("edge-1", Event::CreateWorker, b"{}".to_vec(), None),
        );
        assert!(a.is_ok());
        assert_eq!(b.unwrap_err(), TransportError::Remote("no worker runtime installed".into()));
    }

    #[tokio::test]
    async fn shell_exit_ends_the_session_on_both_sides() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use crate::bridge::tests::{FakeSink, FakeSource};
        use crate::bridge::{BridgeConfig, CloseReason, PtyBridge, TerminalEvent};
        use crate::protocol::{PtyServerMessage, PtyStartRequest};

        let registry = Arc::new(Registry::new());
        let framed = pair(&registry, "fleet-secret").await.unwrap();
        tokio::spawn(async move {
            serve(framed, "edge-1", dispatcher("edge-1-pty"), Duration::from_secs(30)).await
        });

        let bridge = PtyBridge::start(&registry, "edge-1", PtyStartRequest::default(), BridgeConfig::default())
            .await
            .unwrap();
        let session_id = bridge.session_id().to_string();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, _frames) = mpsc::unbounded_channel();
        let sink = FakeSink {
            frames: frame_tx,
            fail: false,
            closes: Arc::new(AtomicUsize::new(0)),
        };
        let closes = Arc::clone(&sink.closes);
        event_tx
            .send(TerminalEvent::Input(PtyServerMessage {
                data: Some(b"exit\n".to_vec()),
                ..PtyServerMessage::default()
            }))
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), bridge.run(FakeSource(event_rx), sink))
            .await
            .unwrap();
        assert_eq!(report.reason, CloseReason::AgentDone);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Catch anything the agent still sends for the finished session.
        let conn = registry.lookup("edge-1").await.unwrap();
        let (_sender, mut late) = conn.open_session(&session_id).unwrap();
        let stray = tokio::time::timeout(Duration::from_millis(300), late.recv()).await;
        assert!(stray.is_err(), "unexpected envelope: {stray:?}");

        let transport = Transport::new(Arc::clone(&registry), Duration::from_secs(5));
        let status = transport
            .call_ok("edge-1", Event::GetStatus, Vec::new(), None)
            .await
            .unwrap();
        let status: AgentStatus = serde_json::from_slice(&status).unwrap();
        assert_eq!(status.pty_sessions, 0);
        drop(event_tx);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let registry = Arc::new(Registry::new());
        let err = pair(&registry, "guess").await.unwrap_err();
        assert!(matches!(err, AgentError::Rejected(reason) if reason == "invalid agent token"));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn heartbeats_keep_the_connection_fresh() {
        let registry = Arc::new(Registry::new());
        let framed = pair(&registry, "fleet-secret").await.unwrap();
        let agent = tokio::spawn(async move {
            serve(framed, "edge-1", dispatcher("edge-1-hb"), Duration::from_millis(20)).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        let conn = registry.lookup("edge-1").await.unwrap();
        assert!(conn.idle_for() < Duration::from_millis(200));

        registry.drain_all("test over").await;
        let reason = tokio::time::timeout(Duration::from_secs(5), agent).await.unwrap().unwrap();
        assert!(matches!(reason, "master closed the connection" | "writer stopped"));
    }
}
