//! Agent RPC acceptor: handshake plus the reader and writer flows of one
//! physical connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::registry::{Connection, Delivery, Registry};
use crate::auth::{verify_agent, HandshakeVerdict};
use crate::protocol::{
    decode_frame, encode_frame, framed, Envelope, Event, Frame, RpcFramed, VersionInfo,
    PROTOCOL_VERSION, RPC_PREFACE,
};

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    /// Shared secret agents present in `hello`.
    pub agent_token: String,
    /// Deadline for preface + `hello`.
    pub handshake_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("bad connection preface")]
    Preface,
    #[error("connection closed during handshake")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("rejected: {0}")]
    Rejected(&'static str),
}

/// Run one agent connection to completion.
///
/// `io` must be positioned at the start of the stream (the preface is read
/// and checked here). Returns once the connection is gone and unregistered.
pub async fn serve_connection<S>(
    io: S,
    peer: Option<SocketAddr>,
    registry: Arc<Registry>,
    opts: Arc<AcceptorOptions>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match handshake(io, peer, &registry, &opts).await {
        Ok((conn, framed, outbound_rx)) => {
            let span = info_span!("agent_conn", agent_id = %conn.agent_id(), conn_id = conn.conn_id());
            run_connection(conn, framed, outbound_rx, registry)
                .instrument(span)
                .await;
        }
        Err(e) => {
            warn!(peer = ?peer, "Agent handshake failed: {e}");
        }
    }
}

async fn read_preface<S: AsyncRead + Unpin>(io: &mut S) -> Result<(), HandshakeError> {
    let mut buf = [0u8; RPC_PREFACE.len()];
    io.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HandshakeError::Closed
        } else {
            HandshakeError::Io(e)
        }
    })?;
    if &buf[..] != RPC_PREFACE {
        return Err(HandshakeError::Preface);
    }
    Ok(())
}

async fn send_frame<S>(framed: &mut RpcFramed<S>, frame: &Frame) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    framed.send(bytes).await?;
    Ok(())
}

type Accepted<S> = (Arc<Connection>, RpcFramed<S>, mpsc::Receiver<Envelope>);

async fn handshake<S>(
    mut io: S,
    peer: Option<SocketAddr>,
    registry: &Registry,
    opts: &AcceptorOptions,
) -> Result<Accepted<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let greeting = async move {
        read_preface(&mut io).await?;
        let mut framed = framed(io);
        let raw = match framed.next().await {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => return Err(HandshakeError::Io(e)),
            None => return Err(HandshakeError::Closed),
        };
        let hello = decode_frame(&raw).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        Ok((framed, hello))
    };
    let (mut framed, hello) = tokio::time::timeout(opts.handshake_timeout, greeting)
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    let Frame::Hello {
        agent_id,
        token,
        version,
    } = hello
    else {
        return Err(HandshakeError::Malformed("expected hello frame".into()));
    };

    let verdict = if version.protocol == PROTOCOL_VERSION {
        verify_agent(&opts.agent_token, &agent_id, &token)
    } else {
        HandshakeVerdict::Reject("unsupported protocol version")
    };
    if let HandshakeVerdict::Reject(reason) = verdict {
        let welcome = Frame::Welcome {
            accepted: false,
            reason: Some(reason.to_string()),
            version: VersionInfo::current(),
        };
        // Best effort: the agent may already be gone.
        let _ = send_frame(&mut framed, &welcome).await;
        return Err(HandshakeError::Rejected(reason));
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let conn = registry.connection(
        &agent_id,
        Some(version),
        peer.map(|p| p.to_string()),
        outbound_tx,
    );
    registry.register(Arc::clone(&conn)).await;

    let welcome = Frame::Welcome {
        accepted: true,
        reason: None,
        version: VersionInfo::current(),
    };
    if let Err(e) = send_frame(&mut framed, &welcome).await {
        registry.remove(&conn, "welcome failed").await;
        return Err(e);
    }
    Ok((conn, framed, outbound_rx))
}

async fn run_connection<S>(
    conn: Arc<Connection>,
    framed: RpcFramed<S>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    registry: Arc<Registry>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!(version = ?conn.version(), "Agent connected");
    let (mut sink, mut stream) = framed.split();

    // Single writer: every outbound envelope for this connection goes
    // through here, one whole frame at a time.
    let writer_conn = Arc::clone(&conn);
    let mut writer_shutdown = conn.shutdown_signal();
    let writer = tokio::spawn(
        async move {
            loop {
                let envelope = tokio::select! {
                    envelope = outbound_rx.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = writer_shutdown.wait_for(|closed| *closed) => break,
                };
                let bytes = match encode_frame(&Frame::Envelope(envelope)) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Dropping unencodable envelope: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    debug!("Write failed: {e}");
                    writer_conn.close("write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    );

    let mut shutdown = conn.shutdown_signal();
    let reason = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = shutdown.wait_for(|closed| *closed) => break "connection closed",
        };
        let raw = match frame {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                debug!("Read failed: {e}");
                break "read error";
            }
            None => break "agent disconnected",
        };
        conn.touch();
        match decode_frame(&raw) {
            Ok(Frame::Envelope(envelope)) => handle_envelope(&conn, envelope).await,
            Ok(_) => warn!("Ignoring handshake frame after handshake"),
            Err(e) => {
                warn!("Malformed frame from agent: {e}");
                let notice = Envelope::new(
                    Event::Error,
                    conn.agent_id(),
                    "",
                    format!("malformed frame: {e}").into_bytes(),
                );
                if !conn.try_send(notice) {
                    debug!("Malformed-frame notice dropped");
                }
            }
        }
    };

    registry.remove(&conn, reason).await;
    writer.abort();
    info!("Agent disconnected: {reason}");
}

/// Route one inbound envelope. Unclaimed pings are answered inline; unclaimed
/// unknown events get an explicit error; anything else is late and dropped.
///
/// Replies never wait on the outbound queue: the reader must keep
/// delivering to every call and session on the connection.
async fn handle_envelope(conn: &Connection, envelope: Envelope) {
    let envelope = match conn.deliver(envelope) {
        Delivery::Call | Delivery::Session => return,
        Delivery::Unmatched(envelope) => envelope,
    };
    let reply = match envelope.event() {
        Event::Ping => {
            trace!("Heartbeat");
            envelope.reply(Event::Pong, VersionInfo::current().to_bytes())
        }
        Event::Unknown(name) => {
            warn!(event = %name, "Unknown event from agent");
            envelope.error_reply(&format!("unknown event: {name}"))
        }
        other => {
            debug!(event = %other, session_id = %envelope.session_id(), "Dropping unmatched envelope");
            return;
        }
    };
    if !conn.try_send(reply) {
        debug!("Reply dropped, outbound queue full or closed");
    }
}
