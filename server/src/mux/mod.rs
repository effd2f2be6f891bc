//! Single-port transport mux.
//!
//! Every accepted TCP connection is classified from its first bytes before
//! any handler sees it:
//!
//! | First bytes                  | Route                                 |
//! |------------------------------|---------------------------------------|
//! | `0x16 0x03` (TLS handshake)  | terminate TLS, then classify again    |
//! | `PXFLEET/1\r\n`              | agent RPC acceptor                    |
//! | `GET `, `POST `, ...         | HTTP router                           |
//! | anything else                | closed                                |
//!
//! Sniffed bytes are replayed through [`Rewind`], so downstream handlers
//! see the stream from its first byte.

pub mod rewind;
pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

pub use rewind::Rewind;

use crate::protocol::RPC_PREFACE;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// Longest prefix any rule needs.
const MAX_SNIFF: usize = 16;

/// Any byte stream the mux can hand out.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

pub type MuxStream = Rewind<Box<dyn Io>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Rpc,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    Match(Protocol),
    NeedMore,
    Unknown,
}

/// Classify a connection from the bytes seen so far.
pub fn classify(prefix: &[u8]) -> Sniff {
    if prefix.is_empty() {
        return Sniff::NeedMore;
    }
    if prefix[0] == 0x16 {
        return match prefix.get(1) {
            None => Sniff::NeedMore,
            Some(0x03) => Sniff::Match(Protocol::Tls),
            Some(_) => Sniff::Unknown,
        };
    }
    if prefix.starts_with(RPC_PREFACE) {
        return Sniff::Match(Protocol::Rpc);
    }
    if HTTP_METHODS.iter().any(|m| prefix.starts_with(m)) {
        return Sniff::Match(Protocol::Http);
    }
    let partial = RPC_PREFACE.starts_with(prefix) || HTTP_METHODS.iter().any(|m| m.starts_with(prefix));
    if partial {
        Sniff::NeedMore
    } else {
        Sniff::Unknown
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("unrecognized protocol")]
    Unrecognized,
    #[error("connection closed before protocol was identified")]
    Closed,
    #[error("TLS handshake on a listener without TLS configured")]
    TlsNotConfigured,
    #[error("plain-text agent RPC refused (TLS required)")]
    PlainRpcRefused,
    #[error("protocol detection timed out")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone)]
pub struct MuxConfig {
    pub tls: Option<TlsAcceptor>,
    pub require_tls_for_rpc: bool,
    /// Deadline for sniffing plus any TLS handshake.
    pub detect_timeout: Duration,
}

/// A classified connection.
pub struct Routed {
    pub protocol: Protocol,
    pub secure: bool,
    pub stream: MuxStream,
}

async fn sniff<S: AsyncRead + Unpin>(io: &mut S) -> Result<(Protocol, BytesMut), MuxError> {
    let mut seen = BytesMut::with_capacity(MAX_SNIFF);
    let mut chunk = [0u8; MAX_SNIFF];
    loop {
        match classify(&seen) {
            Sniff::Match(protocol) => return Ok((protocol, seen)),
            Sniff::Unknown => return Err(MuxError::Unrecognized),
            Sniff::NeedMore if seen.len() >= MAX_SNIFF => return Err(MuxError::Unrecognized),
            Sniff::NeedMore => {}
        }
        let want = MAX_SNIFF - seen.len();
        let n = io.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(MuxError::Closed);
        }
        seen.extend_from_slice(&chunk[..n]);
    }
}

/// Classify `io` and wrap it for the matching handler. TLS connections are
/// decrypted here and classified once more on the inner stream.
pub async fn route<S: Io>(mut io: S, config: &MuxConfig) -> Result<Routed, MuxError> {
    let (protocol, prefix) = sniff(&mut io).await?;
    match protocol {
        Protocol::Tls => {
            let acceptor = config.tls.as_ref().ok_or(MuxError::TlsNotConfigured)?;
            let tls = acceptor.accept(Rewind::new(io, prefix.freeze())).await?;
            let mut tls: Box<dyn Io> = Box::new(tls);
            let (inner, prefix) = sniff(&mut tls).await?;
            if inner == Protocol::Tls {
                return Err(MuxError::Unrecognized);
            }
            Ok(Routed {
                protocol: inner,
                secure: true,
                stream: Rewind::new(tls, prefix.freeze()),
            })
        }
        Protocol::Rpc if config.require_tls_for_rpc => Err(MuxError::PlainRpcRefused),
        protocol => Ok(Routed {
            protocol,
            secure: false,
            stream: Rewind::new(Box::new(io), prefix.freeze()),
        }),
    }
}

/// A connection handed to a sub-listener.
pub struct Accepted {
    pub stream: MuxStream,
    pub peer: SocketAddr,
    pub secure: bool,
}

/// HTTP side of the mux, pluggable into [`axum::serve`].
pub struct HttpListener {
    rx: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
}

impl axum::serve::Listener for HttpListener {
    type Io = MuxStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(accepted) => (accepted.stream, accepted.peer),
            // Mux stopped; axum treats accept as infallible, so park here
            // until graceful shutdown completes.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Agent RPC side of the mux.
pub struct RpcListener {
    rx: mpsc::Receiver<Accepted>,
}

impl RpcListener {
    /// Next agent connection; `None` once the mux has stopped.
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.rx.recv().await
    }
}

/// Start demultiplexing `listener`. The returned task owns the accept loop;
/// abort it to stop accepting.
pub fn spawn(
    listener: TcpListener,
    config: MuxConfig,
) -> io::Result<(HttpListener, RpcListener, JoinHandle<()>)> {
    let local_addr = listener.local_addr()?;
    let (http_tx, http_rx) = mpsc::channel(64);
    let (rpc_tx, rpc_rx) = mpsc::channel(64);
    let config = Arc::new(config);

    let task = tokio::spawn(async move {
        loop {
            let (tcp, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = tcp.set_nodelay(true);
            let config = Arc::clone(&config);
            let http_tx = http_tx.clone();
            let rpc_tx = rpc_tx.clone();
            tokio::spawn(async move {
                let routed = match tokio::time::timeout(config.detect_timeout, route(tcp, &config)).await {
                    Ok(Ok(routed)) => routed,
                    Ok(Err(e)) => {
                        debug!(%peer, "Dropping connection: {e}");
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "Dropping connection: {}", MuxError::Timeout);
                        return;
                    }
                };
                let accepted = Accepted {
                    stream: routed.stream,
                    peer,
                    secure: routed.secure,
                };
                let target = match routed.protocol {
                    Protocol::Rpc => &rpc_tx,
                    _ => &http_tx,
                };
                if target.send(accepted).await.is_err() {
                    debug!(%peer, "Sub-listener gone, dropping connection");
                }
            });
        }
    });

    Ok((
        HttpListener {
            rx: http_rx,
            local_addr,
        },
        RpcListener { rx: rpc_rx },
        task,
    ))
}
