//! Log tail relay: streams an agent's log lines to a terminal endpoint.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, Instrument};

use super::{CloseReason, TerminalEvent, TerminalFrame, TerminalSink, TerminalSource};
use crate::error::TransportError;
use crate::protocol::Event;
use crate::rpc::{into_payload, Connection, Registry, SessionInbound};

pub struct LogTail {
    conn: Arc<Connection>,
    session_id: String,
    inbound: SessionInbound,
    call_timeout: Duration,
}

impl LogTail {
    /// Ask the agent to start following its log and bind the session.
    pub async fn start(
        registry: &Registry,
        agent_id: &str,
        call_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let conn = registry.require(agent_id).await?;
        let reply = conn
            .call(Event::StartLogStream, Vec::new(), call_timeout)
            .await?;
        let session_id = String::from_utf8_lossy(&into_payload(reply)?).trim().to_string();
        if session_id.is_empty() {
            return Err(TransportError::Protocol("start-log-stream reply carried no session id".into()));
        }
        let (sender, inbound) = conn.open_session(&session_id)?;
        // The agent holds lines back until this attach arrives.
        sender.send(Event::StartLogStream, Vec::new()).await?;
        info!(agent_id, session_id = %session_id, "Log stream started");
        Ok(Self {
            conn,
            session_id,
            inbound,
            call_timeout,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Relay lines until either side ends, then stop the stream on the agent.
    pub async fn run<Src, Snk>(self, source: Src, sink: Snk) -> CloseReason
    where
        Src: TerminalSource,
        Snk: TerminalSink,
    {
        let span = info_span!(
            "log_stream",
            agent_id = %self.conn.agent_id(),
            session_id = %self.session_id
        );
        self.relay(source, sink).instrument(span).await
    }

    async fn relay<Src, Snk>(self, mut source: Src, mut sink: Snk) -> CloseReason
    where
        Src: TerminalSource,
        Snk: TerminalSink,
    {
        let Self {
            conn,
            session_id,
            mut inbound,
            call_timeout,
        } = self;

        let reason = loop {
            tokio::select! {
                event = source.recv() => match event {
                    None => break CloseReason::TerminalClosed,
                    // Input is meaningless for a log tail.
                    Some(TerminalEvent::Input(_) | TerminalEvent::Pong) => {}
                },
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else {
                        break CloseReason::AgentLost;
                    };
                    if *envelope.event() == Event::Error {
                        break CloseReason::AgentError(envelope.data_str());
                    }
                    if let Err(e) = sink.send(TerminalFrame::Output(envelope.into_data())).await {
                        debug!("Terminal write failed: {e}");
                        break CloseReason::TerminalClosed;
                    }
                }
            }
        };

        sink.close().await;
        drop(inbound);
        if reason != CloseReason::AgentLost {
            let stop = conn
                .call(Event::StopLogStream, session_id.clone().into_bytes(), call_timeout)
                .await;
            if let Err(e) = stop {
                debug!("stop-log-stream not acknowledged: {e}");
            }
        }
        info!(reason = ?reason, "Log stream closed");
        reason
    }
}
