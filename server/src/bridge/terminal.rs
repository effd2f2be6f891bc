//! Browser terminal endpoint over an axum WebSocket.
//!
//! Inbound text frames are JSON `{ "data"?: string, "height"?: int,
//! "width"?: int }`; inbound binary frames are raw keystrokes. Outbound
//! terminal output is sent as binary frames.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{TerminalEvent, TerminalFrame, TerminalSink, TerminalSource};
use crate::protocol::PtyServerMessage;

/// Control/data message as browsers send it.
#[derive(Debug, Default, Deserialize)]
struct TerminalInput {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    height: Option<u16>,
    #[serde(default)]
    width: Option<u16>,
}

/// Parse a text frame from the terminal into the agent-bound message.
pub fn parse_terminal_text(text: &str) -> Result<PtyServerMessage, serde_json::Error> {
    let input: TerminalInput = serde_json::from_str(text)?;
    Ok(PtyServerMessage {
        data: input.data.map(String::into_bytes),
        height: input.height,
        width: input.width,
        done: false,
    })
}

/// Split a WebSocket into bridge endpoints.
pub fn split(socket: WebSocket) -> (WsTerminalSource, WsTerminalSink) {
    let (sink, stream) = socket.split();
    (WsTerminalSource(stream), WsTerminalSink(sink))
}

pub struct WsTerminalSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl TerminalSink for WsTerminalSink {
    async fn send(&mut self, frame: TerminalFrame) -> Result<(), String> {
        let message = match frame {
            TerminalFrame::Output(data) => Message::Binary(data.into()),
            TerminalFrame::Ping => Message::Ping(Bytes::new()),
        };
        self.0.send(message).await.map_err(|e| e.to_string())
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.send(Message::Close(None)).await {
            debug!("Close frame not sent: {e}");
        }
        let _ = self.0.close().await;
    }
}

pub struct WsTerminalSource(SplitStream<WebSocket>);

#[async_trait]
impl TerminalSource for WsTerminalSource {
    async fn recv(&mut self) -> Option<TerminalEvent> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => match parse_terminal_text(text.as_str()) {
                    Ok(message) => return Some(TerminalEvent::Input(message)),
                    Err(e) => warn!("Ignoring malformed terminal message: {e}"),
                },
                Ok(Message::Binary(data)) => {
                    return Some(TerminalEvent::Input(PtyServerMessage {
                        data: Some(data.to_vec()),
                        ..PtyServerMessage::default()
                    }));
                }
                Ok(Message::Pong(_)) => return Some(TerminalEvent::Pong),
                // axum answers pings itself.
                Ok(Message::Ping(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    debug!("Terminal read failed: {e}");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frames_carry_data_and_size() {
        let msg = parse_terminal_text(r#"{"data":"ls -la\r"}"#).unwrap();
        assert_eq!(msg.data.as_deref(), Some(&b"ls -la\r"[..]));
        assert_eq!(msg.height, None);

        let msg = parse_terminal_text(r#"{"height":30,"width":100}"#).unwrap();
        assert_eq!(msg, PtyServerMessage::resize(30, 100));

        let msg = parse_terminal_text("{}").unwrap();
        assert_eq!(msg, PtyServerMessage::default());
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(parse_terminal_text("ls").is_err());
        assert!(parse_terminal_text(r#"{"height":-1}"#).is_err());
    }
}
