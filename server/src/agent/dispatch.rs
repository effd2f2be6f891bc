//! Agent-side event dispatch.
//!
//! Every request envelope from the master is handled by exactly one handler
//! selected by its event, and always produces exactly one reply: the
//! handler's payload, or an `error` envelope when the handler fails, panics,
//! or the event is not one this agent serves.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, warn};

use super::engine::{ProxyEngine, WorkerRuntime};
use super::Link;
use crate::config::AgentConfig;
use crate::protocol::{from_payload, to_payload, AgentStatus, Envelope, Event, PtyStartRequest, VersionInfo};

pub struct Dispatcher {
    agent_id: String,
    shell: String,
    working_dir: String,
    log_file: PathBuf,
    engine: Arc<dyn ProxyEngine>,
    workers: Arc<dyn WorkerRuntime>,
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Dispatcher {
    pub fn new(
        config: &AgentConfig,
        engine: Arc<dyn ProxyEngine>,
        workers: Arc<dyn WorkerRuntime>,
    ) -> Self {
        Self {
            agent_id: config.id.clone(),
            shell: config.shell.clone(),
            working_dir: config.working_dir.clone(),
            log_file: config.log_file.clone(),
            engine,
            workers,
        }
    }

    /// Liveness fast-path: answered without entering the handler path.
    pub fn pong(request: &Envelope) -> Envelope {
        request.reply(Event::Pong, VersionInfo::current().to_bytes())
    }

    /// Handle one request and build its reply. Never panics.
    pub async fn dispatch(&self, link: &Link, request: Envelope) -> Envelope {
        let event = request.event().clone();
        let outcome = AssertUnwindSafe(self.handle(link, &request))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(data)) => request.reply(event, data),
            Ok(Err(message)) => {
                warn!(event = %event, session_id = %request.session_id(), "Handler failed: {message}");
                request.error_reply(&message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(event = %event, session_id = %request.session_id(), "Handler panicked: {message}");
                request.error_reply(&format!("internal error handling {event}"))
            }
        }
    }

    async fn handle(&self, link: &Link, request: &Envelope) -> Result<Vec<u8>, String> {
        let data = request.data();
        match request.event() {
            Event::UpdateConfig => self.engine.update_config(data).await.map(|()| Vec::new()),
            Event::RemoveConfig => self.engine.remove_config().await.map(|()| Vec::new()),
            Event::Start => self.engine.start().await.map(|()| Vec::new()),
            Event::Stop => self.engine.stop().await.map(|()| Vec::new()),
            Event::GetProxyInfo => self.engine.proxy_info().await,
            Event::GetStatus => {
                let status = AgentStatus {
                    agent_id: self.agent_id.clone(),
                    version: VersionInfo::current(),
                    proxy_running: self.engine.is_running().await,
                    pty_sessions: link.ptys().len(),
                    log_streams: link.logs().len(),
                };
                Ok(to_payload(&status))
            }
            Event::StartPty => {
                let request: PtyStartRequest = from_payload(data)?;
                link.ptys()
                    .start(&self.agent_id, link.outbound(), request, &self.shell, &self.working_dir)
                    .map(String::into_bytes)
            }
            Event::StartLogStream => link
                .logs()
                .start(&self.agent_id, link.outbound(), &self.log_file)
                .map(String::into_bytes),
            Event::StopLogStream => {
                let session_id = String::from_utf8_lossy(data);
                link.logs().stop(session_id.trim()).map(|()| Vec::new())
            }
            Event::CreateWorker => self.workers.create(data).await,
            Event::RemoveWorker => self.workers.remove(data).await,
            Event::GetWorkerStatus => self.workers.status(data).await,
            Event::InstallWorkerRuntime => self.workers.install(data).await,
            Event::Ping => Ok(VersionInfo::current().to_bytes()),
            other @ (Event::Pong | Event::Error | Event::Unknown(_)) => {
                Err(format!("unknown event: {other}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::agent::engine::{NoWorkerRuntime, ProcessEngine};

    struct PanickyEngine;

    #[async_trait]
    impl ProxyEngine for PanickyEngine {
        async fn update_config(&self, _config: &[u8]) -> Result<(), String> {
            Ok(())
        }
        async fn remove_config(&self) -> Result<(), String> {
            Ok(())
        }
        async fn start(&self) -> Result<(), String> {
            panic!("engine exploded");
        }
        async fn stop(&self) -> Result<(), String> {
            Err("not running".into())
        }
        async fn is_running(&self) -> bool {
            false
        }
        async fn proxy_info(&self) -> Result<Vec<u8>, String> {
            Ok(b"listen 0.0.0.0:8080".to_vec())
        }
    }

    fn dispatcher(engine: Arc<dyn ProxyEngine>) -> Dispatcher {
        let config = AgentConfig {
            id: "edge-1".into(),
            ..AgentConfig::default()
        };
        Dispatcher::new(&config, engine, Arc::new(NoWorkerRuntime))
    }

    fn link() -> (Link, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        (Link::new("edge-1", tx), rx)
    }

    fn request(event: Event, data: &[u8]) -> Envelope {
        Envelope::new(event, "edge-1", "call-1", data.to_vec())
    }

    #[tokio::test]
    async fn unknown_event_gets_explicit_error() {
        let d = dispatcher(Arc::new(PanickyEngine));
        let (link, _rx) = link();
        let reply = d.dispatch(&link, request(Event::from_wire("reboot"), b"")).await;
        assert_eq!(reply.event(), &Event::Error);
        assert_eq!(reply.session_id(), "call-1");
        assert_eq!(reply.data_str(), "unknown event: reboot");
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_reply() {
        let d = dispatcher(Arc::new(PanickyEngine));
        let (link, _rx) = link();
        let reply = d.dispatch(&link, request(Event::Start, b"")).await;
        assert_eq!(reply.event(), &Event::Error);
        assert!(reply.data_str().contains("start"));

        // The dispatcher is still usable afterwards.
        let reply = d.dispatch(&link, request(Event::GetProxyInfo, b"")).await;
        assert_eq!(reply.event(), &Event::GetProxyInfo);
        assert_eq!(reply.data(), b"listen 0.0.0.0:8080");
    }

    #[tokio::test]
    async fn handler_error_is_forwarded() {
        let d = dispatcher(Arc::new(PanickyEngine));
        let (link, _rx) = link();
        let reply = d.dispatch(&link, request(Event::Stop, b"")).await;
        assert_eq!(reply.event(), &Event::Error);
        assert_eq!(reply.data_str(), "not running");

        let reply = d.dispatch(&link, request(Event::CreateWorker, b"{}")).await;
        assert_eq!(reply.data_str(), "no worker runtime installed");
    }

    #[tokio::test]
    async fn status_reports_identity_and_counts() {
        let dir = std::env::temp_dir().join(format!("proxyfleet-dispatch-{}", std::process::id()));
        let engine = ProcessEngine::new(&dir, &dir.join("proxy.log"), None);
        let d = dispatcher(Arc::new(engine));
        let (link, _rx) = link();
        let reply = d.dispatch(&link, request(Event::GetStatus, b"")).await;
        assert_eq!(reply.event(), &Event::GetStatus);
        let status: AgentStatus = serde_json::from_slice(reply.data()).unwrap();
        assert_eq!(status.agent_id, "edge-1");
        assert!(!status.proxy_running);
        assert_eq!(status.pty_sessions, 0);
        assert_eq!(status.version, VersionInfo::current());
    }

    #[test]
    fn pong_echoes_correlation_key() {
        let ping = Envelope::new(Event::Ping, "edge-1", "hb-7", Vec::new());
        let pong = Dispatcher::pong(&ping);
        assert_eq!(pong.event(), &Event::Pong);
        assert_eq!(pong.session_id(), "hb-7");
        let version: VersionInfo = serde_json::from_slice(pong.data()).unwrap();
        assert_eq!(version.protocol, crate::protocol::PROTOCOL_VERSION);
    }
}
