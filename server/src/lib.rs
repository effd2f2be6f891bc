#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! proxyfleet library: the master's control plane and the agent runtime.
//!
//! - `protocol` — event names, envelopes, and the length-prefixed frame codec
//! - `rpc` — agent registry, pending calls, and the master-side acceptor
//! - `mux` — single-port TLS/RPC/HTTP protocol sniffing
//! - `bridge` — operator WebSocket to agent PTY and log-stream bridging
//! - `routes` — REST and WebSocket handlers
//! - `agent` — the outbound agent: reconnect loop, dispatcher, PTY, logs
//! - `auth` — operator API key middleware and agent handshake checks
//! - `config` — TOML + env-var configuration

pub mod agent;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod routes;
pub mod rpc;
pub mod state;

pub use auth::ApiKey;
pub use config::Config;
pub use error::TransportError;
pub use protocol::{Envelope, Event};
pub use rpc::{Registry, Transport};
pub use state::AppState;
