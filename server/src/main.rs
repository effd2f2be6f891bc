#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # proxyfleet
//!
//! Control plane for a fleet of proxy agents.
//!
//! The master listens on a single port. Each accepted connection is sniffed
//! and handed either to the HTTP API or to the agent RPC acceptor; TLS is
//! terminated first when the client opens with a handshake. Agents dial out
//! to the master, authenticate with a shared token, and then serve requests
//! (proxy config, process control, PTY shells, log tails) over that one
//! multiplexed connection.
//!
//! ## Subcommands
//!
//! - `proxyfleet master` — run the master (HTTP API + agent RPC)
//! - `proxyfleet agent` — run an agent that connects to a master
//!
//! ## API surface
//!
//! | Method | Path                      | Auth | Description                        |
//! |--------|---------------------------|------|------------------------------------|
//! | GET    | `/api/health`             | No   | Liveness probe                     |
//! | GET    | `/api/agents`             | Yes  | Connected agents                   |
//! | POST   | `/api/agents/{id}/rpc`    | Yes  | Request/response call to one agent |
//! | GET    | `/api/agents/{id}/pty`    | Yes* | WebSocket terminal on the agent    |
//! | GET    | `/api/agents/{id}/logs`   | Yes* | WebSocket tail of the proxy log    |
//!
//! *WebSocket auth is via `?token=<key>` query param.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, wiring, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! auth.rs          — Bearer token middleware, agent handshake verification
//! error.rs         — TransportError and its HTTP mapping
//! protocol/        — events, envelopes, frame codec
//! mux/             — protocol sniffing, TLS termination, sub-listeners
//! rpc/             — registry, pending calls, session channels, acceptor
//! bridge/          — PTY and log-stream bridges to operator WebSockets
//! routes/          — HTTP handlers
//! agent/           — agent reconnect loop, dispatcher, PTY, logs, engine
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use proxyfleet::agent::engine::{NoWorkerRuntime, ProcessEngine, ProxyEngine};
use proxyfleet::agent::{self, Dispatcher};
use proxyfleet::config::Config;
use proxyfleet::mux::{self, tls, MuxConfig};
use proxyfleet::rpc::acceptor::{serve_connection, AcceptorOptions};
use proxyfleet::{routes, AppState, Registry};

/// How long the mux waits for enough bytes to classify a connection.
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Control plane for a fleet of proxy agents.
#[derive(Parser)]
#[command(name = "proxyfleet", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master: HTTP API and agent RPC on one port.
    Master {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run an agent that dials the master.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Master { config } => run_master(load_config(config.as_deref())).await,
        Commands::Agent { config } => run_agent(load_config(config.as_deref())).await,
    }
}

/// Load configuration and initialize tracing. `RUST_LOG` wins over the
/// configured level.
fn load_config(path: Option<&str>) -> Config {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("proxyfleet: {e}");
            std::process::exit(1);
        }
    };
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    config
}

fn tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>, String> {
    let Some(tls_config) = &config.tls else {
        return Ok(None);
    };
    let server_config = match (&tls_config.cert, &tls_config.key) {
        (Some(cert), Some(key)) => {
            tls::load_server_config(cert, key).map_err(|e| e.to_string())?
        }
        _ if tls_config.self_signed => {
            let (server_config, _) =
                tls::self_signed(vec!["localhost".into()]).map_err(|e| e.to_string())?;
            warn!("Using a generated self-signed certificate; agents need insecure_skip_verify");
            server_config
        }
        _ => return Err("[tls] needs both cert and key, or self_signed = true".into()),
    };
    Ok(Some(TlsAcceptor::from(server_config)))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn run_master(config: Config) {
    info!("proxyfleet master v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.master.listen);

    if config.master.api_key == "change-me" {
        warn!("Using default API key, set PROXYFLEET_API_KEY or update config");
    }
    if config.master.agent_token.is_empty() {
        warn!("No agent token configured, every agent handshake will be rejected");
    }

    let tls = match tls_acceptor(&config) {
        Ok(tls) => tls,
        Err(e) => {
            error!("TLS setup failed: {e}");
            std::process::exit(1);
        }
    };
    if tls.is_some() {
        info!(require_tls_for_rpc = config.master.require_tls_for_rpc, "TLS enabled");
    }

    let registry = Arc::new(Registry::new());
    let state = AppState::new(Arc::new(config), Arc::clone(&registry));
    let master = &state.config.master;

    let listener = TcpListener::bind(&master.listen)
        .await
        .expect("Failed to bind");
    let (http_listener, mut rpc_listener, mux_task) = mux::spawn(
        listener,
        MuxConfig {
            tls,
            require_tls_for_rpc: master.require_tls_for_rpc,
            detect_timeout: DETECT_TIMEOUT,
        },
    )
    .expect("Failed to start listener");

    let options = Arc::new(AcceptorOptions {
        agent_token: master.agent_token.clone(),
        handshake_timeout: Duration::from_secs(master.handshake_timeout_secs),
    });
    let accept_registry = Arc::clone(&registry);
    let accept_task = tokio::spawn(async move {
        while let Some(accepted) = rpc_listener.accept().await {
            tokio::spawn(serve_connection(
                accepted.stream,
                Some(accepted.peer),
                Arc::clone(&accept_registry),
                Arc::clone(&options),
            ));
        }
    });

    // Evict agents whose heartbeats stopped
    let sweep_task = tokio::spawn(Arc::clone(&registry).run_sweeper(
        Duration::from_secs(master.sweep_interval_secs.max(1)),
        Duration::from_secs(master.heartbeat_timeout_secs),
    ));

    info!("Master ready");

    axum::serve(http_listener, routes::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    mux_task.abort();
    accept_task.abort();
    sweep_task.abort();
    let drained = registry.drain_all("server shutting down").await;
    info!(agents = drained, "Goodbye");
}

async fn run_agent(config: Config) {
    let agent_config = Arc::new(config.agent);
    info!(
        "proxyfleet agent v{} starting as {}",
        env!("CARGO_PKG_VERSION"),
        agent_config.id
    );
    if agent_config.token.is_empty() {
        warn!("No agent token configured, set PROXYFLEET_AGENT_TOKEN");
    }

    let engine = Arc::new(ProcessEngine::from_config(&agent_config));
    let dispatcher = Arc::new(Dispatcher::new(
        &agent_config,
        Arc::clone(&engine) as Arc<dyn ProxyEngine>,
        Arc::new(NoWorkerRuntime),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link_task = tokio::spawn(agent::run(agent_config, dispatcher, shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = link_task.await {
        warn!("Agent task ended abnormally: {e}");
    }

    info!("Shutting down...");
    if let Err(e) = engine.stop().await {
        warn!("Failed to stop proxy: {e}");
    }
    info!("Goodbye");
}
