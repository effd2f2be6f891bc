//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PROXYFLEET_API_KEY`, `PROXYFLEET_LISTEN`,
//!    `PROXYFLEET_AGENT_TOKEN`, `PROXYFLEET_AGENT_ID`, `PROXYFLEET_MASTER_ADDR`
//! 2. **Config file** — path via `--config <path>`, or `proxyfleet.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [master]
//! listen = "0.0.0.0:9000"
//! api_key = "your-secret-key"
//! agent_token = "shared-agent-secret"
//! call_timeout_secs = 10
//! heartbeat_timeout_secs = 90
//! sweep_interval_secs = 30
//! handshake_timeout_secs = 10
//! require_tls_for_rpc = false
//!
//! # Optional — omit entirely to serve plain text only
//! [tls]
//! cert = "/etc/proxyfleet/cert.pem"
//! key = "/etc/proxyfleet/key.pem"
//! # self_signed = true                    # mint an in-memory cert instead
//!
//! [pty]
//! keepalive_timeout_secs = 10
//! error_limit = 10
//! start_timeout_secs = 10
//!
//! [agent]
//! id = "edge-01"
//! master_addr = "master.example.com:9000"
//! token = "shared-agent-secret"
//! tls = true
//! ca_cert = "/etc/proxyfleet/ca.pem"
//! proxy_command = "/usr/bin/frps -c /var/lib/proxyfleet/proxy.toml"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "proxyfleet.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub master: MasterConfig,
    /// Optional TLS for the mux. Without it only plain text is accepted.
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub pty: PtyConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Master listener, authentication and RPC deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Socket address to bind (default `0.0.0.0:9000`). HTTP, WebSocket and
    /// agent RPC all share this port.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bearer token for the HTTP API. Override with `PROXYFLEET_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Shared secret agents present in their hello. Empty rejects every agent.
    #[serde(default)]
    pub agent_token: String,
    /// Default request/reply deadline (default 10).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Evict connections silent for longer than this (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// How often the eviction sweep runs (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Deadline for preface + hello on new RPC connections (default 10).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Refuse agent RPC that did not arrive over TLS (default false).
    #[serde(default)]
    pub require_tls_for_rpc: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub self_signed: bool,
}

/// Interactive PTY bridge tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PtyConfig {
    /// Tear a session down when the terminal has not answered a keepalive
    /// for this long (default 10). Probes go out at half this interval.
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    /// Consecutive terminal write failures tolerated (default 10).
    #[serde(default = "default_error_limit")]
    pub error_limit: u32,
    /// Deadline for the agent to acknowledge `start-pty` (default 10).
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

/// Settings for `proxyfleet agent`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity presented to the master. Override with `PROXYFLEET_AGENT_ID`.
    #[serde(default = "default_agent_id")]
    pub id: String,
    /// `host:port` of the master. Override with `PROXYFLEET_MASTER_ADDR`.
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    /// Must match the master's `agent_token`. Override with `PROXYFLEET_AGENT_TOKEN`.
    #[serde(default)]
    pub token: String,
    /// Connect over TLS (default false).
    #[serde(default)]
    pub tls: bool,
    /// SNI / verification name. Defaults to the host part of `master_addr`.
    pub server_name: Option<String>,
    /// PEM bundle of trusted roots for the master certificate.
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Shell for PTY sessions (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// File followed by `start-log-stream`.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// Where the proxy configuration file is written.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Command line of the managed proxy process, split on whitespace.
    #[serde(default)]
    pub proxy_command: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_call_timeout() -> u64 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_keepalive_timeout() -> u64 {
    10
}
fn default_error_limit() -> u32 {
    10
}
fn default_start_timeout() -> u64 {
    10
}
fn default_agent_id() -> String {
    "agent-0001".to_string()
}
fn default_master_addr() -> String {
    "127.0.0.1:9000".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_working_dir() -> String {
    "/".to_string()
}
fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/proxyfleet/proxy.log")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/proxyfleet")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: default_api_key(),
            agent_token: String::new(),
            call_timeout_secs: default_call_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            require_tls_for_rpc: false,
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout_secs: default_keepalive_timeout(),
            error_limit: default_error_limit(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            master_addr: default_master_addr(),
            token: String::new(),
            tls: false,
            server_name: None,
            ca_cert: None,
            insecure_skip_verify: false,
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            shell: default_shell(),
            working_dir: default_working_dir(),
            log_file: default_log_file(),
            data_dir: default_data_dir(),
            proxy_command: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl MasterConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl AgentConfig {
    /// Name used for SNI and certificate verification.
    pub fn tls_server_name(&self) -> String {
        if let Some(name) = &self.server_name {
            return name.clone();
        }
        let host = match self.master_addr.rsplit_once(':') {
            Some((host, _port)) => host,
            None => &self.master_addr,
        };
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `proxyfleet.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("PROXYFLEET_API_KEY") {
            self.master.api_key = key;
        }
        if let Some(listen) = var("PROXYFLEET_LISTEN") {
            self.master.listen = listen;
        }
        if let Some(token) = var("PROXYFLEET_AGENT_TOKEN") {
            self.master.agent_token = token.clone();
            self.agent.token = token;
        }
        if let Some(id) = var("PROXYFLEET_AGENT_ID") {
            self.agent.id = id;
        }
        if let Some(addr) = var("PROXYFLEET_MASTER_ADDR") {
            self.agent.master_addr = addr;
        }
    }
}
