//! Proxy process management and the worker runtime seam.
//!
//! The agent does not understand proxy configuration; it stores whatever the
//! master sends in `<data_dir>/proxy.conf` and runs `proxy_command` with
//! `PROXYFLEET_PROXY_CONFIG` pointing at that file. Proxy stdout/stderr are
//! appended to the agent's `log_file`, which is what log streams follow.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AgentConfig;

const CONFIG_FILE: &str = "proxy.conf";
const STOP_GRACE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn update_config(&self, config: &[u8]) -> Result<(), String>;
    async fn remove_config(&self) -> Result<(), String>;
    async fn start(&self) -> Result<(), String>;
    async fn stop(&self) -> Result<(), String>;
    async fn is_running(&self) -> bool;
    /// Current proxy configuration as stored on disk.
    async fn proxy_info(&self) -> Result<Vec<u8>, String>;
}

/// Worker sandboxes. Only the no-op implementation ships.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn create(&self, spec: &[u8]) -> Result<Vec<u8>, String>;
    async fn remove(&self, spec: &[u8]) -> Result<Vec<u8>, String>;
    async fn status(&self, spec: &[u8]) -> Result<Vec<u8>, String>;
    async fn install(&self, spec: &[u8]) -> Result<Vec<u8>, String>;
}

pub struct NoWorkerRuntime;

const NO_RUNTIME: &str = "no worker runtime installed";

#[async_trait]
impl WorkerRuntime for NoWorkerRuntime {
    async fn create(&self, _spec: &[u8]) -> Result<Vec<u8>, String> {
        Err(NO_RUNTIME.into())
    }
    async fn remove(&self, _spec: &[u8]) -> Result<Vec<u8>, String> {
        Err(NO_RUNTIME.into())
    }
    async fn status(&self, _spec: &[u8]) -> Result<Vec<u8>, String> {
        Err(NO_RUNTIME.into())
    }
    async fn install(&self, _spec: &[u8]) -> Result<Vec<u8>, String> {
        Err(NO_RUNTIME.into())
    }
}

/// Runs the proxy as a child process of the agent.
pub struct ProcessEngine {
    config_path: PathBuf,
    log_file: PathBuf,
    command: Option<Vec<String>>,
    child: Mutex<Option<Child>>,
}

impl ProcessEngine {
    pub fn new(data_dir: &Path, log_file: &Path, proxy_command: Option<&str>) -> Self {
        let command = proxy_command
            .map(|c| c.split_whitespace().map(String::from).collect::<Vec<_>>())
            .filter(|argv| !argv.is_empty());
        Self {
            config_path: data_dir.join(CONFIG_FILE),
            log_file: log_file.to_path_buf(),
            command,
            child: Mutex::new(None),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(&config.data_dir, &config.log_file, config.proxy_command.as_deref())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn log_stdio(&self) -> Result<(Stdio, Stdio), String> {
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(|e| format!("cannot open {}: {e}", self.log_file.display()))?;
        let err = file.try_clone().map_err(|e| e.to_string())?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

/// True while `child` has not exited; reaps it otherwise.
fn still_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[async_trait]
impl ProxyEngine for ProcessEngine {
    async fn update_config(&self, config: &[u8]) -> Result<(), String> {
        if config.is_empty() {
            return Err("empty proxy configuration".into());
        }
        let dir = self
            .config_path
            .parent()
            .ok_or_else(|| "config path has no parent".to_string())?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
        // Write-then-rename so a running proxy never sees a torn file.
        let tmp = self.config_path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, config)
            .await
            .map_err(|e| format!("cannot write {}: {e}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.config_path)
            .await
            .map_err(|e| format!("cannot replace {}: {e}", self.config_path.display()))?;
        info!(path = %self.config_path.display(), bytes = config.len(), "Proxy configuration updated");
        Ok(())
    }

    async fn remove_config(&self) -> Result<(), String> {
        match tokio::fs::remove_file(&self.config_path).await {
            Ok(()) => {
                info!("Proxy configuration removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("cannot remove {}: {e}", self.config_path.display())),
        }
    }

    async fn start(&self) -> Result<(), String> {
        let Some(argv) = &self.command else {
            return Err("no proxy_command configured".into());
        };
        if !self.config_path.exists() {
            return Err("no proxy configuration, send update-config first".into());
        }
        let mut child = self.child.lock().await;
        if let Some(running) = child.as_mut() {
            if still_running(running) {
                return Ok(());
            }
        }
        let (stdout, stderr) = self.log_stdio()?;
        let spawned = Command::new(&argv[0])
            .args(&argv[1..])
            .env("PROXYFLEET_PROXY_CONFIG", &self.config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", argv[0]))?;
        info!(pid = spawned.id(), command = %argv.join(" "), "Proxy started");
        *child = Some(spawned);
        Ok(())
    }

    async fn stop(&self) -> Result<(), String> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if !still_running(&mut child) {
            return Ok(());
        }
        if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Proxy stopped"),
            Ok(Err(e)) => warn!("Proxy wait failed: {e}"),
            Err(_) => {
                warn!("Proxy ignored SIGTERM, killing");
                child.kill().await.map_err(|e| format!("failed to kill proxy: {e}"))?;
            }
        }
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        let alive = child.as_mut().is_some_and(still_running);
        if !alive {
            *child = None;
        }
        alive
    }

    async fn proxy_info(&self) -> Result<Vec<u8>, String> {
        match tokio::fs::read(&self.config_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err("no proxy configuration".into())
            }
            Err(e) => Err(format!("cannot read {}: {e}", self.config_path.display())),
        }
    }
}
