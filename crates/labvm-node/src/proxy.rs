use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Display proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Executable name (searched in PATH) or path of the websocket proxy.
    pub binary: String,
    /// Public port paired with the first display port of the range.
    pub public_port_base: u16,
    pub display_port_base: u16,
    /// Static web client served by the proxy, if any.
    pub web_root: Option<String>,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
}

impl ProxyConfig {
    pub fn from_env(display_port_base: u16) -> Self {
        Self {
            binary: std::env::var("LABVM_PROXY_BINARY").unwrap_or_else(|_| "websockify".to_string()),
            public_port_base: std::env::var("LABVM_PROXY_PORT_BASE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(6080),
            display_port_base,
            web_root: std::env::var("LABVM_PROXY_WEB_ROOT").ok().filter(|s| !s.is_empty()),
            stop_timeout: Duration::from_secs(
                std::env::var("LABVM_PROXY_STOP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }
}

/// Owns the websocket proxy processes that expose VM display channels.
///
/// Processes are keyed by public port. Every read and write of the registry
/// happens under one lock, so there is never more than one tracked process
/// per port.
pub struct ProxySupervisor {
    config: ProxyConfig,
    procs: Mutex<HashMap<u16, Child>>,
}

impl ProxySupervisor {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            procs: Mutex::new(HashMap::new()),
        }
    }

    /// Public port a VM's display port is published on.
    pub fn public_port_for(&self, display_port: u16) -> u16 {
        self.config
            .public_port_base
            .saturating_add(display_port.saturating_sub(self.config.display_port_base))
    }

    /// Make sure a live proxy forwards to `display_port` and return its public
    /// port. A tracked process that already exited is replaced.
    pub async fn ensure(&self, display_port: u16) -> Result<u16, ProxyError> {
        let public_port = self.public_port_for(display_port);
        let mut procs = self.procs.lock().await;

        if let Some(child) = procs.get_mut(&public_port) {
            match child.try_wait() {
                Ok(None) => return Ok(public_port),
                Ok(Some(status)) => {
                    warn!(public_port, %status, "display proxy exited, restarting");
                }
                Err(e) => {
                    warn!(public_port, error = %e, "display proxy unreachable, restarting");
                }
            }
            procs.remove(&public_port);
        }

        let binary = locate_binary(&self.config.binary)
            .ok_or_else(|| ProxyError::BinaryNotFound(self.config.binary.clone()))?;

        let mut cmd = Command::new(&binary);
        if let Some(root) = &self.config.web_root {
            cmd.arg("--web").arg(root);
        }
        let child = cmd
            .arg(public_port.to_string())
            .arg(format!("localhost:{}", display_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProxyError::Spawn(format!("failed to spawn {}: {}", binary.display(), e))
            })?;

        info!(public_port, display_port, pid = ?child.id(), "display proxy started");
        procs.insert(public_port, child);
        Ok(public_port)
    }

    /// Stop the proxy on `public_port`. Returns false if none was tracked.
    ///
    /// The registry entry is dropped before the process is signalled, so the
    /// entry is gone whatever the outcome of the termination.
    pub async fn stop(&self, public_port: u16) -> bool {
        let child = self.procs.lock().await.remove(&public_port);
        match child {
            Some(child) => {
                terminate(child, public_port, self.config.stop_timeout).await;
                true
            }
            None => false,
        }
    }

    /// Stop the proxy forwarding to a VM's display port, if any.
    pub async fn stop_for_display(&self, display_port: u16) -> bool {
        self.stop(self.public_port_for(display_port)).await
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(u16, Child)> = self.procs.lock().await.drain().collect();
        for (port, child) in drained {
            terminate(child, port, self.config.stop_timeout).await;
        }
    }

    /// Number of tracked processes still alive. Exited ones are pruned.
    pub async fn active_count(&self) -> usize {
        let mut procs = self.procs.lock().await;
        procs.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        procs.len()
    }

    #[cfg(test)]
    async fn pid(&self, public_port: u16) -> Option<u32> {
        self.procs.lock().await.get(&public_port).and_then(|c| c.id())
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(mut child: Child, public_port: u16, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            info!(public_port, "display proxy stopped");
            return;
        }
        warn!(public_port, "display proxy ignored SIGTERM, sending SIGKILL");
    }

    let _ = child.kill().await;
    info!(public_port, "display proxy killed");
}

/// Resolve a bare executable name through PATH; paths are used as given.
fn locate_binary(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = Path::new(binary);
        return path.is_file().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug)]
pub enum ProxyError {
    BinaryNotFound(String),
    Spawn(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::BinaryNotFound(bin) => write!(f, "display proxy executable not found: {}", bin),
            ProxyError::Spawn(msg) => write!(f, "failed to start display proxy: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}
