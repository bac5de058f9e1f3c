//! Backend hub server supervision
//!
//! The daemon needs the backend HTTP API alive to do anything. This module
//! probes it, launches a headless server when nothing is listening, keeps a
//! handle on the child so only a daemon-launched server is ever stopped,
//! and restarts it when it dies.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::HubConfig;
use crate::error::{HubError, Result};

/// Backend CLI binary name.
const BACKEND_BIN: &str = "opencode";

/// Liveness probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Startup poll: 30 probes, 500 ms apart.
const START_POLL_ATTEMPTS: u32 = 30;
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Supervises the backend server process.
pub struct HubServer {
    base_url: String,
    port: u16,
    http: reqwest::Client,
    child: Mutex<Option<Child>>,
}

/// Startup precondition: the backend CLI must be installed. Fails before
/// any state directory or worker is created.
pub fn preflight() -> Result<PathBuf> {
    which::which(BACKEND_BIN).map_err(|_| {
        HubError::precondition(format!(
            "{BACKEND_BIN} binary not found in PATH; install it before starting the daemon"
        ))
    })
}

impl HubServer {
    /// Create a supervisor for the configured hub URL/port.
    pub fn new(config: &HubConfig) -> Self {
        Self {
            base_url: config.hub_url.clone(),
            port: config.port,
            http: reqwest::Client::new(),
            child: Mutex::new(None),
        }
    }

    /// True when something answers the session-list endpoint.
    pub async fn is_live(&self) -> bool {
        match self
            .http
            .get(format!("{}/session", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Make sure a hub server is reachable, launching one headless when it
    /// isn't. Launch output is appended to log files so crashes are
    /// diagnosable after the fact.
    ///
    /// # Errors
    /// Returns error when the binary is missing, the spawn fails, or the
    /// server never answers within the startup window.
    pub async fn ensure_started(&self) -> Result<()> {
        if self.is_live().await {
            log::info!("Hub server already running on port {}", self.port);
            return Ok(());
        }

        log::info!("Starting hub server on port {}...", self.port);
        let bin = preflight()?;

        let log_dir = log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("hub-stdout.log"))?;
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("hub-stderr.log"))?;

        let child = Command::new(bin)
            .args(["serve", "--port", &self.port.to_string(), "--print-logs"])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        let pid = child.id();
        *self.child.lock().await = Some(child);

        for _ in 0..START_POLL_ATTEMPTS {
            tokio::time::sleep(START_POLL_INTERVAL).await;
            if self.is_live().await {
                log::info!("Hub server started (PID {:?})", pid);
                return Ok(());
            }
        }

        log::error!("Hub server failed to start within timeout");
        self.stop().await;
        Err(HubError::precondition(
            "hub server failed to start within timeout",
        ))
    }

    /// Restart the server when a daemon-launched child has exited. A server
    /// the daemon did not launch is left alone.
    pub async fn check_restart(&self) {
        let died = {
            let mut child = self.child.lock().await;
            match child.as_mut() {
                Some(c) => matches!(c.try_wait(), Ok(Some(_))),
                None => false,
            }
        };
        if died {
            log::warn!("Hub server died, restarting...");
            *self.child.lock().await = None;
            if let Err(e) = self.ensure_started().await {
                log::error!("Hub server restart failed: {e}");
            }
        }
    }

    /// Stop the server, but only one this daemon launched.
    pub async fn stop(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut c) = child.take() {
            log::info!("Stopping hub server (PID {:?})...", c.id());
            if let Err(e) = c.kill().await {
                log::warn!("Failed to stop hub server: {e}");
            }
        }
    }
}

fn log_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".local/share/agent-hub-daemon")
}
