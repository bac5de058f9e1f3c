//! Daemon configuration
//!
//! Values are layered: environment variable > JSON config file > built-in
//! default. The config file lives at `~/.config/agent-hub-daemon/config.json`
//! and is optional; a malformed file is treated as absent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::error::{HubError, Result};

/// Default hub API port.
pub const DEFAULT_PORT: u16 = 4096;

/// Reserved title identifying the coordinator session.
pub const COORDINATOR_TITLE: &str = "agent-hub-coordinator";

/// Resolved daemon configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Root state directory (default `~/.agent-hub`)
    pub hub_dir: PathBuf,
    /// Base URL of the hub HTTP API
    pub hub_url: String,
    /// Hub API port (used when the daemon launches the backend itself)
    pub port: u16,

    /// Messages older than this are archived by GC
    pub message_ttl: Duration,
    /// Agents unseen for longer than this are stale
    pub agent_stale_after: Duration,
    /// GC sweep interval
    pub gc_interval: Duration,
    /// Live-session poll interval
    pub session_poll_interval: Duration,
    /// Session list cache TTL
    pub session_cache_ttl: Duration,
    /// Mailbox directory scan interval
    pub mailbox_scan_interval: Duration,
    /// Metrics file write interval
    pub metrics_interval: Duration,

    /// Injection worker pool size
    pub injection_workers: usize,
    /// Injection attempts before giving up
    pub injection_retries: u32,
    /// Per-request injection timeout
    pub injection_timeout: Duration,

    /// Master switch for rate limiting
    pub rate_limit_enabled: bool,
    /// Max messages per sender inside the window
    pub rate_limit_max: usize,
    /// Sliding window length
    pub rate_limit_window: Duration,
    /// Minimum interval between messages from one sender (0 = off)
    pub rate_limit_cooldown: Duration,

    /// Orientation re-injections before giving up (0 disables retry tracking)
    pub orientation_retry_max: u32,
    /// Wait between orientation retries
    pub orientation_retry_delay: Duration,

    /// Working directory reserved for the coordinator session
    pub coordinator_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            hub_dir: home.join(".agent-hub"),
            hub_url: format!("http://localhost:{DEFAULT_PORT}"),
            port: DEFAULT_PORT,
            message_ttl: Duration::from_secs(3600),
            agent_stale_after: Duration::from_secs(3600),
            gc_interval: Duration::from_secs(60),
            session_poll_interval: Duration::from_secs(5),
            session_cache_ttl: Duration::from_secs(10),
            mailbox_scan_interval: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(30),
            injection_workers: 4,
            injection_retries: 3,
            injection_timeout: Duration::from_secs(5),
            rate_limit_enabled: false,
            rate_limit_max: 10,
            rate_limit_window: Duration::from_secs(300),
            rate_limit_cooldown: Duration::ZERO,
            orientation_retry_max: 2,
            orientation_retry_delay: Duration::from_secs(120),
            coordinator_dir: home.join(".agent-hub/coordinator"),
        }
    }
}

impl HubConfig {
    /// Load configuration from the default config file location plus
    /// environment overrides.
    pub fn from_env() -> Self {
        let file = load_config_file(&config_file_path());
        Self::from_sources(&file)
    }

    /// Build a config from a parsed config file, applying env overrides.
    fn from_sources(file: &Value) -> Self {
        let defaults = Self::default();
        let port = get_u64("OPENCODE_PORT", file, &["opencode_port"])
            .map(|p| p as u16)
            .unwrap_or(defaults.port);

        Self {
            hub_url: get_string("OPENCODE_URL", file, &["opencode_url"])
                .unwrap_or_else(|| format!("http://localhost:{port}")),
            port,
            rate_limit_enabled: get_bool("AGENT_HUB_RATE_LIMIT", file, &["rate_limit", "enabled"])
                .unwrap_or(defaults.rate_limit_enabled),
            rate_limit_max: get_u64(
                "AGENT_HUB_RATE_LIMIT_MAX",
                file,
                &["rate_limit", "max_messages"],
            )
            .map(|v| v as usize)
            .unwrap_or(defaults.rate_limit_max),
            rate_limit_window: get_secs(
                "AGENT_HUB_RATE_LIMIT_WINDOW",
                file,
                &["rate_limit", "window_seconds"],
            )
            .unwrap_or(defaults.rate_limit_window),
            rate_limit_cooldown: get_secs(
                "AGENT_HUB_RATE_LIMIT_COOLDOWN",
                file,
                &["rate_limit", "cooldown_seconds"],
            )
            .unwrap_or(defaults.rate_limit_cooldown),
            orientation_retry_max: get_u64(
                "AGENT_HUB_ORIENTATION_RETRY_MAX",
                file,
                &["orientation", "retry_max"],
            )
            .map(|v| v as u32)
            .unwrap_or(defaults.orientation_retry_max),
            orientation_retry_delay: get_secs(
                "AGENT_HUB_ORIENTATION_RETRY_DELAY",
                file,
                &["orientation", "retry_delay_seconds"],
            )
            .unwrap_or(defaults.orientation_retry_delay),
            message_ttl: get_secs("AGENT_HUB_MESSAGE_TTL", file, &["message_ttl_seconds"])
                .unwrap_or(defaults.message_ttl),
            ..defaults
        }
    }

    /// Mailbox directory with inbound message files.
    pub fn messages_dir(&self) -> PathBuf {
        self.hub_dir.join("messages")
    }

    /// Archive area for delivered/expired/rate-limited messages.
    pub fn archive_dir(&self) -> PathBuf {
        self.messages_dir().join("archive")
    }

    /// One JSON file per thread.
    pub fn threads_dir(&self) -> PathBuf {
        self.hub_dir.join("threads")
    }

    /// One JSON file per registered agent.
    pub fn agents_dir(&self) -> PathBuf {
        self.hub_dir.join("agents")
    }

    /// Persisted oriented-session set.
    pub fn oriented_sessions_file(&self) -> PathBuf {
        self.hub_dir.join("oriented_sessions.json")
    }

    /// Persisted session→agent index.
    pub fn session_agents_file(&self) -> PathBuf {
        self.hub_dir.join("session_agents.json")
    }

    /// Prometheus text metrics file, read by the dashboard.
    pub fn metrics_file(&self) -> PathBuf {
        self.hub_dir.join("metrics.prom")
    }

    /// Create every state directory the daemon needs.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.messages_dir(),
            self.archive_dir(),
            self.threads_dir(),
            self.agents_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Sanity checks on values the rest of the daemon assumes.
    pub fn validate(&self) -> Result<()> {
        if self.injection_workers == 0 {
            return Err(HubError::invalid_config("injection_workers must be > 0"));
        }
        if self.rate_limit_enabled && self.rate_limit_max == 0 {
            return Err(HubError::invalid_config(
                "rate_limit_max must be > 0 when rate limiting is enabled",
            ));
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn config_file_path() -> PathBuf {
    home_dir().join(".config/agent-hub-daemon/config.json")
}

/// Parse the JSON config file; missing or malformed files are an empty map.
fn load_config_file(path: &Path) -> Value {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("Ignoring malformed config file {}: {}", path.display(), e);
            Value::Object(Default::default())
        }),
        Err(_) => Value::Object(Default::default()),
    }
}

fn file_lookup<'a>(file: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = file;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

fn get_string(env: &str, file: &Value, path: &[&str]) -> Option<String> {
    if let Ok(v) = std::env::var(env) {
        return Some(v);
    }
    file_lookup(file, path).and_then(|v| v.as_str().map(str::to_owned))
}

fn get_u64(env: &str, file: &Value, path: &[&str]) -> Option<u64> {
    if let Ok(v) = std::env::var(env) {
        return v.trim().parse().ok();
    }
    match file_lookup(file, path)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_secs(env: &str, file: &Value, path: &[&str]) -> Option<Duration> {
    get_u64(env, file, path).map(Duration::from_secs)
}

fn get_bool(env: &str, file: &Value, path: &[&str]) -> Option<bool> {
    if let Ok(v) = std::env::var(env) {
        return Some(matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        ));
    }
    match file_lookup(file, path)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(matches!(
            s.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        )),
        _ => None,
    }
}
