//! Session orientation state machine
//!
//! A session moves `unseen → oriented → acknowledged`, or is dropped from
//! retry tracking after the retry budget runs out (it stays in the oriented
//! set either way, so no session is ever greeted twice). The oriented set is
//! persisted for the external dashboard but starts empty on every daemon
//! start; the start-time gate keeps that from re-greeting history.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::agents::{is_agent_active, AgentRegistry, SessionAgentIndex};
use crate::config::{HubConfig, COORDINATOR_TITLE};
use crate::inject::Injector;
use crate::metrics::{self, Metrics};
use crate::types::{now_ms, now_secs, Agent, Session};

/// Cap on the number of peer agents listed in the orientation text.
const MAX_LISTED_AGENTS: usize = 8;

/// Retry-tracking entry for one oriented-but-unacknowledged session.
#[derive(Debug, Clone)]
pub struct PendingOrientation {
    /// Time of the most recent orientation injection, fractional seconds epoch
    pub oriented_at: f64,
    /// Re-injections performed so far
    pub retries: u32,
    /// Agent identity the orientation was addressed to
    pub agent_id: String,
}

/// Tracks which sessions have been greeted and drives the retry sweep.
pub struct OrientationTracker {
    oriented_file: PathBuf,
    oriented: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingOrientation>>,
    coordinator_session_id: Mutex<Option<String>>,
    coordinator_dir: PathBuf,
    retry_max: u32,
    retry_delay: Duration,
    agent_stale_after: Duration,
    daemon_start_ms: i64,
    injector: Injector,
    metrics: Arc<Metrics>,
}

impl OrientationTracker {
    /// Create a tracker. The oriented set intentionally starts empty even
    /// when the persisted file exists: live sessions get one fresh greeting
    /// per daemon run, and the start-time gate bounds how many that is.
    pub fn new(config: &HubConfig, injector: Injector, metrics: Arc<Metrics>) -> Self {
        Self {
            oriented_file: config.oriented_sessions_file(),
            oriented: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            coordinator_session_id: Mutex::new(None),
            coordinator_dir: config.coordinator_dir.clone(),
            retry_max: config.orientation_retry_max,
            retry_delay: config.orientation_retry_delay,
            agent_stale_after: config.agent_stale_after,
            daemon_start_ms: now_ms(),
            injector,
            metrics,
        }
    }

    /// Record the coordinator's session id once it is known.
    pub fn set_coordinator_session(&self, session_id: impl Into<String>) {
        *self.coordinator_session_id.lock() = Some(session_id.into());
    }

    /// True when the session belongs to the coordinator: known session id,
    /// reserved title, or the reserved coordinator directory.
    pub fn is_coordinator_session(&self, session: &Session) -> bool {
        if self.coordinator_session_id.lock().as_deref() == Some(session.id.as_str()) {
            return true;
        }
        if session.title.as_deref() == Some(COORDINATOR_TITLE) {
            return true;
        }
        !session.directory.is_empty() && self.coordinator_dir == PathBuf::from(&session.directory)
    }

    /// True when the session has already been greeted this run.
    pub fn is_oriented(&self, session_id: &str) -> bool {
        self.oriented.lock().contains(session_id)
    }

    /// Number of oriented sessions.
    pub fn oriented_count(&self) -> usize {
        self.oriented.lock().len()
    }

    /// Pending retry entry for a session, if tracked.
    pub fn pending_entry(&self, session_id: &str) -> Option<PendingOrientation> {
        self.pending.lock().get(session_id).cloned()
    }

    fn save_oriented(&self) {
        let mut ids: Vec<String> = self.oriented.lock().iter().cloned().collect();
        ids.sort_unstable();
        match serde_json::to_string_pretty(&ids) {
            Ok(text) => {
                if let Err(e) = fs::write(&self.oriented_file, text) {
                    log::warn!("Failed to save oriented sessions: {e}");
                }
            }
            Err(e) => log::warn!("Failed to serialize oriented sessions: {e}"),
        }
    }

    /// Discovery funnel entry point. Every way a session can be noticed
    /// (poll, startup scan) lands here; the oriented-set membership check
    /// makes racing discoveries collapse into one greeting.
    ///
    /// Returns true when the session was newly marked oriented.
    pub fn observe_session(
        &self,
        session: &Session,
        registry: &AgentRegistry,
        index: &SessionAgentIndex,
        agents: &mut HashMap<String, Agent>,
    ) -> bool {
        if session.id.is_empty() || self.is_oriented(&session.id) {
            return false;
        }

        // Sessions that predate this daemon run are never greeted.
        if session.time.created < self.daemon_start_ms {
            return false;
        }

        if self.is_coordinator_session(session) {
            return self.mark_coordinator_oriented(&session.id);
        }

        if session.directory.is_empty() {
            return false;
        }

        let agent = registry.get_or_create_by_session(session, index, agents);
        self.orient_session(&session.id, &agent, agents)
    }

    /// Add a coordinator session to the oriented set without injecting a
    /// greeting or tracking retries.
    pub fn mark_coordinator_oriented(&self, session_id: &str) -> bool {
        if !self.oriented.lock().insert(session_id.to_string()) {
            return false;
        }
        self.save_oriented();
        self.metrics
            .set_gauge(metrics::ORIENTED_SESSIONS, self.oriented_count() as f64);
        log::info!("Coordinator session {} marked oriented (no greeting)", short(session_id));
        true
    }

    /// Greet one session: enqueue the orientation injection, mark the
    /// session oriented, and start retry tracking. Idempotent; a second
    /// call for the same session returns false and injects nothing.
    pub fn orient_session(
        &self,
        session_id: &str,
        agent: &Agent,
        all_agents: &HashMap<String, Agent>,
    ) -> bool {
        if session_id.is_empty() {
            return false;
        }
        if !self.oriented.lock().insert(session_id.to_string()) {
            return false;
        }

        if self.coordinator_session_id.lock().as_deref() == Some(session_id) {
            // Late coordinator detection: oriented, but never greeted.
            self.save_oriented();
            self.metrics
                .set_gauge(metrics::ORIENTED_SESSIONS, self.oriented_count() as f64);
            return true;
        }

        let text = format_orientation(agent, all_agents, self.agent_stale_after);
        self.injector.enqueue(session_id, text);

        if self.retry_max > 0 {
            self.pending.lock().insert(
                session_id.to_string(),
                PendingOrientation {
                    oriented_at: now_secs(),
                    retries: 0,
                    agent_id: agent.id.clone(),
                },
            );
        }

        self.save_oriented();
        self.metrics.inc(metrics::SESSIONS_ORIENTED);
        self.metrics
            .set_gauge(metrics::ORIENTED_SESSIONS, self.oriented_count() as f64);
        log::info!("Oriented session {} for agent {}", short(session_id), agent.id);
        true
    }

    /// Periodic retry sweep over the pending table.
    ///
    /// Per entry: drop it when the agent's lastSeen reached orientedAt
    /// (acknowledged); otherwise, once the retry delay has elapsed, either
    /// re-inject and bump the retry count, or drop the entry for good when
    /// the budget is spent. A missing agent record is not proof of
    /// acknowledgment, so those entries still retry.
    pub fn check_retries(&self, agents: &HashMap<String, Agent>) {
        let snapshot: Vec<(String, PendingOrientation)> = self
            .pending
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if snapshot.is_empty() {
            return;
        }

        let now = now_secs();
        for (session_id, entry) in snapshot {
            if let Some(agent) = agents.get(&entry.agent_id)
                && agent.last_seen as f64 / 1000.0 >= entry.oriented_at
            {
                self.pending.lock().remove(&session_id);
                log::debug!(
                    "Session {} acknowledged orientation (agent {})",
                    short(&session_id),
                    entry.agent_id
                );
                continue;
            }

            if now - entry.oriented_at < self.retry_delay.as_secs_f64() {
                continue;
            }

            if entry.retries >= self.retry_max {
                self.pending.lock().remove(&session_id);
                self.metrics.inc(metrics::ORIENTATION_GAVE_UP);
                log::warn!(
                    "Giving up on orientation for session {} after {} retries",
                    short(&session_id),
                    entry.retries
                );
                continue;
            }

            let agent = agents.get(&entry.agent_id).cloned().unwrap_or_else(|| Agent {
                id: entry.agent_id.clone(),
                session_id: Some(session_id.clone()),
                project_path: String::new(),
                role: String::new(),
                capabilities: Vec::new(),
                collaborates_with: Vec::new(),
                last_seen: 0,
                status: String::new(),
                auto_created: true,
            });
            let text = format_orientation(&agent, agents, self.agent_stale_after);
            self.injector.enqueue(session_id.clone(), text);

            let mut pending = self.pending.lock();
            if let Some(live) = pending.get_mut(&session_id) {
                live.retries = entry.retries + 1;
                live.oriented_at = now_secs();
            }
            drop(pending);

            self.metrics.inc(metrics::ORIENTATION_RETRIES);
            log::info!(
                "Re-injected orientation for session {} (retry {}/{})",
                short(&session_id),
                entry.retries + 1,
                self.retry_max
            );
        }
    }

    /// GC step: keep only oriented sessions that are live and were updated
    /// within `ttl`. `live` must be a successful (possibly non-empty) fetch;
    /// the caller skips the call on fetch failure so an outage never wipes
    /// the set. Returns the number removed.
    pub fn prune(&self, live: &[Session], ttl: Duration) -> usize {
        let mut oriented = self.oriented.lock();
        if oriented.is_empty() {
            return 0;
        }

        let now = now_ms();
        let active_ids: HashSet<&str> = live
            .iter()
            .filter(|s| !s.id.is_empty())
            .filter(|s| ((now - s.time.updated) as i128) < ttl.as_millis() as i128)
            .map(|s| s.id.as_str())
            .collect();

        let before = oriented.len();
        oriented.retain(|id| active_ids.contains(id.as_str()));
        let removed = before - oriented.len();
        drop(oriented);

        if removed > 0 {
            self.save_oriented();
            self.metrics
                .set_gauge(metrics::ORIENTED_SESSIONS, self.oriented_count() as f64);
            log::info!(
                "GC: Removed {removed} inactive oriented sessions, {} remaining",
                self.oriented_count()
            );
        }
        removed
    }
}

/// Render the greeting injected into a newly discovered session. Lists the
/// agent's own identity, its project, the other currently active agents
/// (capped), and the communication protocol hints.
pub fn format_orientation(
    agent: &Agent,
    all_agents: &HashMap<String, Agent>,
    stale_after: Duration,
) -> String {
    let mut others: Vec<&str> = all_agents
        .values()
        .filter(|a| a.id != agent.id && is_agent_active(a, stale_after))
        .map(|a| a.id.as_str())
        .collect();
    others.sort_unstable();

    let mut agents_str = others
        .iter()
        .take(MAX_LISTED_AGENTS)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    if others.len() > MAX_LISTED_AGENTS {
        agents_str.push_str(&format!(" (+{} more)", others.len() - MAX_LISTED_AGENTS));
    }

    let mut lines = vec![
        "┌─────────────────────────────────────────────────".to_string(),
        "│ 🔗 AGENT HUB - CONNECTED".to_string(),
        "├─────────────────────────────────────────────────".to_string(),
        format!("│ You are: {}", agent.id),
        format!("│ Project: {}", agent.project_path),
    ];

    if !others.is_empty() {
        lines.push("├─────────────────────────────────────────────────".to_string());
        lines.push(format!("│ Other agents: {agents_str}"));
    }

    lines.extend(
        [
            "├─────────────────────────────────────────────────",
            "│ COMMUNICATION PROTOCOL (be proactive, stay minimal):",
            "│",
            "│ SEND when:",
            "│  • Starting work that affects another agent's domain",
            "│  • Blocked and need input from a specific agent",
            "│  • Completed a task requested by another agent",
            "│  • Hit a critical error others should know about",
            "│",
            "│ DO NOT send:",
            "│  • Progress updates or status checks",
            "│  • Acknowledgments ('got it', 'thanks')",
            "│  • Info already in shared files",
            "│",
            "│ Keep messages to 1-2 sentences.",
            "│ Use agent-hub tools: send_message, sync, get_hub_status",
            "└─────────────────────────────────────────────────",
        ]
        .into_iter()
        .map(str::to_string),
    );

    lines.join("\n")
}

fn short(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}
