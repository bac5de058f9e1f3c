//! Agent registry and session→agent identity
//!
//! Agents live as one JSON file each under the agents directory; external
//! tools write those files too, so the registry reloads from disk rather
//! than trusting memory. The session→agent index is a single persisted map
//! that keeps concurrent sessions sharing a working directory from
//! colliding on one identity.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::metrics::{self, Metrics};
use crate::types::{now_ms, Agent, Session, SessionLink};

/// Max characters of the (stripped) session id used in derived agent ids.
const SESSION_ID_CHARS: usize = 12;

/// Derive a stable agent id for a session: the slug when one is assigned,
/// otherwise `session-` plus the id with its `ses_` prefix stripped and
/// truncated.
pub fn agent_id_for_session(session: &Session) -> String {
    if let Some(slug) = &session.slug
        && !slug.is_empty()
    {
        return slug.clone();
    }
    let stripped = session.id.strip_prefix("ses_").unwrap_or(&session.id);
    let short: String = stripped.chars().take(SESSION_ID_CHARS).collect();
    format!("session-{short}")
}

/// True when the agent was seen within `stale_after`.
pub fn is_agent_active(agent: &Agent, stale_after: Duration) -> bool {
    let age_ms = now_ms().saturating_sub(agent.last_seen);
    // A lastSeen in the future (clock skew) counts as active.
    (age_ms as i128) < stale_after.as_millis() as i128
}

// ============================================================================
// AGENT REGISTRY
// ============================================================================

/// File-backed registry of agent records.
pub struct AgentRegistry {
    agents_dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl AgentRegistry {
    /// Create a registry over `agents_dir`.
    pub fn new(agents_dir: PathBuf, metrics: Arc<Metrics>) -> Self {
        Self {
            agents_dir,
            metrics,
        }
    }

    fn agent_path(&self, agent_id: &str) -> PathBuf {
        self.agents_dir.join(format!("{agent_id}.json"))
    }

    /// Load every readable agent file, keyed by id. Updates the
    /// active-agents gauge.
    pub fn load_all(&self) -> HashMap<String, Agent> {
        let mut agents = HashMap::new();
        if let Ok(entries) = fs::read_dir(&self.agents_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let parsed = fs::read_to_string(&path)
                    .ok()
                    .and_then(|t| serde_json::from_str::<Agent>(&t).ok());
                match parsed {
                    Some(agent) => {
                        agents.insert(agent.id.clone(), agent);
                    }
                    None => log::warn!("Failed to load agent {}", path.display()),
                }
            }
        }
        self.metrics
            .set_gauge(metrics::ACTIVE_AGENTS, agents.len() as f64);
        agents
    }

    /// Load one agent by id.
    pub fn load(&self, agent_id: &str) -> Option<Agent> {
        let text = fs::read_to_string(self.agent_path(agent_id)).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Persist an agent record.
    pub fn save(&self, agent: &Agent) -> Result<()> {
        fs::create_dir_all(&self.agents_dir)?;
        let text = serde_json::to_string_pretty(agent)?;
        fs::write(self.agent_path(&agent.id), text)?;
        Ok(())
    }

    /// Delete an agent's file. Missing files are fine.
    pub fn remove(&self, agent_id: &str) {
        let _ = fs::remove_file(self.agent_path(agent_id));
    }

    /// Session-keyed identity lookup. The index is consulted first so a
    /// re-observed session always maps back to the same agent; only truly
    /// new sessions mint an identity. On an id collision with a *different*
    /// session's agent, the new id is disambiguated with a fragment of the
    /// session id.
    pub fn get_or_create_by_session(
        &self,
        session: &Session,
        index: &SessionAgentIndex,
        agents: &mut HashMap<String, Agent>,
    ) -> Agent {
        if let Some(link) = index.get(&session.id) {
            if let Some(agent) = agents.get(&link.agent_id) {
                return agent.clone();
            }
            if let Some(agent) = self.load(&link.agent_id) {
                agents.insert(agent.id.clone(), agent.clone());
                return agent;
            }
        }

        let mut id = agent_id_for_session(session);
        if let Some(existing) = agents.get(&id) {
            if existing.session_id.as_deref() == Some(session.id.as_str()) {
                index.insert(
                    &session.id,
                    SessionLink {
                        agent_id: id.clone(),
                        directory: session.directory.clone(),
                        slug: session.slug.clone(),
                    },
                );
                return existing.clone();
            }
            let stripped = session.id.strip_prefix("ses_").unwrap_or(&session.id);
            let fragment: String = stripped.chars().take(6).collect();
            id = format!("{id}-{fragment}");
        }

        let agent = self.persist_auto_created(Agent {
            id,
            session_id: Some(session.id.clone()),
            project_path: session.directory.clone(),
            role: format!("Auto-registered agent for {}", session.directory),
            capabilities: Vec::new(),
            collaborates_with: Vec::new(),
            last_seen: now_ms(),
            status: "active".to_string(),
            auto_created: true,
        });
        agents.insert(agent.id.clone(), agent.clone());
        index.insert(
            &session.id,
            SessionLink {
                agent_id: agent.id.clone(),
                directory: session.directory.clone(),
                slug: session.slug.clone(),
            },
        );
        self.metrics.set_gauge(metrics::ACTIVE_AGENTS, agents.len() as f64);
        agent
    }

    /// Directory-keyed identity lookup for records written before session
    /// binding existed. Derives an id from the directory name, prefixing
    /// the parent directory on collision.
    pub fn get_or_create_by_directory(
        &self,
        directory: &str,
        agents: &mut HashMap<String, Agent>,
    ) -> Agent {
        if let Some(agent) = find_by_directory(directory, agents) {
            return agent.clone();
        }

        let path = std::path::Path::new(directory);
        let dir_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("root");
        let mut id = slugify(dir_name);
        if agents.contains_key(&id) {
            let parent = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("");
            id = slugify(&format!("{parent}-{id}"));
        }

        let agent = self.persist_auto_created(Agent {
            id,
            session_id: None,
            project_path: directory.to_string(),
            role: format!("Auto-registered agent for {directory}"),
            capabilities: Vec::new(),
            collaborates_with: Vec::new(),
            last_seen: now_ms(),
            status: "active".to_string(),
            auto_created: true,
        });
        agents.insert(agent.id.clone(), agent.clone());
        self.metrics.set_gauge(metrics::ACTIVE_AGENTS, agents.len() as f64);
        agent
    }

    fn persist_auto_created(&self, agent: Agent) -> Agent {
        match self.save(&agent) {
            Ok(()) => {
                self.metrics.inc(metrics::AGENTS_AUTO_CREATED);
                log::info!(
                    "Auto-registered agent '{}' for {}",
                    agent.id,
                    agent.project_path
                );
            }
            Err(e) => log::error!("Failed to save auto-created agent: {e}"),
        }
        agent
    }
}

/// Agent in the map whose project path matches `directory`.
pub fn find_by_directory<'a>(
    directory: &str,
    agents: &'a HashMap<String, Agent>,
) -> Option<&'a Agent> {
    agents.values().find(|a| a.project_path == directory)
}

fn slugify(name: &str) -> String {
    name.to_lowercase().replace([' ', '_'], "-")
}

// ============================================================================
// SESSION → AGENT INDEX
// ============================================================================

/// Persisted map from session id to the agent identity bound to it.
pub struct SessionAgentIndex {
    file: PathBuf,
    links: Mutex<HashMap<String, SessionLink>>,
}

impl SessionAgentIndex {
    /// Load the index from its file; missing or malformed files start empty.
    pub fn load(file: PathBuf) -> Self {
        let links = fs::read_to_string(&file)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            file,
            links: Mutex::new(links),
        }
    }

    /// Persist the index.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&*self.links.lock())?;
        fs::write(&self.file, text)?;
        Ok(())
    }

    /// Link entry for a session id.
    pub fn get(&self, session_id: &str) -> Option<SessionLink> {
        self.links.lock().get(session_id).cloned()
    }

    /// Bind a session to an agent identity and persist.
    pub fn insert(&self, session_id: &str, link: SessionLink) {
        self.links.lock().insert(session_id.to_string(), link);
        if let Err(e) = self.save() {
            log::warn!("Failed to save session agent index: {e}");
        }
    }

    /// Session id currently bound to `agent_id`, if any.
    pub fn session_for_agent(&self, agent_id: &str) -> Option<String> {
        self.links
            .lock()
            .iter()
            .find(|(_, link)| link.agent_id == agent_id)
            .map(|(session_id, _)| session_id.clone())
    }

    /// Drop entries whose session no longer exists. `live` must be the
    /// actual current session list; callers skip the call entirely when the
    /// fetch failed, so a backend outage never empties the index.
    pub fn prune(&self, live: &[Session]) -> usize {
        let mut links = self.links.lock();
        if links.is_empty() {
            return 0;
        }
        let before = links.len();
        links.retain(|session_id, _| live.iter().any(|s| &s.id == session_id));
        let removed = before - links.len();
        drop(links);
        if removed > 0 {
            if let Err(e) = self.save() {
                log::warn!("Failed to save session agent index: {e}");
            }
        }
        removed
    }

    /// Drop every entry bound to `agent_id`. Used when the agent record is
    /// garbage-collected.
    pub fn remove_agent(&self, agent_id: &str) {
        let mut links = self.links.lock();
        let before = links.len();
        links.retain(|_, link| link.agent_id != agent_id);
        let changed = links.len() != before;
        drop(links);
        if changed {
            if let Err(e) = self.save() {
                log::warn!("Failed to save session agent index: {e}");
            }
        }
    }

    /// Number of bound sessions.
    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    /// True when no sessions are bound.
    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }
}

/// Resolve the live session an agent is bound to: the agent's own
/// `sessionId` first, then the index, then a working-directory match for
/// records written before session binding existed.
pub fn find_session_for_agent<'a>(
    agent: &Agent,
    sessions: &'a [Session],
    index: &SessionAgentIndex,
) -> Option<&'a Session> {
    if let Some(session_id) = &agent.session_id
        && let Some(session) = sessions.iter().find(|s| &s.id == session_id)
    {
        return Some(session);
    }
    if let Some(session_id) = index.session_for_agent(&agent.id)
        && let Some(session) = sessions.iter().find(|s| s.id == session_id)
    {
        return Some(session);
    }
    // Directory match returns only the most recently updated session so a
    // pile of historical sessions in one directory isn't flooded.
    if agent.project_path.is_empty() {
        return None;
    }
    sessions
        .iter()
        .filter(|s| s.directory == agent.project_path)
        .max_by_key(|s| s.time.updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionTime;

    fn session(id: &str, slug: Option<&str>, directory: &str) -> Session {
        Session {
            id: id.to_string(),
            slug: slug.map(str::to_string),
            title: None,
            directory: directory.to_string(),
            time: SessionTime::default(),
        }
    }

    #[test]
    fn agent_id_prefers_slug() {
        let s = session("ses_abc123", Some("cosmic-panda"), "/p");
        assert_eq!(agent_id_for_session(&s), "cosmic-panda");
    }

    #[test]
    fn agent_id_derived_from_session_id() {
        let s = session("ses_abc123def456789", None, "/p");
        assert_eq!(agent_id_for_session(&s), "session-abc123def456");
    }

    #[test]
    fn empty_slug_falls_back_to_id() {
        let s = session("ses_xyz789", Some(""), "/p");
        assert_eq!(agent_id_for_session(&s), "session-xyz789");
    }

    #[test]
    fn index_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("session_agents.json");

        let index = SessionAgentIndex::load(file.clone());
        index.insert(
            "ses_test",
            SessionLink {
                agent_id: "test-agent".into(),
                directory: "/test".into(),
                slug: None,
            },
        );

        let reloaded = SessionAgentIndex::load(file);
        assert_eq!(reloaded.get("ses_test").unwrap().agent_id, "test-agent");
    }

    #[test]
    fn prune_drops_dead_sessions_only() {
        let dir = tempfile::tempdir().unwrap();
        let index = SessionAgentIndex::load(dir.path().join("session_agents.json"));
        for (sid, aid) in [("ses_active", "active-agent"), ("ses_stale", "stale-agent")] {
            index.insert(
                sid,
                SessionLink {
                    agent_id: aid.into(),
                    directory: "/".into(),
                    slug: None,
                },
            );
        }

        let live = vec![session("ses_active", None, "/active")];
        assert_eq!(index.prune(&live), 1);
        assert!(index.get("ses_active").is_some());
        assert!(index.get("ses_stale").is_none());
    }

    #[test]
    fn find_session_prefers_session_id_binding() {
        let dir = tempfile::tempdir().unwrap();
        let index = SessionAgentIndex::load(dir.path().join("session_agents.json"));
        let sessions = vec![
            session("ses_other", None, "/other"),
            session("ses_target", None, "/project"),
        ];
        let agent = Agent {
            id: "test-agent".into(),
            session_id: Some("ses_target".into()),
            project_path: "/project".into(),
            role: String::new(),
            capabilities: Vec::new(),
            collaborates_with: Vec::new(),
            last_seen: now_ms(),
            status: String::new(),
            auto_created: false,
        };
        let found = find_session_for_agent(&agent, &sessions, &index).unwrap();
        assert_eq!(found.id, "ses_target");
    }

    #[test]
    fn find_session_falls_back_to_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = SessionAgentIndex::load(dir.path().join("session_agents.json"));
        index.insert(
            "ses_match",
            SessionLink {
                agent_id: "legacy-agent".into(),
                directory: "/project".into(),
                slug: None,
            },
        );
        let sessions = vec![
            session("ses_match", None, "/project"),
            session("ses_other", None, "/other"),
        ];
        let agent = Agent {
            id: "legacy-agent".into(),
            session_id: None,
            project_path: "/project".into(),
            role: String::new(),
            capabilities: Vec::new(),
            collaborates_with: Vec::new(),
            last_seen: now_ms(),
            status: String::new(),
            auto_created: false,
        };
        let found = find_session_for_agent(&agent, &sessions, &index).unwrap();
        assert_eq!(found.id, "ses_match");
    }

    #[test]
    fn find_session_directory_match_picks_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let index = SessionAgentIndex::load(dir.path().join("session_agents.json"));
        let mut older = session("ses_old", None, "/project");
        older.time.updated = 1_000;
        let mut newer = session("ses_new", None, "/project");
        newer.time.updated = 2_000;
        let sessions = vec![older, newer];

        let agent = Agent {
            id: "legacy-agent".into(),
            session_id: None,
            project_path: "/project".into(),
            role: String::new(),
            capabilities: Vec::new(),
            collaborates_with: Vec::new(),
            last_seen: now_ms(),
            status: String::new(),
            auto_created: false,
        };
        let found = find_session_for_agent(&agent, &sessions, &index).unwrap();
        assert_eq!(found.id, "ses_new");

        // No directory either: nothing to match on.
        let homeless = Agent {
            project_path: String::new(),
            ..agent
        };
        assert!(find_session_for_agent(&homeless, &sessions, &index).is_none());
    }

    #[test]
    fn registry_auto_creates_with_session_binding() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(
            dir.path().join("agents"),
            Arc::new(Metrics::new()),
        );
        let index = SessionAgentIndex::load(dir.path().join("session_agents.json"));
        let mut agents = HashMap::new();
        let s = session("ses_new123", Some("brave-tiger"), "/home/user/newproject");

        let agent = registry.get_or_create_by_session(&s, &index, &mut agents);
        assert_eq!(agent.id, "brave-tiger");
        assert_eq!(agent.session_id.as_deref(), Some("ses_new123"));
        assert!(agent.auto_created);
        assert_eq!(index.get("ses_new123").unwrap().agent_id, "brave-tiger");

        let reloaded = registry.load("brave-tiger").unwrap();
        assert_eq!(reloaded.project_path, "/home/user/newproject");

        // Second observation of the same session reuses the identity.
        let again = registry.get_or_create_by_session(&s, &index, &mut agents);
        assert_eq!(again.id, "brave-tiger");
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn session_id_collision_is_disambiguated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(
            dir.path().join("agents"),
            Arc::new(Metrics::new()),
        );
        let index = SessionAgentIndex::load(dir.path().join("session_agents.json"));
        let mut agents = HashMap::new();

        let first = session("ses_one111", Some("shared-slug"), "/a");
        let second = session("ses_two222", Some("shared-slug"), "/b");

        let a = registry.get_or_create_by_session(&first, &index, &mut agents);
        let b = registry.get_or_create_by_session(&second, &index, &mut agents);
        assert_eq!(a.id, "shared-slug");
        assert_eq!(b.id, "shared-slug-two222");
        assert_eq!(agents.len(), 2);
    }

    #[test]
    fn directory_fallback_derives_id_from_dir_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::new(
            dir.path().join("agents"),
            Arc::new(Metrics::new()),
        );
        let mut agents = HashMap::new();

        let agent = registry.get_or_create_by_directory("/home/user/My Project", &mut agents);
        assert_eq!(agent.id, "my-project");
        assert!(agent.session_id.is_none());

        // Same directory yields the same agent.
        let again = registry.get_or_create_by_directory("/home/user/My Project", &mut agents);
        assert_eq!(again.id, "my-project");
        assert_eq!(agents.len(), 1);

        // Different directory with the same leaf name gets the parent prefix.
        let other = registry.get_or_create_by_directory("/srv/My Project", &mut agents);
        assert_eq!(other.id, "srv-my-project");
    }
}
