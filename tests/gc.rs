//! Garbage collection sweeps over real state directories.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agent_hub_daemon::agents::{AgentRegistry, SessionAgentIndex};
use agent_hub_daemon::backend::Backend;
use agent_hub_daemon::error::Result;
use agent_hub_daemon::gc::GarbageCollector;
use agent_hub_daemon::inject;
use agent_hub_daemon::metrics::{self, Metrics};
use agent_hub_daemon::orientation::OrientationTracker;
use agent_hub_daemon::sessions::SessionClient;
use agent_hub_daemon::threads::ThreadStore;
use agent_hub_daemon::types::{
    now_ms, Agent, Message, MessageType, Priority, Session, SessionLink, SessionTime, ThreadStatus,
};
use agent_hub_daemon::HubConfig;

const HOUR_MS: i64 = 3_600_000;

struct StubBackend {
    sessions: Vec<Session>,
}

impl Backend for StubBackend {
    async fn fetch_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.clone())
    }

    async fn send_prompt(&self, _session_id: &str, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
struct Harness {
    dir: tempfile::TempDir,
    gc: GarbageCollector<StubBackend>,
    registry: Arc<AgentRegistry>,
    index: Arc<SessionAgentIndex>,
    orientation: Arc<OrientationTracker>,
    threads: Arc<ThreadStore>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(live_sessions: Vec<Session>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig {
            hub_dir: dir.path().to_path_buf(),
            coordinator_dir: dir.path().join("coordinator"),
            ..HubConfig::default()
        };
        config.ensure_dirs().unwrap();

        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();
        let backend = Arc::new(StubBackend {
            sessions: live_sessions,
        });
        let injector = inject::spawn_workers(
            Arc::clone(&backend),
            1,
            1,
            Arc::clone(&metrics),
            cancel.clone(),
        );
        let session_client = Arc::new(SessionClient::new(
            Arc::clone(&backend),
            Duration::from_secs(10),
            Arc::clone(&metrics),
        ));
        let registry = Arc::new(AgentRegistry::new(config.agents_dir(), Arc::clone(&metrics)));
        let index = Arc::new(SessionAgentIndex::load(config.session_agents_file()));
        let orientation = Arc::new(OrientationTracker::new(
            &config,
            injector,
            Arc::clone(&metrics),
        ));
        let threads = Arc::new(ThreadStore::new(
            config.threads_dir(),
            config.messages_dir(),
            config.archive_dir(),
        ));
        let gc = GarbageCollector::new(
            Arc::clone(&session_client),
            Arc::clone(&orientation),
            Arc::clone(&index),
            Arc::clone(&registry),
            Arc::clone(&threads),
            config.messages_dir(),
            config.archive_dir(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Arc::clone(&metrics),
        );

        Self {
            dir,
            gc,
            registry,
            index,
            orientation,
            threads,
            metrics,
            cancel,
        }
    }

    fn write_message(&self, name: &str, timestamp: i64) {
        let msg = Message {
            from: "alice".to_string(),
            to: "bob".to_string(),
            message_type: MessageType::Message,
            content: "hi".to_string(),
            priority: Priority::Normal,
            thread_id: None,
            timestamp,
            read: false,
            delivered_at: None,
            rate_limited: false,
            rate_limit_reason: None,
        };
        fs::write(
            self.dir.path().join("messages").join(name),
            serde_json::to_string_pretty(&msg).unwrap(),
        )
        .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn agent(id: &str, session_id: Option<&str>, last_seen: i64) -> Agent {
    Agent {
        id: id.to_string(),
        session_id: session_id.map(str::to_string),
        project_path: format!("/proj/{id}"),
        role: String::new(),
        capabilities: Vec::new(),
        collaborates_with: Vec::new(),
        last_seen,
        status: "active".to_string(),
        auto_created: false,
    }
}

fn session(id: &str, updated: i64) -> Session {
    Session {
        id: id.to_string(),
        slug: None,
        title: None,
        directory: format!("/proj/{id}"),
        time: SessionTime {
            created: updated,
            updated,
        },
    }
}

fn link(agent_id: &str) -> SessionLink {
    SessionLink {
        agent_id: agent_id.to_string(),
        directory: format!("/proj/{agent_id}"),
        slug: None,
    }
}

#[tokio::test]
async fn stale_agent_removal_cascades() {
    let now = now_ms();
    let harness = Harness::new(vec![session("ses_live", now)]);

    let alice = agent("alice", Some("ses_live"), now);
    let bob = agent("bob", Some("ses_dead"), now - 2 * HOUR_MS);
    harness.registry.save(&alice).unwrap();
    harness.registry.save(&bob).unwrap();
    harness.index.insert("ses_live", link("alice"));
    harness.index.insert("ses_dead", link("bob"));
    harness.orientation.mark_coordinator_oriented("ses_live");
    harness.orientation.mark_coordinator_oriented("ses_dead");

    // A thread whose only participant is the stale agent.
    let thread = harness
        .threads
        .create(&Message {
            from: "bob".to_string(),
            to: "all".to_string(),
            message_type: MessageType::Question,
            content: "anyone?".to_string(),
            priority: Priority::Normal,
            thread_id: None,
            timestamp: now - 2 * HOUR_MS,
            read: false,
            delivered_at: None,
            rate_limited: false,
            rate_limit_reason: None,
        })
        .unwrap();

    harness.write_message("old.json", now - 2 * HOUR_MS);
    harness.write_message("fresh.json", now);

    let mut agents = HashMap::new();
    agents.insert("alice".to_string(), alice);
    agents.insert("bob".to_string(), bob);

    harness.gc.run(&mut agents).await;

    // Agent record, in-memory entry, and index binding all went away.
    assert!(harness.registry.load("bob").is_none());
    assert!(harness.registry.load("alice").is_some());
    assert!(!agents.contains_key("bob"));
    assert!(agents.contains_key("alice"));
    assert!(harness.index.get("ses_dead").is_none());
    assert!(harness.index.get("ses_live").is_some());

    // Oriented set pruned to the live session.
    assert!(harness.orientation.is_oriented("ses_live"));
    assert!(!harness.orientation.is_oriented("ses_dead"));

    // The old message is archived, the fresh one stays.
    let messages = harness.dir.path().join("messages");
    assert!(!messages.join("old.json").exists());
    assert!(messages.join("archive/old.json").exists());
    assert!(messages.join("fresh.json").exists());

    // The abandoned thread expired.
    let expired = harness.threads.load(&thread.id).unwrap();
    assert_eq!(expired.status, ThreadStatus::Expired);

    assert_eq!(harness.metrics.get(metrics::GC_RUNS), 1.0);
    assert_eq!(harness.metrics.get(metrics::GC_AGENTS_CLEANED), 1.0);
    assert_eq!(harness.metrics.get(metrics::GC_MESSAGES_ARCHIVED), 1.0);
}

#[tokio::test]
async fn empty_session_fetch_skips_session_keyed_pruning() {
    let harness = Harness::new(Vec::new());

    harness.index.insert("ses_a", link("alice"));
    harness.index.insert("ses_b", link("bob"));
    harness.orientation.mark_coordinator_oriented("ses_a");
    harness.orientation.mark_coordinator_oriented("ses_b");

    let mut agents = HashMap::new();
    agents.insert("alice".to_string(), agent("alice", Some("ses_a"), now_ms()));
    agents.insert("bob".to_string(), agent("bob", Some("ses_b"), now_ms()));

    harness.gc.run(&mut agents).await;

    // An API outage must not wipe session-keyed state.
    assert_eq!(harness.index.len(), 2);
    assert_eq!(harness.orientation.oriented_count(), 2);
    assert_eq!(harness.metrics.get(metrics::GC_SESSIONS_CLEANED), 0.0);
    // Active agents are untouched either way.
    assert_eq!(agents.len(), 2);
}

#[tokio::test]
async fn thread_with_an_active_participant_survives() {
    let now = now_ms();
    let harness = Harness::new(vec![session("ses_live", now)]);

    let thread = harness
        .threads
        .create(&Message {
            from: "alice".to_string(),
            to: "bob".to_string(),
            message_type: MessageType::Task,
            content: "work".to_string(),
            priority: Priority::Normal,
            thread_id: None,
            timestamp: now,
            read: false,
            delivered_at: None,
            rate_limited: false,
            rate_limit_reason: None,
        })
        .unwrap();

    let mut agents = HashMap::new();
    agents.insert("alice".to_string(), agent("alice", None, now));
    agents.insert("bob".to_string(), agent("bob", None, now - 2 * HOUR_MS));

    // Keep bob out of the registry so only thread expiry is in play.
    harness.registry.save(&agents["alice"]).unwrap();

    harness.gc.run(&mut agents).await;

    assert_eq!(
        harness.threads.load(&thread.id).unwrap().status,
        ThreadStatus::Open
    );
}

#[tokio::test]
async fn resolved_threads_are_left_alone() {
    let now = now_ms();
    let harness = Harness::new(vec![session("ses_live", now)]);

    let msg = Message {
        from: "ghost".to_string(),
        to: "all".to_string(),
        message_type: MessageType::Task,
        content: "done long ago".to_string(),
        priority: Priority::Normal,
        thread_id: None,
        timestamp: now - 2 * HOUR_MS,
        read: false,
        delivered_at: None,
        rate_limited: false,
        rate_limit_reason: None,
    };
    let thread = harness.threads.create(&msg).unwrap();
    harness.threads.resolve(&thread.id, "ghost").unwrap();

    harness.gc.run(&mut HashMap::new()).await;

    // Resolved stays resolved; it is never re-marked expired.
    assert_eq!(
        harness.threads.load(&thread.id).unwrap().status,
        ThreadStatus::Resolved
    );
}
