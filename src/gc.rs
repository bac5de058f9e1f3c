//! Periodic garbage collection
//!
//! One sweep prunes the oriented set and session index, removes stale
//! agents, archives expired messages, and expires threads whose
//! participants have all gone quiet. A failure on any single file is
//! skipped, never aborting the sweep.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::{is_agent_active, AgentRegistry, SessionAgentIndex};
use crate::backend::Backend;
use crate::metrics::{self, Metrics};
use crate::orientation::OrientationTracker;
use crate::sessions::SessionClient;
use crate::threads::ThreadStore;
use crate::types::{now_ms, Agent, Message, ThreadStatus};

/// Owns the sweep over all durable daemon state.
pub struct GarbageCollector<B: Backend> {
    sessions: Arc<SessionClient<B>>,
    orientation: Arc<OrientationTracker>,
    index: Arc<SessionAgentIndex>,
    registry: Arc<AgentRegistry>,
    threads: Arc<ThreadStore>,
    messages_dir: PathBuf,
    archive_dir: PathBuf,
    message_ttl: Duration,
    agent_stale_after: Duration,
    metrics: Arc<Metrics>,
}

impl<B: Backend> GarbageCollector<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionClient<B>>,
        orientation: Arc<OrientationTracker>,
        index: Arc<SessionAgentIndex>,
        registry: Arc<AgentRegistry>,
        threads: Arc<ThreadStore>,
        messages_dir: PathBuf,
        archive_dir: PathBuf,
        message_ttl: Duration,
        agent_stale_after: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sessions,
            orientation,
            index,
            registry,
            threads,
            messages_dir,
            archive_dir,
            message_ttl,
            agent_stale_after,
            metrics,
        }
    }

    /// Run one sweep. Mutates `agents` in place so callers keep a
    /// consistent view without reloading from disk.
    pub async fn run(&self, agents: &mut HashMap<String, Agent>) {
        let now = now_ms();
        let _ = fs::create_dir_all(&self.archive_dir);

        // 1 + 2. Prune oriented set and session index against the live
        // list. An empty fetch reads as an API outage, so both prunes are
        // skipped rather than wiping state.
        let live = self.sessions.list().await;
        let mut sessions_cleaned = 0;
        if live.is_empty() {
            log::debug!("GC: session fetch empty, skipping session-keyed pruning");
        } else {
            sessions_cleaned = self.orientation.prune(&live, self.message_ttl);
            let index_pruned = self.index.prune(&live);
            if index_pruned > 0 {
                log::info!("GC: Removed {index_pruned} stale session agent bindings");
            }
        }

        // 3. Stale agents, from disk so externally written records are seen.
        let mut agents_cleaned = 0u64;
        for agent in self.registry.load_all().values() {
            if is_agent_active(agent, self.agent_stale_after) {
                continue;
            }
            let age_min = now.saturating_sub(agent.last_seen) / 60_000;
            self.registry.remove(&agent.id);
            self.index.remove_agent(&agent.id);
            agents.remove(&agent.id);
            agents_cleaned += 1;
            log::info!("Removed stale agent {} (age: {age_min}m)", agent.id);
        }

        // 4. Expired messages.
        let mut messages_archived = 0u64;
        if let Ok(entries) = fs::read_dir(&self.messages_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") || !path.is_file() {
                    continue;
                }
                let Some(msg) = fs::read_to_string(&path)
                    .ok()
                    .and_then(|t| serde_json::from_str::<Message>(&t).ok())
                else {
                    continue;
                };
                let age_ms = now.saturating_sub(msg.timestamp);
                if (age_ms as i128) > self.message_ttl.as_millis() as i128 {
                    let dest = self.archive_dir.join(entry.file_name());
                    if fs::rename(&path, &dest).is_ok() {
                        messages_archived += 1;
                        log::debug!(
                            "Archived expired message {} (age: {}s)",
                            entry.file_name().to_string_lossy(),
                            age_ms / 1000
                        );
                    }
                }
            }
        }

        // 5. Threads where every participant went stale.
        for thread in self.threads.load_all() {
            if thread.status == ThreadStatus::Resolved || thread.participants.is_empty() {
                continue;
            }
            let any_active = thread.participants.iter().any(|id| {
                agents
                    .get(id)
                    .is_some_and(|a| is_agent_active(a, self.agent_stale_after))
            });
            if !any_active {
                if let Err(e) = self.threads.expire(&thread.id) {
                    log::warn!("Failed to expire thread {}: {e}", thread.id);
                }
            }
        }

        // 6. Counters.
        self.metrics.inc(metrics::GC_RUNS);
        self.metrics
            .add(metrics::GC_SESSIONS_CLEANED, sessions_cleaned as u64);
        self.metrics.add(metrics::GC_AGENTS_CLEANED, agents_cleaned);
        self.metrics
            .add(metrics::GC_MESSAGES_ARCHIVED, messages_archived);
        self.metrics
            .set_gauge(metrics::ACTIVE_AGENTS, agents.len() as f64);

        if agents_cleaned > 0 || messages_archived > 0 || sessions_cleaned > 0 {
            log::info!(
                "GC: cleaned {agents_cleaned} agents, archived {messages_archived} messages, \
                 pruned {sessions_cleaned} oriented sessions"
            );
        }
    }
}
