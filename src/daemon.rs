//! Daemon assembly and background loops
//!
//! `run` builds every subsystem, spawns the long-lived loops, and blocks
//! until a shutdown signal. Loops never propagate an iteration's failure;
//! they log, count, and keep ticking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRegistry, SessionAgentIndex};
use crate::backend::HttpBackend;
use crate::config::{HubConfig, COORDINATOR_TITLE};
use crate::error::Result;
use crate::gc::GarbageCollector;
use crate::hub::{self, HubServer};
use crate::inject;
use crate::metrics::{self, Metrics};
use crate::orientation::OrientationTracker;
use crate::rate_limit::RateLimiter;
use crate::router::Router;
use crate::sessions::SessionClient;
use crate::threads::ThreadStore;
use crate::types::{Agent, Session};
use crate::watch;

/// Orientation retry sweep cadence.
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Agents-directory reload cadence (external tools write agent files).
const AGENTS_RELOAD_INTERVAL: Duration = Duration::from_secs(30);
/// Hub server health check cadence.
const HUB_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
/// Per-task grace period on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type AgentMap = Arc<RwLock<HashMap<String, Agent>>>;

/// Run the daemon until a shutdown signal arrives.
///
/// # Errors
/// Returns error when the startup preflight fails (missing backend CLI,
/// invalid configuration), before any state directory is created. Runtime
/// failures never surface here; they are logged and counted.
pub async fn run(config: HubConfig) -> Result<()> {
    config.validate()?;
    hub::preflight()?;
    config.ensure_dirs()?;

    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();

    log::info!("Watching messages: {}", config.messages_dir().display());
    log::info!("Hub API: {}", config.hub_url);
    log::info!(
        "Message TTL: {}s, GC interval: {}s",
        config.message_ttl.as_secs(),
        config.gc_interval.as_secs()
    );

    let hub_server = Arc::new(HubServer::new(&config));
    if let Err(e) = hub_server.ensure_started().await {
        // Degraded start: workers retry against the API on their own.
        log::error!("Failed to start hub server: {e}");
    }

    let backend = Arc::new(HttpBackend::new(
        config.hub_url.clone(),
        config.injection_timeout,
    ));
    let injector = inject::spawn_workers(
        Arc::clone(&backend),
        config.injection_workers,
        config.injection_retries,
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let session_client = Arc::new(SessionClient::new(
        Arc::clone(&backend),
        config.session_cache_ttl,
        Arc::clone(&metrics),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(&config));
    let threads = Arc::new(ThreadStore::new(
        config.threads_dir(),
        config.messages_dir(),
        config.archive_dir(),
    ));
    let registry = Arc::new(AgentRegistry::new(
        config.agents_dir(),
        Arc::clone(&metrics),
    ));
    let index = Arc::new(SessionAgentIndex::load(config.session_agents_file()));
    let orientation = Arc::new(OrientationTracker::new(
        &config,
        injector.clone(),
        Arc::clone(&metrics),
    ));
    let router = Arc::new(Router::new(
        Arc::clone(&threads),
        Arc::clone(&session_client),
        Arc::clone(&rate_limiter),
        Arc::clone(&index),
        injector.clone(),
        config.archive_dir(),
        Arc::clone(&metrics),
    ));
    let gc = Arc::new(GarbageCollector::new(
        Arc::clone(&session_client),
        Arc::clone(&orientation),
        Arc::clone(&index),
        Arc::clone(&registry),
        Arc::clone(&threads),
        config.messages_dir(),
        config.archive_dir(),
        config.message_ttl,
        config.agent_stale_after,
        Arc::clone(&metrics),
    ));

    let agents: AgentMap = Arc::new(RwLock::new(registry.load_all()));
    {
        let loaded = agents.read();
        log::info!(
            "Loaded {} registered agents: {:?}",
            loaded.len(),
            loaded.keys().collect::<Vec<_>>()
        );
    }

    let mut tasks = Vec::new();

    // Message routing: drain the mailbox scanner queue.
    {
        let mut rx = watch::spawn_scanner(
            config.messages_dir(),
            config.mailbox_scan_interval,
            cancel.clone(),
        );
        let router = Arc::clone(&router);
        let agents = Arc::clone(&agents);
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let path = tokio::select! {
                    _ = cancel.cancelled() => break,
                    path = rx.recv() => match path {
                        Some(path) => path,
                        None => break,
                    },
                };
                metrics.set_gauge(metrics::MESSAGE_QUEUE_SIZE, rx.len() as f64);
                let snapshot = agents.read().clone();
                router.process(&path, &snapshot).await;
            }
        }));
    }

    // Session discovery: poll the live list, orient new sessions.
    {
        let session_client = Arc::clone(&session_client);
        let orientation = Arc::clone(&orientation);
        let registry = Arc::clone(&registry);
        let index = Arc::clone(&index);
        let agents = Arc::clone(&agents);
        let interval = config.session_poll_interval;
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let sessions = session_client.list().await;
                if !sessions.is_empty() {
                    discover_sessions(&sessions, &orientation, &registry, &index, &agents);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    // Orientation retry sweep.
    {
        let orientation = Arc::clone(&orientation);
        let agents = Arc::clone(&agents);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_SWEEP_INTERVAL) => {}
                }
                let snapshot = agents.read().clone();
                orientation.check_retries(&snapshot);
            }
        }));
    }

    // Garbage collection.
    {
        let gc = Arc::clone(&gc);
        let agents = Arc::clone(&agents);
        let interval = config.gc_interval;
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let mut map = agents.read().clone();
                gc.run(&mut map).await;
                *agents.write() = map;
            }
        }));
    }

    // Agents reload: external tools register agents by dropping files.
    {
        let registry = Arc::clone(&registry);
        let agents = Arc::clone(&agents);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(AGENTS_RELOAD_INTERVAL) => {}
                }
                *agents.write() = registry.load_all();
            }
        }));
    }

    // Metrics file writer and summary log.
    {
        let metrics_handle = Arc::clone(&metrics);
        let injector = injector.clone();
        let metrics_file = config.metrics_file();
        let interval = config.metrics_interval;
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                metrics_handle.set_gauge(
                    metrics::INJECTION_QUEUE_SIZE,
                    injector.queue_depth() as f64,
                );
                if let Err(e) = metrics_handle.write_file(&metrics_file) {
                    log::error!("Failed to write metrics file: {e}");
                }
                log::info!("Metrics: {}", metrics_handle.log_summary());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    // Hub server health monitor.
    {
        let hub_server = Arc::clone(&hub_server);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(HUB_MONITOR_INTERVAL) => {}
                }
                hub_server.check_restart().await;
            }
        }));
    }

    log::info!(
        "Started {} background tasks ({} injection workers)",
        tasks.len(),
        config.injection_workers
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received shutdown signal"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            log::warn!("Background task did not stop within grace period");
        }
    }
    hub_server.stop().await;
    log::info!("Daemon stopped");
    Ok(())
}

/// One discovery pass over a fetched session list: record the coordinator
/// session if present, then orient the most recent session per directory.
/// Only the newest session per directory is considered so a directory full
/// of historical sessions is not greeted wholesale.
fn discover_sessions(
    sessions: &[Session],
    orientation: &OrientationTracker,
    registry: &AgentRegistry,
    index: &SessionAgentIndex,
    agents: &AgentMap,
) {
    for session in sessions {
        if session.title.as_deref() == Some(COORDINATOR_TITLE) {
            orientation.set_coordinator_session(&session.id);
        }
    }

    let mut by_directory: HashMap<&str, &Session> = HashMap::new();
    for session in sessions {
        if session.id.is_empty() || session.directory.is_empty() {
            continue;
        }
        let entry = by_directory.entry(session.directory.as_str()).or_insert(session);
        if session.time.updated > entry.time.updated {
            *entry = session;
        }
    }

    let mut map = agents.read().clone();
    let mut changed = false;
    for session in by_directory.values() {
        if orientation.is_oriented(&session.id) {
            continue;
        }
        log::debug!(
            "Polling found new session {} for {}",
            &session.id.chars().take(8).collect::<String>(),
            session.directory
        );
        if orientation.observe_session(session, registry, index, &mut map) {
            changed = true;
        }
    }
    if changed {
        // Auto-created identities become visible to the other loops.
        let mut live = agents.write();
        for (id, agent) in map {
            live.entry(id).or_insert(agent);
        }
    }
}
