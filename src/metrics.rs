//! Thread-safe Prometheus-compatible metrics registry
//!
//! Counters and gauges carry the `agent_hub_` prefix and are exported in the
//! text exposition format to a file the external dashboard reads. The file is
//! written via a temp file and rename so a concurrent reader sees stale data,
//! never a torn write.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::now_secs;

/// Total messages processed successfully.
pub const MESSAGES_TOTAL: &str = "agent_hub_messages_total";
/// Total messages that failed processing.
pub const MESSAGES_FAILED: &str = "agent_hub_messages_failed_total";
/// Total prompt injections accepted by the backend.
pub const INJECTIONS_TOTAL: &str = "agent_hub_injections_total";
/// Total injections that failed after all retries.
pub const INJECTIONS_FAILED: &str = "agent_hub_injections_failed_total";
/// Total injection retry attempts.
pub const INJECTIONS_RETRIED: &str = "agent_hub_injections_retried_total";
/// Total sessions that received orientation.
pub const SESSIONS_ORIENTED: &str = "agent_hub_sessions_oriented_total";
/// Total orientation re-injections.
pub const ORIENTATION_RETRIES: &str = "agent_hub_orientation_retries_total";
/// Total sessions dropped from retry tracking unacknowledged.
pub const ORIENTATION_GAVE_UP: &str = "agent_hub_orientation_gave_up_total";
/// Total agents auto-created from sessions.
pub const AGENTS_AUTO_CREATED: &str = "agent_hub_agents_auto_created_total";
/// Total session cache hits.
pub const CACHE_HITS: &str = "agent_hub_cache_hits_total";
/// Total session cache misses.
pub const CACHE_MISSES: &str = "agent_hub_cache_misses_total";
/// Total garbage collection runs.
pub const GC_RUNS: &str = "agent_hub_gc_runs_total";
/// Total oriented sessions pruned by GC.
pub const GC_SESSIONS_CLEANED: &str = "agent_hub_gc_sessions_cleaned_total";
/// Total stale agents removed by GC.
pub const GC_AGENTS_CLEANED: &str = "agent_hub_gc_agents_cleaned_total";
/// Total messages archived by GC.
pub const GC_MESSAGES_ARCHIVED: &str = "agent_hub_gc_messages_archived_total";

/// Current number of registered agents.
pub const ACTIVE_AGENTS: &str = "agent_hub_active_agents";
/// Current number of oriented sessions.
pub const ORIENTED_SESSIONS: &str = "agent_hub_oriented_sessions";
/// Current injection queue depth.
pub const INJECTION_QUEUE_SIZE: &str = "agent_hub_injection_queue_size";
/// Current message queue depth.
pub const MESSAGE_QUEUE_SIZE: &str = "agent_hub_message_queue_size";

const START_TIME: &str = "agent_hub_start_time_seconds";

const COUNTERS: &[(&str, &str)] = &[
    (MESSAGES_TOTAL, "Total messages processed successfully"),
    (MESSAGES_FAILED, "Total messages that failed processing"),
    (INJECTIONS_TOTAL, "Total message injections sent to sessions"),
    (INJECTIONS_FAILED, "Total injection failures after retries"),
    (INJECTIONS_RETRIED, "Total injection retry attempts"),
    (SESSIONS_ORIENTED, "Total sessions that received orientation"),
    (ORIENTATION_RETRIES, "Total orientation retry injections"),
    (
        ORIENTATION_GAVE_UP,
        "Total sessions dropped from orientation retry without acknowledgment",
    ),
    (AGENTS_AUTO_CREATED, "Total agents auto-created from sessions"),
    (CACHE_HITS, "Total session cache hits"),
    (CACHE_MISSES, "Total session cache misses"),
    (GC_RUNS, "Total garbage collection runs"),
    (GC_SESSIONS_CLEANED, "Total stale sessions cleaned by GC"),
    (GC_AGENTS_CLEANED, "Total stale agents cleaned by GC"),
    (GC_MESSAGES_ARCHIVED, "Total messages archived by GC"),
];

const GAUGES: &[(&str, &str)] = &[
    (ACTIVE_AGENTS, "Current number of registered agents"),
    (ORIENTED_SESSIONS, "Current number of oriented sessions"),
    (INJECTION_QUEUE_SIZE, "Current injection queue depth"),
    (MESSAGE_QUEUE_SIZE, "Current message queue depth"),
];

#[derive(Default)]
struct Inner {
    counters: BTreeMap<&'static str, u64>,
    gauges: BTreeMap<&'static str, f64>,
}

/// Thread-safe counter/gauge registry.
pub struct Metrics {
    inner: Mutex<Inner>,
    started: Instant,
    start_time_secs: f64,
}

impl Metrics {
    /// Create a registry with every known metric at zero.
    pub fn new() -> Self {
        let mut inner = Inner::default();
        for (name, _) in COUNTERS {
            inner.counters.insert(name, 0);
        }
        for (name, _) in GAUGES {
            inner.gauges.insert(name, 0.0);
        }
        Self {
            inner: Mutex::new(inner),
            started: Instant::now(),
            start_time_secs: now_secs(),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Increment a counter by `value`.
    pub fn add(&self, name: &'static str, value: u64) {
        let mut inner = self.inner.lock();
        if let Some(counter) = inner.counters.get_mut(name) {
            *counter += value;
        }
    }

    /// Set a gauge.
    pub fn set_gauge(&self, name: &'static str, value: f64) {
        let mut inner = self.inner.lock();
        if let Some(gauge) = inner.gauges.get_mut(name) {
            *gauge = value;
        }
    }

    /// Current value of a counter or gauge, 0 when unknown.
    pub fn get(&self, name: &str) -> f64 {
        let inner = self.inner.lock();
        if let Some(v) = inner.counters.get(name) {
            return *v as f64;
        }
        inner.gauges.get(name).copied().unwrap_or(0.0)
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();

        out.push_str(&format!(
            "# HELP {START_TIME} Unix timestamp when daemon started\n\
             # TYPE {START_TIME} gauge\n\
             {START_TIME} {}\n",
            self.start_time_secs
        ));

        for (name, help) in COUNTERS {
            let value = inner.counters.get(name).copied().unwrap_or(0);
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }
        for (name, help) in GAUGES {
            let value = inner.gauges.get(name).copied().unwrap_or(0.0);
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
            ));
        }
        out
    }

    /// Write the exposition file atomically (temp file + rename).
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, self.to_prometheus())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// One-line human summary for the periodic log.
    pub fn log_summary(&self) -> String {
        let inner = self.inner.lock();
        let get = |name: &str| inner.counters.get(name).copied().unwrap_or(0);

        let uptime = self.started.elapsed().as_secs();
        let (hours, rem) = (uptime / 3600, uptime % 3600);
        let (minutes, seconds) = (rem / 60, rem % 60);
        let uptime_str = if hours > 0 {
            format!("{hours}h{minutes}m{seconds}s")
        } else if minutes > 0 {
            format!("{minutes}m{seconds}s")
        } else {
            format!("{seconds}s")
        };

        format!(
            "uptime={} msgs={}/{} inj={}/{} orient={} cache={}/{} gc={}",
            uptime_str,
            get(MESSAGES_TOTAL),
            get(MESSAGES_FAILED),
            get(INJECTIONS_TOTAL),
            get(INJECTIONS_FAILED),
            get(SESSIONS_ORIENTED),
            get(CACHE_HITS),
            get(CACHE_MISSES),
            get(GC_RUNS),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.inc(MESSAGES_TOTAL);
        metrics.add(MESSAGES_TOTAL, 2);
        assert_eq!(metrics.get(MESSAGES_TOTAL), 3.0);
    }

    #[test]
    fn unknown_names_ignored() {
        let metrics = Metrics::new();
        metrics.inc("agent_hub_nope_total");
        assert_eq!(metrics.get("agent_hub_nope_total"), 0.0);
    }

    #[test]
    fn exposition_has_help_and_type() {
        let metrics = Metrics::new();
        metrics.inc(GC_RUNS);
        metrics.set_gauge(ACTIVE_AGENTS, 3.0);
        let text = metrics.to_prometheus();
        assert!(text.contains("# HELP agent_hub_gc_runs_total"));
        assert!(text.contains("# TYPE agent_hub_gc_runs_total counter"));
        assert!(text.contains("agent_hub_gc_runs_total 1"));
        assert!(text.contains("# TYPE agent_hub_active_agents gauge"));
        assert!(text.contains("agent_hub_active_agents 3"));
        assert!(text.contains("agent_hub_start_time_seconds"));
    }

    #[test]
    fn file_write_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        let metrics = Metrics::new();
        metrics.write_file(&path).unwrap();
        metrics.inc(GC_RUNS);
        metrics.write_file(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("agent_hub_gc_runs_total 1"));
        assert!(!path.with_extension("prom.tmp").exists());
    }
}
