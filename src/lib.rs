//! # Agent Hub Daemon
//!
//! A filesystem-mailbox coordination daemon for concurrent coding-agent
//! sessions. External tools drop one JSON file per message into a mailbox
//! directory; the daemon routes each message to the recipient agent's live
//! session by injecting a formatted prompt through the backend HTTP API.
//!
//! Around that core path the daemon maintains conversation threads (with
//! completion-driven resolution), auto-creates agent identities for newly
//! discovered sessions and greets them once per run, rate-limits chatty
//! senders, garbage-collects expired state, and exports Prometheus text
//! metrics for an external dashboard.
//!
//! ## Architecture
//!
//! Everything hangs off a small set of subsystems wired together in
//! [`daemon::run`]:
//!
//! - [`watch`] scans the mailbox and queues new message files exactly once.
//! - [`router`] runs the per-message pipeline: rate limit, thread
//!   bookkeeping, resolution check, target and session lookup, injection.
//! - [`orientation`] drives the per-session greeting state machine with
//!   acknowledgment-aware retries.
//! - [`inject`] is the worker pool that actually talks to session prompt
//!   endpoints, with bounded retries.
//! - [`gc`] sweeps agents, messages, threads, and session-keyed state.
//! - [`backend`] is the seam to the hub HTTP API; everything network-facing
//!   goes through the [`backend::Backend`] trait so tests run against stubs.

pub mod agents;
pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gc;
pub mod hub;
pub mod inject;
pub mod metrics;
pub mod orientation;
pub mod rate_limit;
pub mod router;
pub mod sessions;
pub mod threads;
pub mod types;
pub mod watch;

pub use agents::{agent_id_for_session, AgentRegistry, SessionAgentIndex};
pub use backend::{Backend, HttpBackend};
pub use config::HubConfig;
pub use error::{HubError, Result};
pub use inject::Injector;
pub use metrics::Metrics;
pub use orientation::OrientationTracker;
pub use rate_limit::{RateDecision, RateLimiter};
pub use router::Router;
pub use sessions::SessionClient;
pub use threads::ThreadStore;
pub use types::{Agent, Message, MessageType, Priority, Session, SessionLink, Thread, ThreadStatus};
