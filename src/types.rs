//! Record types shared across the daemon
//!
//! Messages, threads and agents live as one JSON file each on disk and are
//! also written by external tools, so every struct tolerates missing keys
//! (defaults) and ignores unknown ones.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Recipient marker for broadcast messages and threads.
pub const BROADCAST: &str = "all";

// ============================================================================
// MESSAGE
// ============================================================================

/// Kind of inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain chatter
    #[default]
    Message,
    /// Work request
    Task,
    /// Background information
    Context,
    /// Completion report; may resolve a thread
    Completion,
    /// Question expecting an answer
    Question,
    /// Error report
    Error,
}

/// Delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Deprioritized
    Low,
    /// Default
    #[default]
    Normal,
    /// Elevated
    High,
    /// Wakes idle agents with an imperative header
    Urgent,
}

/// One unit of inter-agent communication, stored as a single file in the
/// mailbox directory. The id is implicit in the filename.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sender agent id
    #[serde(default)]
    pub from: String,
    /// Recipient agent id, or [`BROADCAST`]
    #[serde(default)]
    pub to: String,
    /// Message kind
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    /// Free-text payload
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    /// Delivery priority
    pub priority: Priority,
    /// Conversation thread id; assigned lazily by the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Creation time, ms epoch
    #[serde(default)]
    pub timestamp: i64,
    /// Delivery marker; set once any injection was queued
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read: bool,
    /// Wall time of delivery, fractional seconds epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<f64>,
    /// Set when the sender was rejected by the rate limiter
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rate_limited: bool,
    /// Human-readable rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reason: Option<String>,
}

impl Message {
    /// True when addressed to every known agent.
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }
}

// ============================================================================
// THREAD
// ============================================================================

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    /// Accepting messages
    #[default]
    Open,
    /// Resolved by the creator (or a broadcast completion)
    Resolved,
    /// All participants went stale
    Expired,
}

/// Groups related messages. One JSON file per thread, keyed by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Short unique thread id
    pub id: String,
    /// Agent that sent the first message
    #[serde(default)]
    pub created_by: String,
    /// Creation time, ms epoch
    #[serde(default)]
    pub created_at: i64,
    /// Agent ids that took part; accumulates monotonically until resolution
    #[serde(default)]
    pub participants: Vec<String>,
    /// Lifecycle state
    #[serde(default)]
    pub status: ThreadStatus,
    /// Agent that resolved the thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Resolution or expiry time, ms epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

// ============================================================================
// AGENT
// ============================================================================

/// A registered identity representing one coding-agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Unique agent id (slug or derived from the session id)
    pub id: String,
    /// Owning live session, when session-scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Working directory of the session
    #[serde(default)]
    pub project_path: String,
    /// Free-text role description
    #[serde(default)]
    pub role: String,
    /// Declared capabilities
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Agents this one collaborates with
    #[serde(default)]
    pub collaborates_with: Vec<String>,
    /// Last activity, ms epoch; updated externally
    #[serde(default)]
    pub last_seen: i64,
    /// Free-text status
    #[serde(default)]
    pub status: String,
    /// True when created by the orientation pipeline rather than explicitly
    #[serde(default)]
    pub auto_created: bool,
}

// ============================================================================
// SESSION
// ============================================================================

/// Creation/update timestamps on a live session, ms epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTime {
    /// Session creation time
    #[serde(default)]
    pub created: i64,
    /// Last update time
    #[serde(default)]
    pub updated: i64,
}

/// A live backend-hosted coding-agent conversation as reported by the hub
/// API's session list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session id
    #[serde(default)]
    pub id: String,
    /// Human-readable slug, when assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    /// Session title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Working directory
    #[serde(default)]
    pub directory: String,
    /// Timestamps
    #[serde(default)]
    pub time: SessionTime,
}

/// One entry of the persisted session→agent index. Lets multiple concurrent
/// sessions sharing a working directory keep distinct agent identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLink {
    /// Agent id owning the session
    pub agent_id: String,
    /// Session working directory
    #[serde(default)]
    pub directory: String,
    /// Session slug at link time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tolerates_missing_fields() {
        let msg: Message = serde_json::from_str(r#"{"from":"alice","to":"bob"}"#).unwrap();
        assert_eq!(msg.message_type, MessageType::Message);
        assert_eq!(msg.priority, Priority::Normal);
        assert!(!msg.read);
        assert!(msg.thread_id.is_none());
    }

    #[test]
    fn message_ignores_unknown_keys() {
        let msg: Message =
            serde_json::from_str(r#"{"from":"a","to":"b","futureField":42}"#).unwrap();
        assert_eq!(msg.from, "a");
    }

    #[test]
    fn message_roundtrips_wire_names() {
        let mut msg: Message = serde_json::from_str(
            r#"{"from":"a","to":"all","type":"completion","priority":"urgent"}"#,
        )
        .unwrap();
        msg.thread_id = Some("t1".into());
        msg.read = true;
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "completion");
        assert_eq!(value["threadId"], "t1");
        assert_eq!(value["read"], true);
        // false flags are omitted, not written
        assert!(value.get("rateLimited").is_none());
    }

    #[test]
    fn thread_status_defaults_open() {
        let thread: Thread = serde_json::from_str(r#"{"id":"t1"}"#).unwrap();
        assert_eq!(thread.status, ThreadStatus::Open);
    }
}
