//! Message routing pipeline
//!
//! One call per mailbox file: parse, rate-limit, thread bookkeeping,
//! resolution check, target resolution, session lookup, injection. Each
//! step short-circuits; the caller never sees an error, only metrics.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agents::{find_session_for_agent, SessionAgentIndex};
use crate::backend::Backend;
use crate::inject::Injector;
use crate::metrics::{self, Metrics};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::sessions::SessionClient;
use crate::threads::ThreadStore;
use crate::types::{now_secs, Agent, Message, MessageType, Priority};

/// Routes one mailbox message to its target sessions.
pub struct Router<B: Backend> {
    threads: Arc<ThreadStore>,
    sessions: Arc<SessionClient<B>>,
    rate_limiter: Arc<RateLimiter>,
    index: Arc<SessionAgentIndex>,
    injector: Injector,
    archive_dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl<B: Backend> Router<B> {
    /// Assemble a router from its shared subsystems.
    pub fn new(
        threads: Arc<ThreadStore>,
        sessions: Arc<SessionClient<B>>,
        rate_limiter: Arc<RateLimiter>,
        index: Arc<SessionAgentIndex>,
        injector: Injector,
        archive_dir: PathBuf,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            threads,
            sessions,
            rate_limiter,
            index,
            injector,
            archive_dir,
            metrics,
        }
    }

    /// Process one message file end to end.
    ///
    /// Terminal outcomes: unparseable (failure counted, file left alone),
    /// rate-limited (stamped and archived), thread-resolving (success,
    /// messages archived by the store), unknown target (failure), already
    /// read (silent), no live sessions (silent, the file stays unread in
    /// the mailbox), delivered (marked read in place), or no reachable
    /// target (failure).
    pub async fn process(&self, path: &Path, agents: &HashMap<String, Agent>) {
        let mut msg = match fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|t| serde_json::from_str::<Message>(&t).map_err(|e| e.to_string()))
        {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to read message {}: {e}", path.display());
                self.metrics.inc(metrics::MESSAGES_FAILED);
                return;
            }
        };

        let sender = if msg.from.is_empty() {
            "unknown".to_string()
        } else {
            msg.from.clone()
        };

        if let RateDecision::Rejected(reason) = self.rate_limiter.check(&sender) {
            log::warn!("Rate limited message from {sender}: {reason}");
            self.metrics.inc(metrics::MESSAGES_FAILED);
            self.archive_rate_limited(&mut msg, path, reason);
            return;
        }
        self.rate_limiter.record(&sender);

        if let Err(e) = self.threads.ensure_thread_id(&mut msg, path) {
            log::warn!("Failed to assign thread for {}: {e}", path.display());
        }

        if self.threads.check_resolution(&msg) {
            self.metrics.inc(metrics::MESSAGES_TOTAL);
            return;
        }

        let targets: Vec<&Agent> = if msg.is_broadcast() {
            agents.values().collect()
        } else if let Some(agent) = agents.get(&msg.to) {
            vec![agent]
        } else {
            log::info!("Unknown target agent: {}", msg.to);
            self.metrics.inc(metrics::MESSAGES_FAILED);
            return;
        };

        if msg.read {
            return;
        }

        let sessions = self.sessions.list().await;
        if sessions.is_empty() {
            log::info!("No active sessions for message delivery");
            return;
        }

        let mut delivered = false;
        for agent in targets {
            if agent.id == msg.from {
                continue;
            }
            match find_session_for_agent(agent, &sessions, &self.index) {
                Some(session) => {
                    let notification = format_notification(&msg, &agent.id);
                    log::info!(
                        "Injecting message into session {} for agent {}",
                        session.id,
                        agent.id
                    );
                    self.injector.enqueue(session.id.clone(), notification);
                    delivered = true;
                }
                None => log::info!("No session found for agent {}", agent.id),
            }
        }

        if delivered {
            msg.read = true;
            msg.delivered_at = Some(now_secs());
            match serde_json::to_string_pretty(&msg) {
                Ok(text) => {
                    if let Err(e) = fs::write(path, text) {
                        log::warn!("Failed to mark message as read: {e}");
                    }
                }
                Err(e) => log::warn!("Failed to serialize message: {e}"),
            }
            self.metrics.inc(metrics::MESSAGES_TOTAL);
        } else {
            self.metrics.inc(metrics::MESSAGES_FAILED);
        }
    }

    /// Stamp the rejection onto the message and move it to the archive so
    /// the sender's tooling can surface the reason.
    fn archive_rate_limited(&self, msg: &mut Message, path: &Path, reason: String) {
        msg.rate_limited = true;
        msg.rate_limit_reason = Some(reason);

        if let Err(e) = fs::create_dir_all(&self.archive_dir) {
            log::warn!("Failed to create archive dir: {e}");
            return;
        }
        match serde_json::to_string_pretty(msg) {
            Ok(text) => {
                if let Err(e) = fs::write(path, text) {
                    log::warn!("Failed to stamp rate-limited message: {e}");
                }
            }
            Err(e) => log::warn!("Failed to serialize rate-limited message: {e}"),
        }
        if let Some(name) = path.file_name() {
            if let Err(e) = fs::rename(path, self.archive_dir.join(name)) {
                log::warn!("Failed to archive rate-limited message: {e}");
            }
        }
    }
}

/// Render the notification injected into a recipient's session.
///
/// Urgent tasks lead with an imperative plain-text line; box-formatted text
/// alone tends to be read as background context by an idle model, so the
/// bare line goes first to force action. Everything else gets the standard
/// block. Both variants surface sender, type, urgency, thread id, content,
/// and the reply recipe addressed back to the sender.
pub fn format_notification(msg: &Message, to_agent_id: &str) -> String {
    let from = if msg.from.is_empty() { "unknown" } else { &msg.from };
    let thread_id = msg.thread_id.as_deref().unwrap_or("");

    if msg.message_type == MessageType::Task && msg.priority == Priority::Urgent {
        let mut lines = vec![
            format!("URGENT FROM {from}: {}", msg.content),
            String::new(),
            "^^^ ACT ON THIS IMMEDIATELY. Do not wait for user input. ^^^".to_string(),
            String::new(),
            "┌─────────────────────────────────────────────────".to_string(),
            "│ RESPOND using agent-hub_send_message:".to_string(),
            format!("│   from: \"{to_agent_id}\""),
            format!("│   to: \"{from}\""),
        ];
        if !thread_id.is_empty() {
            lines.push(format!("│   threadId: \"{thread_id}\""));
        }
        lines.extend(
            [
                "│   type: \"completion\" | \"context\" | \"question\" | \"error\"",
                "│   content: <your response>",
                "│",
                "│ To resolve thread, include \"RESOLVED:\" in content.",
                "└─────────────────────────────────────────────────",
            ]
            .into_iter()
            .map(str::to_string),
        );
        return lines.join("\n");
    }

    let icon = match msg.message_type {
        MessageType::Question => "❓",
        MessageType::Task => "📋",
        MessageType::Context => "📝",
        MessageType::Completion => "✅",
        MessageType::Error => "❌",
        MessageType::Message => "💬",
    };
    let priority_str = match msg.priority {
        Priority::Urgent => " 🚨 URGENT",
        Priority::High => " ⚠️ HIGH",
        Priority::Low => " 💤 LOW",
        Priority::Normal => "",
    };
    let type_str = match msg.message_type {
        MessageType::Message => "message",
        MessageType::Task => "task",
        MessageType::Context => "context",
        MessageType::Completion => "completion",
        MessageType::Question => "question",
        MessageType::Error => "error",
    };

    let mut lines = vec![
        "┌─────────────────────────────────────────────────".to_string(),
        format!("│ {icon} AGENT HUB MESSAGE"),
        "├─────────────────────────────────────────────────".to_string(),
        format!("│ FROM: {from}"),
        format!("│ TYPE: {type_str}{priority_str}"),
    ];
    if !thread_id.is_empty() {
        lines.push(format!("│ THREAD: {thread_id}"));
    }
    lines.push("├─────────────────────────────────────────────────".to_string());
    lines.push(format!("│ {}", msg.content));
    lines.push("├─────────────────────────────────────────────────".to_string());
    lines.push("│ RESPOND using agent-hub_send_message:".to_string());
    lines.push(format!("│   from: \"{to_agent_id}\""));
    lines.push(format!("│   to: \"{from}\""));
    if !thread_id.is_empty() {
        lines.push(format!("│   threadId: \"{thread_id}\""));
    }
    lines.extend(
        [
            "│   type: \"completion\" | \"context\" | \"question\" | \"error\"",
            "│   content: <your response>",
            "│",
            "│ To resolve thread, include \"RESOLVED:\" in content.",
            "└─────────────────────────────────────────────────",
        ]
        .into_iter()
        .map(str::to_string),
    );

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_type: MessageType, priority: Priority) -> Message {
        Message {
            from: "alice".into(),
            to: "bob".into(),
            message_type: msg_type,
            content: "do X".into(),
            priority,
            thread_id: Some("t123".into()),
            timestamp: 0,
            read: false,
            delivered_at: None,
            rate_limited: false,
            rate_limit_reason: None,
        }
    }

    #[test]
    fn urgent_task_leads_with_imperative_line() {
        let msg = message(MessageType::Task, Priority::Urgent);
        let text = format_notification(&msg, "bob");
        assert!(text.starts_with("URGENT FROM alice: do X"));
        assert!(text.contains("ACT ON THIS IMMEDIATELY"));
        assert!(text.contains("threadId: \"t123\""));
        assert!(text.contains("from: \"bob\""));
        assert!(text.contains("to: \"alice\""));
    }

    #[test]
    fn standard_block_surfaces_all_fields() {
        let msg = message(MessageType::Question, Priority::High);
        let text = format_notification(&msg, "bob");
        assert!(text.contains("FROM: alice"));
        assert!(text.contains("TYPE: question"));
        assert!(text.contains("HIGH"));
        assert!(text.contains("THREAD: t123"));
        assert!(text.contains("do X"));
        assert!(text.contains("RESOLVED:"));
    }

    #[test]
    fn missing_thread_id_is_omitted() {
        let mut msg = message(MessageType::Message, Priority::Normal);
        msg.thread_id = None;
        let text = format_notification(&msg, "bob");
        assert!(!text.contains("THREAD:"));
        assert!(!text.contains("threadId"));
    }

    #[test]
    fn urgent_priority_alone_uses_standard_block() {
        // Urgent wake-up text is for tasks only.
        let msg = message(MessageType::Question, Priority::Urgent);
        let text = format_notification(&msg, "bob");
        assert!(text.starts_with("┌"));
        assert!(text.contains("URGENT"));
    }
}
