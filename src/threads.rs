//! Thread store
//!
//! One JSON file per thread under the threads directory. Thread files are
//! read-modify-written; a store-level mutex serializes those cycles so two
//! workers can't lose a participant update or a resolution.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{now_ms, Message, MessageType, Thread, ThreadStatus, BROADCAST};

/// Length of synthesized thread ids.
const THREAD_ID_LEN: usize = 12;

/// CRUD over conversation threads plus thread-driven message archival.
pub struct ThreadStore {
    threads_dir: PathBuf,
    messages_dir: PathBuf,
    archive_dir: PathBuf,
    // Guards every load → mutate → save cycle.
    write_lock: Mutex<()>,
}

impl ThreadStore {
    /// Create a store over the given directories.
    pub fn new(threads_dir: PathBuf, messages_dir: PathBuf, archive_dir: PathBuf) -> Self {
        Self {
            threads_dir,
            messages_dir,
            archive_dir,
            write_lock: Mutex::new(()),
        }
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.threads_dir.join(format!("{thread_id}.json"))
    }

    /// Load a thread by id, `None` when missing or unreadable.
    pub fn load(&self, thread_id: &str) -> Option<Thread> {
        let path = self.thread_path(thread_id);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(thread) => Some(thread),
            Err(e) => {
                log::warn!("Failed to load thread {thread_id}: {e}");
                None
            }
        }
    }

    /// Persist a thread to its file.
    pub fn save(&self, thread: &Thread) -> Result<()> {
        fs::create_dir_all(&self.threads_dir)?;
        let text = serde_json::to_string_pretty(thread)?;
        fs::write(self.thread_path(&thread.id), text)?;
        Ok(())
    }

    /// Create and persist a new thread seeded from `msg`. Participants are
    /// the sender plus the recipient unless it is the broadcast marker.
    pub fn create(&self, msg: &Message) -> Result<Thread> {
        let id = msg
            .thread_id
            .clone()
            .unwrap_or_else(|| new_thread_id());
        let thread = Thread {
            id,
            created_by: msg.from.clone(),
            created_at: now_ms(),
            participants: participants_of(msg),
            status: ThreadStatus::Open,
            resolved_by: None,
            resolved_at: None,
        };
        self.save(&thread)?;
        Ok(thread)
    }

    /// Merge the message's sender/recipient into the thread's participant
    /// set and persist.
    pub fn add_participants(&self, thread: &mut Thread, msg: &Message) -> Result<()> {
        for id in participants_of(msg) {
            if !thread.participants.contains(&id) {
                thread.participants.push(id);
            }
        }
        self.save(thread)
    }

    /// Ensure `msg` belongs to a thread, creating one when needed.
    ///
    /// When the message already carries a thread id, the thread is loaded
    /// (or recreated if its file is missing) and participants merged. When
    /// it doesn't, a fresh id is synthesized and the message file at
    /// `msg_path` is rewritten to carry it. Idempotent: a second call on an
    /// already-tagged message returns the same id and creates no new thread.
    pub fn ensure_thread_id(&self, msg: &mut Message, msg_path: &Path) -> Result<String> {
        let _guard = self.write_lock.lock();

        if let Some(thread_id) = msg.thread_id.clone() {
            match self.load(&thread_id) {
                Some(mut thread) => self.add_participants(&mut thread, msg)?,
                // Referenced thread doesn't exist yet; create it implicitly.
                None => {
                    self.create(msg)?;
                }
            }
            return Ok(thread_id);
        }

        let thread = self.create(msg)?;
        msg.thread_id = Some(thread.id.clone());
        fs::write(msg_path, serde_json::to_string_pretty(msg)?)?;
        log::debug!(
            "Auto-assigned threadId {} to message {}",
            thread.id,
            msg_path.display()
        );
        Ok(thread.id)
    }

    /// Mark a thread resolved, stamp resolver and time, and archive every
    /// message file tagged with it.
    pub fn resolve(&self, thread_id: &str, resolved_by: &str) -> Result<()> {
        let archived = {
            let _guard = self.write_lock.lock();
            let Some(mut thread) = self.load(thread_id) else {
                return Ok(());
            };
            thread.status = ThreadStatus::Resolved;
            thread.resolved_by = Some(resolved_by.to_string());
            thread.resolved_at = Some(now_ms());
            self.save(&thread)?;
            self.archive_thread_messages(thread_id)
        };
        log::info!("Thread {thread_id} resolved by {resolved_by} ({archived} messages archived)");
        Ok(())
    }

    /// Move every live message file tagged with `thread_id` into the
    /// archive area. Unreadable files are skipped. Returns the move count.
    pub fn archive_thread_messages(&self, thread_id: &str) -> usize {
        if fs::create_dir_all(&self.archive_dir).is_err() {
            return 0;
        }
        let Ok(entries) = fs::read_dir(&self.messages_dir) else {
            return 0;
        };

        let mut moved = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") || !path.is_file() {
                continue;
            }
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(msg) = serde_json::from_str::<Message>(&text) else {
                continue;
            };
            if msg.thread_id.as_deref() == Some(thread_id) {
                let dest = self.archive_dir.join(entry.file_name());
                if fs::rename(&path, &dest).is_ok() {
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Resolve the thread when `msg` is a resolving completion.
    ///
    /// Triggers when the message is completion-typed, its content contains
    /// "RESOLVED" case-insensitively, and the sender is the thread creator
    /// or either side is a broadcast. Returns true when the thread was
    /// resolved, in which case the router must not also deliver the message.
    pub fn check_resolution(&self, msg: &Message) -> bool {
        if msg.message_type != MessageType::Completion {
            return false;
        }
        if !msg.content.to_uppercase().contains("RESOLVED") {
            return false;
        }
        let Some(thread_id) = msg.thread_id.as_deref() else {
            return false;
        };
        let Some(thread) = self.load(thread_id) else {
            return false;
        };

        let is_owner = thread.created_by == msg.from;
        let is_broadcast = msg.is_broadcast() || thread.created_by == BROADCAST;
        if !(is_owner || is_broadcast) {
            return false;
        }

        if let Err(e) = self.resolve(thread_id, &msg.from) {
            log::warn!("Failed to resolve thread {thread_id}: {e}");
            return false;
        }
        true
    }

    /// Iterate every readable thread file.
    pub fn load_all(&self) -> Vec<Thread> {
        let Ok(entries) = fs::read_dir(&self.threads_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .filter_map(|e| {
                let text = fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&text).ok()
            })
            .collect()
    }

    /// Mark a thread expired (all participants stale) and archive its
    /// messages. Used by GC only.
    pub fn expire(&self, thread_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let Some(mut thread) = self.load(thread_id) else {
            return Ok(());
        };
        thread.status = ThreadStatus::Expired;
        thread.resolved_at = Some(now_ms());
        self.save(&thread)?;
        self.archive_thread_messages(thread_id);
        log::debug!("Thread {thread_id} expired (all participants stale)");
        Ok(())
    }
}

/// Sender plus recipient (excluding the broadcast marker), deduplicated.
fn participants_of(msg: &Message) -> Vec<String> {
    let mut set = BTreeSet::new();
    if !msg.from.is_empty() {
        set.insert(msg.from.clone());
    }
    if !msg.to.is_empty() && msg.to != BROADCAST {
        set.insert(msg.to.clone());
    }
    set.into_iter().collect()
}

/// Short unique thread id.
fn new_thread_id() -> String {
    Uuid::new_v4().simple().to_string()[..THREAD_ID_LEN].to_string()
}
