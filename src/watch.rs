//! Mailbox discovery
//!
//! External writers drop one JSON file per message into the mailbox
//! directory. A single scan loop with a seen-set is the only discovery
//! path, so a file is queued for routing exactly once no matter how many
//! scans observe it. Archived or deleted files fall out of the seen-set.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Names of message files currently visible in the mailbox, newest scan wins.
fn scan_names(messages_dir: &Path) -> Vec<OsString> {
    let Ok(entries) = fs::read_dir(messages_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| {
            let path = e.path();
            path.extension().and_then(|x| x.to_str()) == Some("json") && path.is_file()
        })
        .map(|e| e.file_name())
        .collect()
}

/// Spawn the mailbox scan loop. Newly observed message files are sent on
/// the returned channel; the loop runs until `cancel` fires.
pub fn spawn_scanner(
    messages_dir: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<PathBuf> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut seen: HashSet<OsString> = HashSet::new();
        loop {
            let names = scan_names(&messages_dir);
            for name in &names {
                if seen.insert(name.clone()) {
                    log::info!("New message file detected: {}", name.to_string_lossy());
                    if tx.send(messages_dir.join(name)).is_err() {
                        return;
                    }
                }
            }
            // Forget files that were archived or deleted so the set stays
            // bounded and a re-dropped name is treated as new.
            let current: HashSet<&OsString> = names.iter().collect();
            seen.retain(|name| current.contains(name));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        log::debug!("Mailbox scanner stopped");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn queues_each_file_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut rx = spawn_scanner(
            dir.path().to_path_buf(),
            Duration::from_secs(1),
            cancel.clone(),
        );

        fs::write(dir.path().join("msg1.json"), "{}").unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.file_name().unwrap(), "msg1.json");

        // A later file is picked up; msg1 is not re-queued.
        fs::write(dir.path().join("msg2.json"), "{}").unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.file_name().unwrap(), "msg2.json");

        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_non_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut rx = spawn_scanner(
            dir.path().to_path_buf(),
            Duration::from_secs(1),
            cancel.clone(),
        );

        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("real.json"), "{}").unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.file_name().unwrap(), "real.json");
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }
}
