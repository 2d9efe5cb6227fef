use crate::error::{PresenceError, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Single-slot side channel holding the latest verdict.
///
/// The value lives in a status file (`1` or `0`) for external pollers and in
/// a watch channel for in-process readers. Each publish replaces the slot;
/// there is no history and no queue.
pub struct StatusPublisher {
    path: PathBuf,
    sender: watch::Sender<bool>,
    // keeps the slot and the file in the same order across publishers
    write_lock: Mutex<()>,
}

impl StatusPublisher {
    /// Open the slot, starting from whatever the file last held
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let initial = read_status(&path).unwrap_or(false);
        debug!("Status slot {} starts at {}", path.display(), initial);

        let (sender, _) = watch::channel(initial);
        Self {
            path,
            sender,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the slot. In-process readers always see the new value; a
    /// failed file write is returned so the caller can log it.
    pub fn publish(&self, presence: bool) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.sender.send_replace(presence);
        write_status(&self.path, presence)
    }

    pub fn current(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Read a status file written by any publisher
pub fn read_status(path: &Path) -> Option<bool> {
    match fs::read_to_string(path) {
        Ok(contents) => match contents.trim() {
            "1" => Some(true),
            "0" => Some(false),
            other => {
                warn!("Ignoring unexpected status {:?} in {}", other, path.display());
                None
            }
        },
        Err(_) => None,
    }
}

/// Replace the file through a rename so pollers never read a torn value
fn write_status(path: &Path, presence: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".status-{}.tmp", uuid::Uuid::new_v4()));

    let written = fs::create_dir_all(dir)
        .and_then(|_| fs::File::create(&tmp))
        .and_then(|mut file| file.write_all(if presence { b"1" } else { b"0" }))
        .and_then(|_| fs::rename(&tmp, path));

    written.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PresenceError::storage(
            "status".to_string(),
            format!("failed to write {}: {}", path.display(), e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_to_false() {
        let dir = TempDir::new().unwrap();
        let status = StatusPublisher::open(dir.path().join("status.txt"));
        assert!(!status.current());
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.txt");
        let status = StatusPublisher::open(&path);

        status.publish(true).unwrap();
        status.publish(false).unwrap();
        status.publish(true).unwrap();

        assert!(status.current());
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_concurrent_publishers_leave_file_matching_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.txt");
        let status = Arc::new(StatusPublisher::open(&path));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let status = Arc::clone(&status);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        status.publish((i + n) % 2 == 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(read_status(&path), Some(status.current()));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_reopen_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.txt");
        StatusPublisher::open(&path).publish(true).unwrap();

        assert!(StatusPublisher::open(&path).current());

        fs::write(&path, "garbage").unwrap();
        assert!(!StatusPublisher::open(&path).current());
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let dir = TempDir::new().unwrap();
        let status = StatusPublisher::open(dir.path().join("status.txt"));
        let mut rx = status.subscribe();

        status.publish(true).unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_file_failure_still_updates_slot() {
        let dir = TempDir::new().unwrap();
        // a directory where the file should be makes the rename fail
        let path = dir.path().join("status.txt");
        fs::create_dir(&path).unwrap();
        let status = StatusPublisher::open(&path);

        assert!(status.publish(true).is_err());
        assert!(status.current());
    }
}
