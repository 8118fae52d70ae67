//! File-sentinel emergency pause.
//!
//! A background loop polls a filesystem path. When the file appears its
//! contents become the kill reason, the file is removed, and the registered
//! callback runs. The callback pauses the bot; it does not close positions,
//! so funding keeps accruing until an operator closes manually.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How often the sentinel path is polled.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Callback invoked with the kill reason.
pub type KillCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Watches the kill-switch sentinel file.
pub struct KillSwitch {
    path: PathBuf,
    poll_interval: Duration,
    callback: Option<KillCallback>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: POLL_INTERVAL,
            callback: None,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register the callback fired when the sentinel appears.
    pub fn on_triggered(&mut self, callback: KillCallback) {
        self.callback = Some(callback);
    }

    /// Start the polling loop.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("kill switch monitor already running");
            return;
        }

        let path = self.path.clone();
        let interval = self.poll_interval;
        let callback = self.callback.clone();
        let running = self.running.clone();

        info!(path = %path.display(), "kill switch monitor started");
        self.handle = Some(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if let Some(reason) = check_and_consume(&path) {
                    error!(reason, "KILL SWITCH TRIGGERED");
                    if let Some(cb) = &callback {
                        cb(reason);
                    }
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Stop the polling loop.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        info!("kill switch monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for KillSwitch {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// If the sentinel exists, read the reason and delete the file.
fn check_and_consume(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }

    let reason = std::fs::read_to_string(path)
        .map(|s| {
            let trimmed = s.trim().to_string();
            if trimmed.is_empty() {
                "no reason given".to_string()
            } else {
                trimmed
            }
        })
        .unwrap_or_else(|e| format!("unreadable kill file: {}", e));

    if let Err(e) = std::fs::remove_file(path) {
        // Leaving the file would re-trigger every poll; surface loudly.
        error!(path = %path.display(), error = %e, "failed to remove kill file");
    }

    Some(reason)
}

/// Write the sentinel file, triggering the switch on the next poll.
pub fn trigger(path: &Path, reason: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = format!("{} (triggered at {})", reason, Utc::now().to_rfc3339());
    std::fs::write(path, body)
}

/// Whether the sentinel is currently present, and its contents.
pub fn status(path: &Path) -> Option<String> {
    if path.exists() {
        std::fs::read_to_string(path).ok()
    } else {
        None
    }
}

/// Remove the sentinel without triggering. True when a file was removed.
pub fn clear(path: &Path) -> bool {
    std::fs::remove_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn temp_sentinel(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bh-kill-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_trigger_status_clear() {
        let path = temp_sentinel("tsc");
        assert!(status(&path).is_none());

        trigger(&path, "manual drill").unwrap();
        let body = status(&path).unwrap();
        assert!(body.contains("manual drill"));

        assert!(clear(&path));
        assert!(status(&path).is_none());
        assert!(!clear(&path));
    }

    #[test]
    fn test_check_and_consume_removes_file() {
        let path = temp_sentinel("consume");
        trigger(&path, "drain").unwrap();

        let reason = check_and_consume(&path).unwrap();
        assert!(reason.contains("drain"));
        // Consumed: second check sees nothing.
        assert!(check_and_consume(&path).is_none());
    }

    #[test]
    fn test_empty_file_gets_default_reason() {
        let path = temp_sentinel("empty");
        std::fs::write(&path, "").unwrap();
        let reason = check_and_consume(&path).unwrap();
        assert_eq!(reason, "no reason given");
    }

    #[tokio::test]
    async fn test_monitor_invokes_callback() {
        let path = temp_sentinel("loop");
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let mut switch =
            KillSwitch::new(&path).with_poll_interval(Duration::from_millis(10));
        switch.on_triggered(Arc::new(move |reason| {
            seen_clone.lock().unwrap().push(reason);
        }));
        switch.start();
        assert!(switch.is_running());

        trigger(&path, "halt everything").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        switch.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("halt everything"));
        // The sentinel was consumed.
        assert!(!path.exists());
    }
}
