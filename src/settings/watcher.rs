//! Settings file monitor.
//!
//! Polls the modification times of every settings table the process has read
//! and republishes changes made by other processes through the store's change
//! channel. Writes made by this process update the cached modification time
//! first, so they are not reported a second time.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = Arc::new(SettingsStore::new("settings", "local"));
//! let watcher = SettingsWatcher::spawn(Arc::clone(&store), Duration::from_secs(1));
//! let mut changes = store.subscribe();
//! while let Ok(change) = changes.recv().await {
//!     tracing::info!(key = %change.key, "setting changed");
//! }
//! watcher.stop().await;
//! ```

use super::SettingsStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Background task that watches settings files.
pub struct SettingsWatcher {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SettingsWatcher {
    /// Start polling `store` every `interval`.
    pub fn spawn(store: Arc<SettingsStore>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "settings watcher started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let store = Arc::clone(&store);
                        let changed = tokio::task::spawn_blocking(move || store.poll_changes())
                            .await
                            .unwrap_or(0);
                        if changed > 0 {
                            debug!(changed, "settings changed on disk");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            info!("settings watcher stopped");
        });
        Self { stop_tx, handle }
    }

    /// Stop the watcher and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!("settings watcher task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingValue;
    use std::time::SystemTime;

    #[tokio::test]
    async fn test_watcher_reports_external_edit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SettingsStore::new(dir.path(), dir.path().join("local"))
                .with_check_interval(Duration::ZERO),
        );
        store.table("collect").set("description", "first").unwrap();
        let mut rx = store.subscribe();
        let watcher = SettingsWatcher::spawn(Arc::clone(&store), Duration::from_millis(20));

        let path = store.table_path("collect");
        std::fs::write(&path, "description = 'second'\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.key, "description");
        assert_eq!(change.value, Some(SettingValue::Str("second".into())));
        watcher.stop().await;
    }
}
