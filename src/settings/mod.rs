//! Settings Store
//!
//! Key/value persistence with change notifications. Each logical table lives in
//! its own UTF-8 text file, one `key = literal` entry per line:
//!
//! ```text
//! # comments and blank lines are ignored
//! collection_order = 'Delay,Laser_on,Temperature,Repeat=16'
//! Temperature.values = '20.0, 25.0, \
//!     30.0'
//! finish_series = False
//! ```
//!
//! Lines that begin with whitespace, or follow a line ending in `\`, continue the
//! previous entry. Tables are addressed with slash paths
//! (`domains/<domain>/<component>`) and keys inside a table are dotted. A table
//! name with the `local.` prefix is stored under the per-user settings directory
//! instead of the shared one.
//!
//! Reads go through a modification-time cache that touches the disk at most once
//! per check interval. Writes rewrite the whole file through a temporary file and
//! a rename, so concurrent readers never see a partial file.

pub mod literal;
pub mod watcher;

pub use literal::SettingValue;
pub use watcher::SettingsWatcher;

use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Suffix appended to table names to form file names.
const FILE_SUFFIX: &str = "_settings.txt";

/// Notification sent when a key changes, through this process or on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsChange {
    /// Table the key belongs to
    pub table: String,
    /// Key inside the table
    pub key: String,
    /// New value, `None` if the key disappeared
    pub value: Option<SettingValue>,
}

#[derive(Debug, Default)]
struct CachedFile {
    mtime: Option<SystemTime>,
    checked: Option<Instant>,
    entries: BTreeMap<String, String>,
}

/// Settings persistence rooted at a shared and a per-user directory.
#[derive(Debug)]
pub struct SettingsStore {
    root: PathBuf,
    local_root: PathBuf,
    check_interval: Duration,
    cache: Mutex<HashMap<String, CachedFile>>,
    changes: broadcast::Sender<SettingsChange>,
}

impl SettingsStore {
    /// Create a store. `local_root` receives tables with the `local.` prefix.
    pub fn new(root: impl Into<PathBuf>, local_root: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            root: root.into(),
            local_root: local_root.into(),
            check_interval: Duration::from_secs(1),
            cache: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Store whose per-user tables live under the platform config directory.
    pub fn with_user_local(root: impl Into<PathBuf>, application: &str) -> Self {
        let local = dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(application)
            .join("settings");
        Self::new(root, local)
    }

    /// Override the disk check interval (default one second).
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }

    /// File backing a table.
    pub fn table_path(&self, table: &str) -> PathBuf {
        match table.strip_prefix("local.") {
            Some(rest) => self.local_root.join(format!("{rest}{FILE_SUFFIX}")),
            None => self.root.join(format!("{table}{FILE_SUFFIX}")),
        }
    }

    /// Handle on one table.
    pub fn table(&self, name: impl Into<String>) -> SettingsTable<'_> {
        SettingsTable {
            store: self,
            name: name.into(),
        }
    }

    /// Read a value by full path `<table>/<key>`.
    pub fn get(&self, path: &str) -> AppResult<Option<SettingValue>> {
        let (table, key) = split_path(path)?;
        self.get_in(table, key)
    }

    /// Write a value by full path `<table>/<key>`.
    pub fn set(&self, path: &str, value: SettingValue) -> AppResult<()> {
        let (table, key) = split_path(path)?;
        self.set_in(table, key, value)
    }

    fn get_in(&self, table: &str, key: &str) -> AppResult<Option<SettingValue>> {
        let raw = {
            let mut cache = self.cache.lock();
            let entry = cache.entry(table.to_string()).or_default();
            self.refresh(table, entry, false)?;
            entry.entries.get(key).cloned()
        };
        raw.map(|text| SettingValue::parse(&text)).transpose()
    }

    fn keys_in(&self, table: &str) -> AppResult<Vec<String>> {
        let mut cache = self.cache.lock();
        let entry = cache.entry(table.to_string()).or_default();
        self.refresh(table, entry, false)?;
        Ok(entry.entries.keys().cloned().collect())
    }

    fn set_in(&self, table: &str, key: &str, value: SettingValue) -> AppResult<()> {
        let path = self.table_path(table);
        let text = value.to_string();
        {
            let mut cache = self.cache.lock();
            let entry = cache.entry(table.to_string()).or_default();
            self.refresh(table, entry, true)?;
            if entry.entries.get(key) == Some(&text) {
                return Ok(());
            }
            entry.entries.insert(key.to_string(), text);
            write_table(&path, &entry.entries)?;
            entry.mtime = modification_time(&path);
            entry.checked = Some(Instant::now());
        }
        debug!(table, key, value = %value, "setting written");
        let _ = self.changes.send(SettingsChange {
            table: table.to_string(),
            key: key.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    /// Re-read a cached table if its file changed on disk.
    ///
    /// `force` skips the check interval.
    fn refresh(&self, table: &str, entry: &mut CachedFile, force: bool) -> AppResult<Vec<String>> {
        let fresh = entry
            .checked
            .is_some_and(|t| t.elapsed() < self.check_interval);
        if fresh && !force {
            return Ok(Vec::new());
        }
        entry.checked = Some(Instant::now());
        let path = self.table_path(table);
        let mtime = modification_time(&path);
        if mtime == entry.mtime && (mtime.is_some() || entry.entries.is_empty()) {
            return Ok(Vec::new());
        }
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => parse_table(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        let mut changed: Vec<String> = entries
            .iter()
            .filter(|(k, v)| entry.entries.get(*k) != Some(v))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(
            entry
                .entries
                .keys()
                .filter(|k| !entries.contains_key(*k))
                .cloned(),
        );
        entry.entries = entries;
        entry.mtime = mtime;
        Ok(changed)
    }

    /// Check every cached table against the disk and publish changes made by
    /// other processes. Returns the number of changed keys.
    pub fn poll_changes(&self) -> usize {
        let mut events = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (table, entry) in cache.iter_mut() {
                match self.refresh(table, entry, true) {
                    Ok(keys) => {
                        for key in keys {
                            let value = entry
                                .entries
                                .get(&key)
                                .and_then(|raw| SettingValue::parse(raw).ok());
                            events.push(SettingsChange {
                                table: table.clone(),
                                key,
                                value,
                            });
                        }
                    }
                    Err(e) => warn!(table = %table, "settings reload failed: {}", e),
                }
            }
        }
        let count = events.len();
        for event in events {
            let _ = self.changes.send(event);
        }
        count
    }
}

/// Handle on a single settings table.
#[derive(Debug, Clone)]
pub struct SettingsTable<'a> {
    store: &'a SettingsStore,
    name: String,
}

impl SettingsTable<'_> {
    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a key.
    pub fn get(&self, key: &str) -> AppResult<Option<SettingValue>> {
        self.store.get_in(&self.name, key)
    }

    /// Write a key.
    pub fn set(&self, key: &str, value: impl Into<SettingValue>) -> AppResult<()> {
        self.store.set_in(&self.name, key, value.into())
    }

    /// All keys currently in the table.
    pub fn keys(&self) -> AppResult<Vec<String>> {
        self.store.keys_in(&self.name)
    }

    /// Read a string, falling back to `default`.
    pub fn string_or(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Ok(Some(SettingValue::Str(s))) => s,
            Ok(Some(other)) => other.to_string(),
            _ => default.to_string(),
        }
    }

    /// Read a float, falling back to `default`.
    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .ok()
            .flatten()
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    /// Read an integer, falling back to `default`.
    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .ok()
            .flatten()
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
    }

    /// Read a flag, falling back to `default`.
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .ok()
            .flatten()
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }
}

fn split_path(path: &str) -> AppResult<(&str, &str)> {
    path.rsplit_once('/')
        .filter(|(table, key)| !table.is_empty() && !key.is_empty())
        .ok_or_else(|| DaqError::Settings(format!("'{path}' is not of the form <table>/<key>")))
}

fn modification_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Parse the `key = literal` file format, joining continuation lines.
pub fn parse_table(content: &str) -> BTreeMap<String, String> {
    let mut logical: Vec<String> = Vec::new();
    let mut continued = false;
    for line in content.lines() {
        let starts_indented = line.starts_with(|c: char| c == ' ' || c == '\t');
        let (body, ends_with_backslash) = match line.trim_end().strip_suffix('\\') {
            Some(stripped) => (stripped.to_string(), true),
            None => (line.trim_end().to_string(), false),
        };
        if (continued || starts_indented) && !logical.is_empty() && !body.trim().is_empty() {
            if let Some(last) = logical.last_mut() {
                last.push(' ');
                last.push_str(body.trim());
            }
        } else if !body.trim().is_empty() {
            logical.push(body.trim().to_string());
        }
        continued = ends_with_backslash;
    }

    logical
        .into_iter()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn write_table(path: &Path, entries: &BTreeMap<String, String>) -> AppResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut content = String::new();
    for (key, value) in entries {
        content.push_str(key);
        content.push_str(" = ");
        content.push_str(value);
        content.push('\n');
    }
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|e| DaqError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("shared"), dir.path().join("local"))
            .with_check_interval(Duration::ZERO);
        (dir, store)
    }

    #[test]
    fn test_parse_table_continuations() {
        let text = "# header\n\
                    a = 1\n\
                    b = 'x, \\\n\
                    y'\n\
                    c = [1,\n    2]\n\
                    \n";
        let table = parse_table(text);
        assert_eq!(table["a"], "1");
        assert_eq!(table["b"], "'x, y'");
        assert_eq!(table["c"], "[1, 2]");
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_set_and_get() {
        let (_dir, store) = store();
        let table = store.table("domains/BioCARS/collect");
        table
            .set("collection_order", "Delay,Laser_on,Repeat=16")
            .unwrap();
        table.set("finish_series", false).unwrap();
        assert_eq!(
            table.string_or("collection_order", ""),
            "Delay,Laser_on,Repeat=16"
        );
        assert!(!table.bool_or("finish_series", true));
        assert_eq!(
            store.get("domains/BioCARS/collect/finish_series").unwrap(),
            Some(SettingValue::Bool(false))
        );
        assert!(store
            .table_path("domains/BioCARS/collect")
            .ends_with("domains/BioCARS/collect_settings.txt"));
    }

    #[test]
    fn test_local_prefix_redirects() {
        let (dir, store) = store();
        store.table("local.window").set("width", 640_i64).unwrap();
        assert!(dir.path().join("local/window_settings.txt").exists());
        assert!(!dir.path().join("shared").exists());
    }

    #[test]
    fn test_external_change_detected() {
        let (_dir, store) = store();
        let table = store.table("timing");
        table.set("hsct", 1e-3).unwrap();
        let mut rx = store.subscribe();
        // Another process rewrites the file.
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(store.table_path("timing"), "hsct = 0.002\n").unwrap();
        let path = store.table_path("timing");
        let later = SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(later).unwrap();
        assert_eq!(store.poll_changes(), 1);
        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, "hsct");
        assert_eq!(change.value, Some(SettingValue::Float(0.002)));
        assert_eq!(table.f64_or("hsct", 0.0), 0.002);
    }

    #[test]
    fn test_bad_path() {
        let (_dir, store) = store();
        assert!(store.get("no_slash").is_err());
    }
}
