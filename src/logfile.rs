//! Dataset logfile.
//!
//! One tab-separated line per collected scan point, after two comment lines
//! (version and column names):
//!
//! ```text
//! # beamline-daq logfile 1.0
//! #date time	started	finished	file	Delay	Laser_on	ring_current
//! 2026-10-16 12:00:00.105	2026-10-16 12:00:00.101	...	ds_0001_-10us_off.mccd	-10us	0	101.2
//! ```
//!
//! A basename has at most one line. Writing a line for a basename that is
//! already logged replaces the old line. Removing the last line removes the
//! file. Writers of the same path are serialised by a process-wide lock.

use crate::error::AppResult;
use crate::observable::Timestamp;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Column holding the x-ray image file name.
pub const FILE_COLUMN: usize = 3;

/// Fixed leading columns.
pub const FIXED_COLUMNS: [&str; 4] = ["date time", "started", "finished", "file"];

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    Arc::clone(locks.lock().entry(path.to_path_buf()).or_default())
}

fn trace_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(_\d+)?(_C\d+)?$").unwrap_or_else(|_| unreachable!("suffix pattern is valid"))
    })
}

/// Basename shared by all files of one scan point.
///
/// Strips the directory and the extension; scope traces (`.trc`) also lose
/// their `_NN` pass and `_CN` channel suffixes.
pub fn normalize_basename(name: &str) -> String {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (stem, extension) = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('_') => (stem, ext),
        _ => (file, ""),
    };
    if extension.eq_ignore_ascii_case("trc") {
        trace_suffix().replace(stem, "").into_owned()
    } else {
        stem.to_string()
    }
}

/// Local time as written in the logfile.
pub fn format_time(t: Timestamp) -> String {
    if !t.is_finite() {
        return String::new();
    }
    let micros = (t * 1e6).round() as i64;
    match Local.timestamp_micros(micros).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => String::new(),
    }
}

/// One logfile line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub time: DateTime<Local>,
    pub started: Timestamp,
    pub finished: Timestamp,
    /// X-ray image file name of the point
    pub file: String,
    /// Scan-variable cells followed by diagnostics cells
    pub values: Vec<String>,
}

impl LogEntry {
    pub fn to_line(&self) -> String {
        let mut cells = vec![
            self.time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            format_time(self.started),
            format_time(self.finished),
            self.file.clone(),
        ];
        cells.extend(self.values.iter().cloned());
        cells.join("\t")
    }
}

/// A logfile on disk.
#[derive(Debug, Clone)]
pub struct Logfile {
    path: PathBuf,
    header: Vec<String>,
}

impl Logfile {
    /// `columns` are the names after the fixed leading columns.
    pub fn new(path: impl Into<PathBuf>, version: &str, columns: &[String]) -> Self {
        let mut names: Vec<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
        names.extend(columns.iter().cloned());
        Self {
            path: path.into(),
            header: vec![
                format!("# beamline-daq logfile {version}"),
                format!("#{}", names.join("\t")),
            ],
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> AppResult<Vec<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_lines(&self, lines: &[String]) -> std::io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Add `entry`, replacing any line with the same basename.
    pub fn add_line(&self, entry: &LogEntry) -> AppResult<()> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock();
        let basename = normalize_basename(&entry.file);
        let line = entry.to_line();

        let mut lines: Vec<String> = self
            .read_lines()?
            .into_iter()
            .filter(|l| is_comment(l) || entry_basename(l).as_deref() != Some(basename.as_str()))
            .collect();
        if !lines.iter().any(|l| !is_comment(l)) {
            lines = self.header.clone();
        }
        lines.push(line.clone());

        if let Err(e) = self.write_lines(&lines) {
            warn!(path = %self.path.display(), "logfile rewrite failed, appending: {e}");
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{line}")?;
        }
        debug!(file = %entry.file, "logfile line written");
        Ok(())
    }

    /// Non-comment lines, split into cells.
    pub fn entries(&self) -> AppResult<Vec<Vec<String>>> {
        Ok(self
            .read_lines()?
            .iter()
            .filter(|l| !is_comment(l))
            .map(|l| l.split('\t').map(str::to_string).collect())
            .collect())
    }

    /// Basenames that have a line.
    pub fn basenames(&self) -> AppResult<BTreeSet<String>> {
        Ok(self
            .read_lines()?
            .iter()
            .filter(|l| !is_comment(l))
            .filter_map(|l| entry_basename(l))
            .collect())
    }

    /// Remove the lines of `basenames`. Returns the number of lines removed.
    pub fn remove_basenames(&self, basenames: &BTreeSet<String>) -> AppResult<usize> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock();
        let lines = self.read_lines()?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|l| {
                is_comment(l) || !entry_basename(l).is_some_and(|b| basenames.contains(&b))
            })
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        if kept.iter().all(|l| is_comment(l)) {
            std::fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "logfile emptied and removed");
        } else {
            self.write_lines(&kept)?;
        }
        Ok(removed)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim().is_empty() || line.starts_with('#')
}

fn entry_basename(line: &str) -> Option<String> {
    line.split('\t')
        .nth(FILE_COLUMN)
        .filter(|f| !f.is_empty())
        .map(normalize_basename)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file: &str, value: &str) -> LogEntry {
        LogEntry {
            time: Local::now(),
            started: 1.0e9,
            finished: 1.0e9 + 0.1,
            file: file.into(),
            values: vec![value.into()],
        }
    }

    #[test]
    fn test_normalize_basename() {
        assert_eq!(normalize_basename("xray_images/ds_0001_off.mccd"), "ds_0001_off");
        assert_eq!(normalize_basename("ds_0001_off_01_C1.trc"), "ds_0001_off");
        assert_eq!(normalize_basename("ds_0001_off_C3.trc"), "ds_0001_off");
        assert_eq!(normalize_basename("ds_0002_25.0_02.mccd"), "ds_0002_25.0_02");
        assert_eq!(normalize_basename("ds_0003_25.0"), "ds_0003_25");
    }

    #[test]
    fn test_add_line_replaces_same_basename() {
        let dir = tempfile::tempdir().unwrap();
        let log = Logfile::new(dir.path().join("ds.log"), "1.0", &["Laser_on".to_string()]);
        log.add_line(&entry("ds_0001_off.mccd", "0")).unwrap();
        log.add_line(&entry("ds_0002_on.mccd", "1")).unwrap();
        log.add_line(&entry("ds_0001_off.mccd", "0")).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("# beamline-daq logfile 1.0"));
        assert_eq!(lines[1], "#date time\tstarted\tfinished\tfile\tLaser_on");
        assert_eq!(log.entries().unwrap().len(), 2);
        assert_eq!(log.entries().unwrap()[1][FILE_COLUMN], "ds_0001_off.mccd");
        let expected: BTreeSet<String> = ["ds_0001_off".to_string(), "ds_0002_on".to_string()].into();
        assert_eq!(log.basenames().unwrap(), expected);
    }

    #[test]
    fn test_removing_all_lines_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = Logfile::new(dir.path().join("ds.log"), "1.0", &[]);
        log.add_line(&entry("ds_0001.mccd", "")).unwrap();
        log.add_line(&entry("ds_0002.mccd", "")).unwrap();

        let first: BTreeSet<String> = ["ds_0001".to_string()].into();
        assert_eq!(log.remove_basenames(&first).unwrap(), 1);
        assert_eq!(log.entries().unwrap().len(), 1);

        let all: BTreeSet<String> = ["ds_0001".to_string(), "ds_0002".to_string()].into();
        assert_eq!(log.remove_basenames(&all).unwrap(), 1);
        assert!(!log.path().exists());
        assert_eq!(log.remove_basenames(&all).unwrap(), 0);
    }

    #[test]
    fn test_header_rewritten_after_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ds.log");
        std::fs::write(&path, "# old header\n").unwrap();
        let log = Logfile::new(&path, "2.0", &[]);
        log.add_line(&entry("ds_0001.mccd", "")).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# beamline-daq logfile 2.0\n"));
        assert!(!text.contains("old header"));
    }

    #[test]
    fn test_concurrent_writers_keep_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = Logfile::new(dir.path().join("ds.log"), "1.0", &[]);
        std::thread::scope(|scope| {
            for i in 0..8 {
                let log = log.clone();
                scope.spawn(move || {
                    log.add_line(&entry(&format!("ds_{:04}.mccd", i + 1), "")).unwrap();
                });
            }
        });
        assert_eq!(log.entries().unwrap().len(), 8);
    }
}
