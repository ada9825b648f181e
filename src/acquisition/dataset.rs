//! Dataset directory layout, progress and erasure.
//!
//! ```text
//! <directory>/
//!   <basename>.log
//!   <basename>.conf
//!   xray_images/<basename>_NNNN_<labels>.mccd
//!   xray_traces/<basename>_NNNN_<labels>_01_C1.trc
//!   laser_traces/<basename>_NNNN_<labels>_01_C1.trc
//! ```
//!
//! A point counts as acquired when the logfile has a line for its basename,
//! whether or not its raw files made it to disk.

use crate::error::AppResult;
use crate::logfile::{normalize_basename, Logfile};
use crate::scan::ScanExpansion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub const XRAY_IMAGES: &str = "xray_images";
pub const XRAY_TRACES: &str = "xray_traces";
pub const LASER_TRACES: &str = "laser_traces";

/// Detectors and scopes recording the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorSelection {
    #[serde(default = "default_true")]
    pub xray_detector: bool,
    /// Scope channel, e.g. `C1`; `None` when the x-ray scope is not used
    #[serde(default)]
    pub xray_scope: Option<String>,
    #[serde(default)]
    pub laser_scope: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for DetectorSelection {
    fn default() -> Self {
        Self {
            xray_detector: true,
            xray_scope: None,
            laser_scope: None,
        }
    }
}

impl DetectorSelection {
    /// Parse `xray_detector,xray_scope.C1,laser_scope.C2`.
    pub fn parse(text: &str) -> Self {
        let mut selection = Self {
            xray_detector: false,
            xray_scope: None,
            laser_scope: None,
        };
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (device, channel) = match item.split_once('.') {
                Some((device, channel)) => (device, channel.to_string()),
                None => (item, "C1".to_string()),
            };
            match device {
                "xray_detector" => selection.xray_detector = true,
                "xray_scope" => selection.xray_scope = Some(channel),
                "laser_scope" => selection.laser_scope = Some(channel),
                other => warn!(detector = other, "unknown detector ignored"),
            }
        }
        selection
    }

    /// Inverse of [`DetectorSelection::parse`].
    pub fn to_text(&self) -> String {
        let mut items = Vec::new();
        if self.xray_detector {
            items.push("xray_detector".to_string());
        }
        if let Some(channel) = &self.xray_scope {
            items.push(format!("xray_scope.{channel}"));
        }
        if let Some(channel) = &self.laser_scope {
            items.push(format!("laser_scope.{channel}"));
        }
        items.join(",")
    }
}

/// File names of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLayout {
    pub directory: PathBuf,
    pub basename: String,
    pub detectors: DetectorSelection,
}

impl DatasetLayout {
    pub fn new(directory: impl Into<PathBuf>, basename: impl Into<String>, detectors: DetectorSelection) -> Self {
        Self {
            directory: directory.into(),
            basename: basename.into(),
            detectors,
        }
    }

    pub fn logfile_path(&self) -> PathBuf {
        self.directory.join(format!("{}.log", self.basename))
    }

    pub fn conf_path(&self) -> PathBuf {
        self.directory.join(format!("{}.conf", self.basename))
    }

    pub fn logfile(&self, scan: &ScanExpansion, diagnostics: &[String], version: &str) -> Logfile {
        let mut columns = scan.column_names();
        columns.extend(diagnostics.iter().cloned());
        Logfile::new(self.logfile_path(), version, &columns)
    }

    /// `<basename>_NNNN_<labels>`
    pub fn point_basename(&self, scan: &ScanExpansion, i: usize) -> String {
        let label = scan.file_label(i);
        if label.is_empty() {
            format!("{}_{:04}", self.basename, i + 1)
        } else {
            format!("{}_{:04}_{label}", self.basename, i + 1)
        }
    }

    pub fn basenames(&self, scan: &ScanExpansion) -> Vec<String> {
        (0..scan.n()).map(|i| self.point_basename(scan, i)).collect()
    }

    pub fn xray_image_filename(&self, scan: &ScanExpansion, i: usize) -> String {
        format!("{}.mccd", self.point_basename(scan, i))
    }

    /// Trace of the first pass on scope channel `channel`.
    pub fn trace_filename(&self, scan: &ScanExpansion, i: usize, channel: &str) -> String {
        format!("{}_01_{channel}.trc", self.point_basename(scan, i))
    }

    pub fn subdirectories(&self) -> [PathBuf; 3] {
        [XRAY_IMAGES, XRAY_TRACES, LASER_TRACES].map(|d| self.directory.join(d))
    }

    /// Raw files that should exist for point `i`, given the detector selection.
    pub fn expected_files(&self, scan: &ScanExpansion, i: usize) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if self.detectors.xray_detector {
            files.push(self.directory.join(XRAY_IMAGES).join(self.xray_image_filename(scan, i)));
        }
        if let Some(channel) = &self.detectors.xray_scope {
            files.push(self.directory.join(XRAY_TRACES).join(self.trace_filename(scan, i, channel)));
        }
        if let Some(channel) = &self.detectors.laser_scope {
            files.push(self.directory.join(LASER_TRACES).join(self.trace_filename(scan, i, channel)));
        }
        files
    }
}

/// Progress of a dataset, read from its logfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStatus {
    acquired: Vec<bool>,
}

impl DatasetStatus {
    pub fn read(layout: &DatasetLayout, scan: &ScanExpansion, logfile: &Logfile) -> AppResult<Self> {
        let logged = logfile.basenames()?;
        let acquired = layout
            .basenames(scan)
            .iter()
            .map(|name| logged.contains(name))
            .collect();
        Ok(Self { acquired })
    }

    pub fn n(&self) -> usize {
        self.acquired.len()
    }

    pub fn acquired(&self) -> &[bool] {
        &self.acquired
    }

    pub fn is_acquired(&self, i: usize) -> bool {
        self.acquired.get(i).copied().unwrap_or(false)
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.iter().filter(|a| **a).count()
    }

    /// First point without a logfile line; `n` when all are logged.
    pub fn collection_first_i(&self) -> usize {
        self.acquired.iter().position(|a| !a).unwrap_or(self.acquired.len())
    }

    pub fn started(&self) -> bool {
        self.acquired.iter().any(|a| *a)
    }

    pub fn complete(&self) -> bool {
        self.acquired.iter().all(|a| *a)
    }

    /// Logged points whose raw files are missing.
    pub fn missing_files(&self, layout: &DatasetLayout, scan: &ScanExpansion) -> Vec<PathBuf> {
        (0..self.n())
            .filter(|i| self.is_acquired(*i))
            .flat_map(|i| layout.expected_files(scan, i))
            .filter(|path| !path.exists())
            .collect()
    }
}

/// How an erase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseOutcome {
    Erased { files: usize, lines: usize },
    Cancelled { files: usize },
}

/// Remove every file and logfile line of the dataset.
///
/// Raw files go first, then the logfile lines, then the configuration
/// snapshot. `cancel` is checked after each file.
pub fn erase_dataset(
    layout: &DatasetLayout,
    scan: &ScanExpansion,
    logfile: &Logfile,
    cancel: &AtomicBool,
) -> AppResult<EraseOutcome> {
    let expected: BTreeSet<String> = layout.basenames(scan).into_iter().collect();
    let mut files = 0;
    for directory in layout.subdirectories() {
        for path in matching_files(&directory, &expected)? {
            if cancel.load(Ordering::SeqCst) {
                info!(files, "erase cancelled");
                return Ok(EraseOutcome::Cancelled { files });
            }
            std::fs::remove_file(&path)?;
            debug!(path = %path.display(), "removed");
            files += 1;
        }
    }
    let lines = logfile.remove_basenames(&expected)?;
    if !logfile.path().exists() {
        remove_if_exists(&layout.conf_path())?;
    }
    info!(files, lines, dataset = %layout.basename, "dataset erased");
    Ok(EraseOutcome::Erased { files, lines })
}

fn matching_files(directory: &Path, basenames: &BTreeSet<String>) -> AppResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if path.is_file() && basenames.contains(&normalize_basename(&name)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::LogEntry;
    use crate::scan::ScanExpander;

    fn scan() -> ScanExpansion {
        ScanExpander::new()
            .expand("Laser_on=[0,1],Repeat=2", None)
            .unwrap()
    }

    fn layout(dir: &Path) -> DatasetLayout {
        DatasetLayout::new(
            dir,
            "ds",
            DetectorSelection::parse("xray_detector,xray_scope.C1"),
        )
    }

    fn log(logfile: &Logfile, file: &str) {
        logfile
            .add_line(&LogEntry {
                time: chrono::Local::now(),
                started: 0.0,
                finished: 0.0,
                file: file.into(),
                values: vec![],
            })
            .unwrap();
    }

    #[test]
    fn test_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let scan = scan();
        assert_eq!(layout.point_basename(&scan, 0), "ds_0001_off_1");
        assert_eq!(layout.xray_image_filename(&scan, 1), "ds_0002_on_1.mccd");
        assert_eq!(layout.trace_filename(&scan, 2, "C1"), "ds_0003_off_2_01_C1.trc");
        assert_eq!(layout.expected_files(&scan, 0).len(), 2);
    }

    #[test]
    fn test_detector_selection_text() {
        let selection = DetectorSelection::parse("xray_detector, laser_scope.C2, bogus");
        assert!(selection.xray_detector);
        assert_eq!(selection.laser_scope.as_deref(), Some("C2"));
        assert_eq!(selection.to_text(), "xray_detector,laser_scope.C2");
        assert_eq!(DetectorSelection::parse("xray_scope").xray_scope.as_deref(), Some("C1"));
    }

    #[test]
    fn test_status_from_logfile() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let scan = scan();
        let logfile = layout.logfile(&scan, &[], "1.0");
        let status = DatasetStatus::read(&layout, &scan, &logfile).unwrap();
        assert!(!status.started());
        assert_eq!(status.collection_first_i(), 0);

        log(&logfile, "ds_0001_off_1.mccd");
        log(&logfile, "ds_0002_on_1.mccd");
        let status = DatasetStatus::read(&layout, &scan, &logfile).unwrap();
        assert!(status.started());
        assert!(!status.complete());
        assert_eq!(status.acquired_count(), 2);
        assert_eq!(status.collection_first_i(), 2);
        assert_eq!(status.acquired_count() + (status.n() - status.acquired_count()), scan.n());
        // logged but no raw files on disk
        assert_eq!(status.missing_files(&layout, &scan).len(), 4);
    }

    #[test]
    fn test_erase_removes_files_lines_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let scan = scan();
        let logfile = layout.logfile(&scan, &[], "1.0");
        for i in 0..scan.n() {
            for path in layout.expected_files(&scan, i) {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, "data").unwrap();
            }
            log(&logfile, &layout.xray_image_filename(&scan, i));
        }
        std::fs::write(layout.conf_path(), "snapshot").unwrap();
        let unrelated = dir.path().join(XRAY_IMAGES).join("other_0001.mccd");
        std::fs::write(&unrelated, "keep").unwrap();

        let outcome = erase_dataset(&layout, &scan, &logfile, &AtomicBool::new(false)).unwrap();
        assert_eq!(outcome, EraseOutcome::Erased { files: 8, lines: 4 });
        assert!(!logfile.path().exists());
        assert!(!layout.conf_path().exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_erase_cancelled_keeps_logfile() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let scan = scan();
        let logfile = layout.logfile(&scan, &[], "1.0");
        let path = layout.expected_files(&scan, 0).remove(0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "data").unwrap();
        log(&logfile, "ds_0001_off_1.mccd");

        let outcome = erase_dataset(&layout, &scan, &logfile, &AtomicBool::new(true)).unwrap();
        assert_eq!(outcome, EraseOutcome::Cancelled { files: 0 });
        assert!(path.exists());
        assert_eq!(logfile.entries().unwrap().len(), 1);
    }
}
