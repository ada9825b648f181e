//! Acquisition Controller
//!
//! Runs a dataset: loads the sequence queue, arms the detectors, steps the
//! sequencer through the passes of the scan and writes one logfile line per
//! finished scan point.
//!
//! # Point bookkeeping
//!
//! The timing system counts finished points in `image_number`. Every time it
//! moves, the controller closes the points in between: the diagnostics
//! recorder reduces the samples of the point, its `finished` event writes the
//! logfile line, then `current` advances and the scan drivers follow.
//!
//! # Passes
//!
//! A pass is the range of points between two changes of a waiting axis. The
//! sequencer is stopped at the end of each pass, the waiting axes move, and
//! the next pass starts once they are in position.

use super::dataset::{
    erase_dataset, DatasetLayout, DatasetStatus, DetectorSelection, EraseOutcome, LASER_TRACES,
    XRAY_IMAGES, XRAY_TRACES,
};
use crate::diagnostics::{DiagnosticsRecorder, PointDiagnostics};
use crate::error::{AppResult, DaqError};
use crate::format::ValueFormat;
use crate::hardware::{Detector, DetectorRun};
use crate::logfile::{LogEntry, Logfile};
use crate::observable::{now, Delivery, Event, HandlerId, Monitored, Timestamp};
use crate::scan::{AxisConfig, ScanDriver, ScanExpander, ScanExpansion};
use crate::sequence::{SequenceComposer, SequenceMode, SequencerQueue, UploadOutcome};
use crate::settings::SettingsTable;
use crate::tables::TableSet;
use crate::timing::TimingSystem;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Dataset attributes that persist between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_basename")]
    pub basename: String,
    #[serde(default)]
    pub description: String,
    /// e.g. `Delay,Laser_on,Temperature,Repeat=16`
    #[serde(default)]
    pub collection_order: String,
    #[serde(default)]
    pub detectors: DetectorSelection,
    #[serde(default)]
    pub finish_series_variable: String,
    #[serde(default)]
    pub override_repeat: bool,
    #[serde(default = "default_repeat_count")]
    pub override_repeat_count: usize,
}

fn default_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_basename() -> String {
    "dataset".to_string()
}

fn default_repeat_count() -> usize {
    1
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            basename: default_basename(),
            description: String::new(),
            collection_order: String::new(),
            detectors: DetectorSelection::default(),
            finish_series_variable: String::new(),
            override_repeat: false,
            override_repeat_count: default_repeat_count(),
        }
    }
}

impl AcquisitionSettings {
    /// Read from a settings table; missing keys keep the value in `defaults`.
    pub fn load(table: &SettingsTable<'_>, defaults: &Self) -> Self {
        let detectors = table.string_or("detector_configuration", &defaults.detectors.to_text());
        Self {
            directory: PathBuf::from(
                table.string_or("directory", &defaults.directory.to_string_lossy()),
            ),
            basename: table.string_or("basename", &defaults.basename),
            description: table.string_or("description", &defaults.description),
            collection_order: table.string_or("collection_order", &defaults.collection_order),
            detectors: DetectorSelection::parse(&detectors),
            finish_series_variable: table
                .string_or("finish_series_variable", &defaults.finish_series_variable),
            override_repeat: table.bool_or("override_repeat", defaults.override_repeat),
            override_repeat_count: table
                .i64_or("override_repeat_count", defaults.override_repeat_count as i64)
                .max(1) as usize,
        }
    }

    pub fn save(&self, table: &SettingsTable<'_>) -> AppResult<()> {
        table.set("directory", self.directory.to_string_lossy().into_owned())?;
        table.set("basename", self.basename.as_str())?;
        table.set("description", self.description.as_str())?;
        table.set("collection_order", self.collection_order.as_str())?;
        table.set("detector_configuration", self.detectors.to_text())?;
        table.set("finish_series_variable", self.finish_series_variable.as_str())?;
        table.set("override_repeat", self.override_repeat)?;
        table.set("override_repeat_count", self.override_repeat_count as i64)?;
        Ok(())
    }

    /// Repeat count replacing the one in `collection_order`, if enabled.
    pub fn override_repeat(&self) -> Option<usize> {
        self.override_repeat.then_some(self.override_repeat_count)
    }
}

/// Fixed parameters of the acquisition loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// How long to wait for a waiting axis before starting a pass anyway
    #[serde(with = "humantime_serde", default = "default_settle_timeout")]
    pub settle_timeout: Duration,
    #[serde(default = "default_logfile_version")]
    pub logfile_version: String,
    /// X-ray detector clock drift, relative
    #[serde(default = "default_drift_rate")]
    pub timestamp_drift_rate: f64,
    #[serde(default)]
    pub defaults: AcquisitionSettings,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_settle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_logfile_version() -> String {
    "1.0".to_string()
}

fn default_drift_rate() -> f64 {
    1.95e-5
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            settle_timeout: default_settle_timeout(),
            logfile_version: default_logfile_version(),
            timestamp_drift_rate: default_drift_rate(),
            defaults: AcquisitionSettings::default(),
        }
    }
}

/// Correct a detector timestamp for clock drift since `reference`.
pub fn corrected_timestamp(raw: Timestamp, reference: Timestamp, drift_rate: f64) -> Timestamp {
    raw - (raw - reference) * drift_rate
}

fn local_time(t: Timestamp) -> DateTime<Local> {
    Local
        .timestamp_micros((t * 1e6).round() as i64)
        .single()
        .unwrap_or_else(Local::now)
}

/// `n`, or the end of the current block of `variable` while a series is being finished.
fn n_collect_for(scan: &ScanExpansion, current: usize, finish: bool, variable: &str) -> AppResult<usize> {
    if finish {
        scan.n_collect(current, Some(variable))
    } else {
        scan.n_collect(current, None)
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// How `collect_dataset` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// Every point already had a logfile line
    AlreadyComplete,
    Completed { collected: usize },
    /// Stopped at the end of the series block
    SeriesFinished { collected: usize, n_collect: usize },
    Cancelled { collected: usize },
}

// =============================================================================
// Point tracking
// =============================================================================

struct TrackerState {
    next: usize,
    last_finish: Timestamp,
}

/// Closes scan points as the timing system reports them done.
struct PointTracker {
    scan: ScanExpansion,
    diagnostics: Arc<DiagnosticsRecorder>,
    current: Monitored<usize>,
    finish_series: Monitored<bool>,
    settings: Arc<RwLock<AcquisitionSettings>>,
    first: usize,
    state: Mutex<TrackerState>,
}

impl PointTracker {
    fn n_collect(&self, current: usize) -> usize {
        let variable = self.settings.read().finish_series_variable.clone();
        match n_collect_for(&self.scan, current, self.finish_series.get(), &variable) {
            Ok(n) => n,
            Err(e) => {
                warn!("finish series ignored: {e}");
                self.scan.n()
            }
        }
    }

    fn begin_pass(&self, first: usize) {
        let mut state = self.state.lock();
        state.next = first;
        state.last_finish = now();
    }

    fn next(&self) -> usize {
        self.state.lock().next
    }

    fn collected(&self) -> usize {
        self.next().saturating_sub(self.first)
    }

    /// Close every point below `reached`, up to `n_collect`.
    ///
    /// `n_collect` is evaluated again for every point, so a handler on
    /// `current` can end the series early.
    fn advance(&self, reached: usize) {
        loop {
            let (i, started, finished) = {
                let mut state = self.state.lock();
                let i = state.next;
                if i >= reached || i >= self.n_collect(i) {
                    break;
                }
                let finished = now();
                let started = state.last_finish;
                state.next = i + 1;
                state.last_finish = finished;
                (i, started, finished)
            };
            self.diagnostics.finish_point(i, started, finished);
            self.current.set(i + 1);
            if i + 1 < self.scan.n() {
                for driver in self.scan.axes().iter().filter_map(|a| a.driver.as_ref()) {
                    driver.on_scan_point(i + 1);
                }
            }
            debug!(point = i, "scan point finished");
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Snapshot written next to the logfile at the start and end of a run.
#[derive(Debug, Serialize)]
struct ConfigurationSnapshot {
    saved: String,
    description: String,
    collection_order: String,
    detectors: String,
    finish_series_variable: String,
    override_repeat: bool,
    override_repeat_count: usize,
    n: usize,
    mode: SequenceMode,
    axes: Vec<AxisConfig>,
    tables: BTreeMap<String, String>,
}

/// Central orchestrator of a dataset.
pub struct AcquisitionController {
    config: AcquisitionConfig,
    settings: Arc<RwLock<AcquisitionSettings>>,
    timing: Arc<TimingSystem>,
    composer: Arc<SequenceComposer>,
    queue: Arc<SequencerQueue>,
    expander: ScanExpander,
    diagnostics: Arc<DiagnosticsRecorder>,
    detectors: Vec<Arc<dyn Detector>>,
    tables: Option<Arc<RwLock<TableSet>>>,
    finish_series: Monitored<bool>,
    collecting: Monitored<bool>,
    current: Monitored<usize>,
    collection_range: Monitored<(usize, usize)>,
    status: Monitored<String>,
    cancelled: Arc<AtomicBool>,
    run_lock: tokio::sync::Mutex<()>,
}

impl AcquisitionController {
    pub fn new(
        config: AcquisitionConfig,
        composer: Arc<SequenceComposer>,
        queue: Arc<SequencerQueue>,
        expander: ScanExpander,
        diagnostics: Arc<DiagnosticsRecorder>,
    ) -> Self {
        let settings = Arc::new(RwLock::new(config.defaults.clone()));
        Self {
            config,
            settings,
            timing: Arc::clone(queue.timing()),
            composer,
            queue,
            expander,
            diagnostics,
            detectors: Vec::new(),
            tables: None,
            finish_series: Monitored::new("acquisition", "finish_series", false),
            collecting: Monitored::new("acquisition", "collecting_dataset", false),
            current: Monitored::new("acquisition", "current", 0),
            collection_range: Monitored::new("acquisition", "collection_range", (0, 0)),
            status: Monitored::new("acquisition", "status", String::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Add a detector. Its name selects it: `xray_detector`, `xray_scope` or `laser_scope`.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Configuration tables included in the dataset snapshot.
    pub fn with_tables(mut self, tables: Arc<RwLock<TableSet>>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn settings(&self) -> AcquisitionSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, change: impl FnOnce(&mut AcquisitionSettings)) {
        change(&mut self.settings.write());
    }

    pub fn load_settings(&self, table: &SettingsTable<'_>) {
        let loaded = AcquisitionSettings::load(table, &self.config.defaults);
        *self.settings.write() = loaded;
        self.finish_series
            .set_if_changed(table.bool_or("finish_series", false));
    }

    pub fn save_settings(&self, table: &SettingsTable<'_>) -> AppResult<()> {
        self.settings().save(table)?;
        table.set("finish_series", self.finish_series.get())
    }

    pub fn expander(&self) -> &ScanExpander {
        &self.expander
    }

    pub fn timing(&self) -> &Arc<TimingSystem> {
        &self.timing
    }

    pub fn queue(&self) -> &Arc<SequencerQueue> {
        &self.queue
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsRecorder> {
        &self.diagnostics
    }

    /// Stop after the current pass point at the end of the current block of `variable`.
    pub fn finish_series(&self) -> &Monitored<bool> {
        &self.finish_series
    }

    /// True while `collect_dataset` runs.
    pub fn collecting(&self) -> &Monitored<bool> {
        &self.collecting
    }

    /// Next scan point to be collected.
    pub fn current(&self) -> &Monitored<usize> {
        &self.current
    }

    /// First and last point of the pass being collected.
    pub fn collection_range(&self) -> &Monitored<(usize, usize)> {
        &self.collection_range
    }

    /// Human-readable progress message.
    pub fn status_message(&self) -> &Monitored<String> {
        &self.status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Ask the running collection or erase to stop.
    pub fn cancel(&self) {
        info!("cancel requested");
        self.cancelled.store(true, Ordering::SeqCst);
        self.queue.cancel();
    }

    // -------------------------------------------------------------------------
    // Derived values
    // -------------------------------------------------------------------------

    /// Expanded scan of the current settings.
    pub fn expansion(&self) -> AppResult<ScanExpansion> {
        let settings = self.settings();
        self.expander
            .expand(&settings.collection_order, settings.override_repeat())
    }

    pub fn layout(&self) -> DatasetLayout {
        let settings = self.settings();
        DatasetLayout::new(settings.directory, settings.basename, settings.detectors)
    }

    pub fn logfile(&self, scan: &ScanExpansion) -> Logfile {
        self.layout().logfile(
            scan,
            &self.diagnostics.channel_names(),
            &self.config.logfile_version,
        )
    }

    pub fn dataset_status(&self) -> AppResult<DatasetStatus> {
        let scan = self.expansion()?;
        DatasetStatus::read(&self.layout(), &scan, &self.logfile(&scan))
    }

    pub fn collection_first_i(&self) -> AppResult<usize> {
        Ok(self.dataset_status()?.collection_first_i())
    }

    pub fn collection_pass_count(&self) -> AppResult<usize> {
        Ok(self.expansion()?.pass_count())
    }

    /// Points to collect, given the finish-series request.
    pub fn n_collect(&self, scan: &ScanExpansion, current: usize) -> AppResult<usize> {
        let variable = self.settings.read().finish_series_variable.clone();
        n_collect_for(scan, current, self.finish_series.get(), &variable)
    }

    // -------------------------------------------------------------------------
    // Dataset operations
    // -------------------------------------------------------------------------

    /// Write the configuration snapshot of the dataset.
    pub fn snapshot_configuration(&self, scan: &ScanExpansion) -> AppResult<PathBuf> {
        let settings = self.settings();
        let tables = match &self.tables {
            Some(tables) => {
                let tables = tables.read();
                tables
                    .names()
                    .into_iter()
                    .filter_map(|name| tables.get(&name).map(|t| (name, t.to_text())))
                    .collect()
            }
            None => BTreeMap::new(),
        };
        let snapshot = ConfigurationSnapshot {
            saved: Local::now().to_rfc3339(),
            description: settings.description.clone(),
            collection_order: settings.collection_order.clone(),
            detectors: settings.detectors.to_text(),
            finish_series_variable: settings.finish_series_variable.clone(),
            override_repeat: settings.override_repeat,
            override_repeat_count: settings.override_repeat_count,
            n: scan.n(),
            mode: self.composer.mode(),
            axes: self.expander.drivers().map(|d| d.config()).collect(),
            tables,
        };
        let path = self.layout().conf_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml::to_string(&snapshot)?)?;
        debug!(path = %path.display(), "configuration snapshot written");
        Ok(path)
    }

    /// Erase every file and logfile line of the dataset.
    pub async fn erase_dataset(&self) -> AppResult<EraseOutcome> {
        let Ok(_running) = self.run_lock.try_lock() else {
            return Err(DaqError::Configuration("a collection is running".into()));
        };
        self.cancelled.store(false, Ordering::SeqCst);
        let scan = self.expansion()?;
        let layout = self.layout();
        let logfile = self.logfile(&scan);
        let cancelled = Arc::clone(&self.cancelled);
        let outcome = tokio::task::spawn_blocking(move || {
            erase_dataset(&layout, &scan, &logfile, &cancelled)
        })
        .await
        .map_err(|e| DaqError::Configuration(format!("erase task failed: {e}")))??;
        self.status.set(format!("{outcome:?}"));
        Ok(outcome)
    }

    fn detector_runs(
        &self,
        scan: &ScanExpansion,
        layout: &DatasetLayout,
        first: usize,
    ) -> Vec<(Arc<dyn Detector>, DetectorRun)> {
        let selection = &layout.detectors;
        let mut runs = Vec::new();
        for detector in &self.detectors {
            let (subdirectory, filenames): (&str, Vec<String>) = match detector.name() {
                "xray_detector" if selection.xray_detector => (
                    XRAY_IMAGES,
                    (0..scan.n()).map(|i| layout.xray_image_filename(scan, i)).collect(),
                ),
                "xray_scope" => match &selection.xray_scope {
                    Some(channel) => (
                        XRAY_TRACES,
                        (0..scan.n()).map(|i| layout.trace_filename(scan, i, channel)).collect(),
                    ),
                    None => continue,
                },
                "laser_scope" => match &selection.laser_scope {
                    Some(channel) => (
                        LASER_TRACES,
                        (0..scan.n()).map(|i| layout.trace_filename(scan, i, channel)).collect(),
                    ),
                    None => continue,
                },
                _ => continue,
            };
            runs.push((
                Arc::clone(detector),
                DetectorRun {
                    directory: layout.directory.join(subdirectory),
                    filenames,
                    first_point: first,
                },
            ));
        }
        runs
    }

    /// Handler turning finished points into logfile lines.
    ///
    /// Lines are queued to a task that writes them in order on the blocking
    /// pool; sending `None` ends that task once the queue is drained.
    fn log_writer(
        &self,
        scan: &ScanExpansion,
        layout: &DatasetLayout,
        logfile: Logfile,
        run_start: Timestamp,
    ) -> (
        impl Fn(&Event<Option<PointDiagnostics>>) + Send + Sync + 'static,
        mpsc::UnboundedSender<Option<LogEntry>>,
        JoinHandle<()>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<LogEntry>>();
        let task = tokio::spawn(async move {
            while let Some(Some(entry)) = rx.recv().await {
                let logfile = logfile.clone();
                let file = entry.file.clone();
                match tokio::task::spawn_blocking(move || logfile.add_line(&entry)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(file = %file, "logfile write failed: {e}"),
                    Err(e) => error!(file = %file, "logfile writer task failed: {e}"),
                }
            }
        });

        let scan = scan.clone();
        let layout = layout.clone();
        let channels = self.diagnostics.channel_names();
        let drift_rate = self.config.timestamp_drift_rate;
        let sender = tx.clone();
        let handler = move |event: &Event<Option<PointDiagnostics>>| {
            let Some(point) = &event.value else {
                return;
            };
            let i = point.point;
            let mut values = scan.log_values(i);
            for channel in &channels {
                let cell = point
                    .channels
                    .get(channel)
                    .map(|a| a.mean)
                    .filter(|mean| mean.is_finite())
                    .map(|mean| ValueFormat::General.format_number(mean))
                    .unwrap_or_default();
                values.push(cell);
            }
            let entry = LogEntry {
                time: local_time(corrected_timestamp(point.finished, run_start, drift_rate)),
                started: point.started,
                finished: point.finished,
                file: layout.xray_image_filename(&scan, i),
                values,
            };
            if sender.send(Some(entry)).is_err() {
                error!(point = i, "logfile writer has stopped, line dropped");
            }
        };
        (handler, tx, task)
    }

    /// Collect every point of the dataset that has no logfile line yet.
    pub async fn collect_dataset(&self) -> AppResult<CollectionOutcome> {
        let Ok(_running) = self.run_lock.try_lock() else {
            return Err(DaqError::Configuration("a collection is already running".into()));
        };
        self.cancelled.store(false, Ordering::SeqCst);

        let scan = self.expansion()?;
        let layout = self.layout();
        let logfile = self.logfile(&scan);
        let first = DatasetStatus::read(&layout, &scan, &logfile)?.collection_first_i();
        let n_collect = self.n_collect(&scan, first)?;
        self.current.set_if_changed(first);
        if first >= n_collect {
            info!(first, n_collect, "nothing to collect");
            self.status.set("Collection completed".to_string());
            self.finish_series.set_if_changed(false);
            return Ok(CollectionOutcome::AlreadyComplete);
        }
        info!(
            dataset = %layout.basename,
            n = scan.n(),
            first,
            n_collect,
            passes = scan.pass_count(),
            "collection started"
        );
        self.status.set(format!("Collecting {first}..{n_collect}"));
        self.snapshot_configuration(&scan)?;

        let sequences = self.composer.queue_sequences(&scan)?;
        let spp = self.composer.sequences_per_scan_point();
        let uploaded = match self.queue.set_queue_sequences(&sequences, spp).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.suspend(0, e)),
        };
        if uploaded == UploadOutcome::Cancelled {
            self.status.set("Cancelled".to_string());
            return Ok(CollectionOutcome::Cancelled { collected: 0 });
        }
        if let Err(e) = self
            .timing
            .start_monitoring(&["image_number", "queue_active"])
            .await
        {
            self.timing.stop_monitoring();
            return Err(self.suspend(0, e));
        }

        let run_start = now();
        let tracker = PointTracker {
            scan: scan.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            current: self.current.clone(),
            finish_series: self.finish_series.clone(),
            settings: Arc::clone(&self.settings),
            first,
            state: Mutex::new(TrackerState {
                next: first,
                last_finish: run_start,
            }),
        };
        let (write_line, log_tx, log_task) = self.log_writer(&scan, &layout, logfile, run_start);
        let writer: HandlerId = self
            .diagnostics
            .finished()
            .add_handler(Delivery::Inline, write_line);
        let drivers: Vec<Arc<ScanDriver>> = scan
            .axes()
            .iter()
            .filter_map(|a| a.driver.clone())
            .collect();
        let attached: Vec<HandlerId> = drivers.iter().map(|d| d.attach(&self.collecting)).collect();

        let point_duration = Duration::from_secs_f64(self.timing.clock().hsct() * spp as f64);
        self.diagnostics.size_for(n_collect - first, point_duration);
        self.diagnostics.clear();
        self.diagnostics.start();
        self.collecting.set(true);
        for driver in &drivers {
            driver.wait_idle().await;
        }

        let runs = self.detector_runs(&scan, &layout, first);
        let result = self.run_passes(&scan, &tracker, &runs, first).await;

        // Cleanup runs on every exit; the collected part stays on disk.
        if let Err(e) = self.queue.set_queue_active(false).await {
            warn!("could not stop the sequencer: {e}");
        }
        if let Ok(reached) = self.queue.image_number().await {
            tracker.advance(reached);
        }
        for (detector, _) in &runs {
            if let Err(e) = detector.stop().await {
                warn!(detector = detector.name(), "stop failed: {e}");
            }
        }
        self.diagnostics.stop();
        self.diagnostics.finished().remove_handler(writer);
        let _ = log_tx.send(None);
        if let Err(e) = log_task.await {
            warn!("logfile writer task failed: {e}");
        }
        self.collecting.set(false);
        for driver in &drivers {
            driver.wait_idle().await;
        }
        for id in attached {
            self.collecting.remove_handler(id);
        }
        self.timing.stop_monitoring();
        if let Err(e) = self.snapshot_configuration(&scan) {
            warn!("configuration snapshot failed: {e}");
        }
        let finishing = self.finish_series.get();
        self.finish_series.set_if_changed(false);

        let collected = tracker.collected();
        let outcome = match result {
            Err(e) => return Err(self.suspend(collected, e)),
            Ok(()) if self.is_cancelled() => CollectionOutcome::Cancelled { collected },
            Ok(()) if finishing && tracker.next() < scan.n() => CollectionOutcome::SeriesFinished {
                collected,
                n_collect: tracker.next(),
            },
            Ok(()) => CollectionOutcome::Completed { collected },
        };
        info!(?outcome, "collection ended");
        self.status.set(match outcome {
            CollectionOutcome::Cancelled { .. } => "Cancelled".to_string(),
            _ => "Collection completed".to_string(),
        });
        Ok(outcome)
    }

    fn suspend(&self, collected: usize, e: DaqError) -> DaqError {
        error!(collected, "collection suspended: {e}");
        self.status.set(format!("Suspended: {e}"));
        e
    }

    async fn run_passes(
        &self,
        scan: &ScanExpansion,
        tracker: &PointTracker,
        runs: &[(Arc<dyn Detector>, DetectorRun)],
        first: usize,
    ) -> AppResult<()> {
        for (detector, run) in runs {
            self.timing
                .set_count(detector.counter_register(), first as i64)
                .await?;
            detector.start(run.clone()).await.map_err(DaqError::transport)?;
        }

        let mut current = first;
        loop {
            let n_collect = self.n_collect(scan, current)?;
            if current >= n_collect || self.is_cancelled() {
                return Ok(());
            }
            let last = scan.range_last(current, n_collect);
            self.collection_range.set_if_changed((current, last));
            info!(first = current, last, "pass started");

            self.queue.ensure_queue().await?;
            self.queue.set_first_scan_point(current).await?;
            self.queue.set_last_scan_point(last).await?;
            for (detector, _) in runs {
                self.timing
                    .set_count(detector.counter_register(), current as i64)
                    .await?;
            }

            let waiting: Vec<&Arc<ScanDriver>> = scan
                .axes()
                .iter()
                .filter(|a| a.wait)
                .filter_map(|a| a.driver.as_ref())
                .collect();
            for driver in scan.axes().iter().filter_map(|a| a.driver.as_ref()) {
                driver.on_scan_point(current);
            }
            for driver in &waiting {
                if !driver
                    .wait_until_ready(&self.cancelled, self.config.settle_timeout)
                    .await
                    && !self.is_cancelled()
                {
                    warn!(axis = %driver.kind(), "starting pass before axis settled");
                }
            }
            if self.is_cancelled() {
                return Ok(());
            }

            tracker.begin_pass(current);
            self.queue.set_queue_active(true).await?;
            loop {
                tokio::time::sleep(self.config.poll_interval).await;
                tracker.advance(self.queue.image_number().await?);
                let next = tracker.next();
                if self.is_cancelled()
                    || next >= self.n_collect(scan, next)?
                    || !self.queue.queue_active().await?
                {
                    break;
                }
            }
            self.queue.set_queue_active(false).await?;
            tracker.advance(self.queue.image_number().await?);

            let next = tracker.next();
            if next == current && !self.is_cancelled() {
                return Err(DaqError::Transport(format!(
                    "sequencer stopped without finishing point {current}"
                )));
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanExpander;

    #[test]
    fn test_n_collect_for_finish_series() {
        let scan = ScanExpander::new()
            .expand("Delay=[-10us,0,10us],Temperature=[20,25,30]", None)
            .unwrap();
        assert_eq!(n_collect_for(&scan, 5, false, "Temperature").unwrap(), 9);
        assert_eq!(n_collect_for(&scan, 5, true, "Temperature").unwrap(), 6);
        assert_eq!(n_collect_for(&scan, 6, true, "Temperature").unwrap(), 6);
        assert!(n_collect_for(&scan, 5, true, "Power").is_err());
    }

    #[test]
    fn test_corrected_timestamp() {
        assert_eq!(corrected_timestamp(100.0, 100.0, 1.95e-5), 100.0);
        let t = corrected_timestamp(1100.0, 100.0, 1e-3);
        assert!((t - 1099.0).abs() < 1e-9);
    }

    #[test]
    fn test_settings_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::settings::SettingsStore::new(dir.path().join("shared"), dir.path().join("local"));
        let table = store.table("acquisition");
        let settings = AcquisitionSettings {
            directory: dir.path().join("data"),
            basename: "lysozyme".into(),
            description: "pump-probe".into(),
            collection_order: "Delay,Laser_on,Repeat=4".into(),
            detectors: DetectorSelection::parse("xray_detector,laser_scope.C2"),
            finish_series_variable: "Delay".into(),
            override_repeat: true,
            override_repeat_count: 3,
        };
        settings.save(&table).unwrap();
        let loaded = AcquisitionSettings::load(&table, &AcquisitionSettings::default());
        assert_eq!(loaded, settings);
        assert_eq!(loaded.override_repeat(), Some(3));
    }

    #[test]
    fn test_config_defaults() {
        let config: AcquisitionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.timestamp_drift_rate, 1.95e-5);
        assert_eq!(config.defaults.basename, "dataset");
    }
}
