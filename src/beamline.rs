//! Simulated beamline.
//!
//! Assembles a complete acquisition controller from a [`ControllerConfig`]:
//! the FPGA simulator as timing transport, one simulated motor per motor
//! axis, simulated detectors and diagnostics channels.

use crate::acquisition::AcquisitionController;
use crate::channels::ChannelBank;
use crate::config::ControllerConfig;
use crate::diagnostics::DiagnosticsRecorder;
use crate::error::{AppResult, DaqError};
use crate::hardware::{Detector, Motor, MotorValue, Readable, SimulatedDetector, SimulatedMotor, SimulatedReadable};
use crate::scan::{expand_scan_points, AxisKind, DriverTarget, ScanDriver, ScanExpander};
use crate::sequence::{SequenceComposer, SequencerQueue};
use crate::tables::{ConfigTable, MotorRegistry, TableSet};
use crate::timing::{Clock, SimulatedFpga, TimingSystem};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Detector name, acquire counter register.
pub const DETECTORS: [(&str, &str); 3] = [
    ("xray_detector", "xdet_acq_count"),
    ("xray_scope", "xosct_acq_count"),
    ("laser_scope", "losct_acq_count"),
];

/// Extension of configuration table files.
pub const TABLE_EXTENSION: &str = "txt";

/// Every component of a simulated beamline.
pub struct Beamline {
    /// Configuration the beamline was built from
    pub config: ControllerConfig,
    /// In-memory FPGA behind the timing transport
    pub fpga: Arc<SimulatedFpga>,
    /// Register map and clock
    pub timing: Arc<TimingSystem>,
    /// Timing channels by number and mnemonic
    pub channels: Arc<ChannelBank>,
    /// Builds the sequences of a scan
    pub composer: Arc<SequenceComposer>,
    /// Loads sequences and positions the queue
    pub queue: Arc<SequencerQueue>,
    /// Motors by `component.attribute` path
    pub motors: Arc<MotorRegistry>,
    /// Configuration tables shared with the controller
    pub tables: Arc<RwLock<TableSet>>,
    /// Beam diagnostics sampled during collection
    pub diagnostics: Arc<DiagnosticsRecorder>,
    /// Dataset collection
    pub controller: Arc<AcquisitionController>,
    simulated_motors: BTreeMap<String, Arc<SimulatedMotor>>,
    detectors: Vec<Arc<SimulatedDetector>>,
}

impl Beamline {
    /// Build and start the simulator. Must run inside a tokio runtime.
    pub fn simulated(config: ControllerConfig) -> AppResult<Self> {
        config.validate().map_err(DaqError::Configuration)?;

        let fpga = SimulatedFpga::new(config.timing.simulator_period);
        let timing = Arc::new(TimingSystem::new(
            config.timing.domain.clone(),
            Clock::new(&config.timing.clock)?,
            config.timing.register_description()?,
            fpga.clone(),
        )?
        .with_retry_policy(config.timing.retry));
        let channels = Arc::new(ChannelBank::new(&config.channels, &timing)?);
        let mode = config.method(None).cloned().unwrap_or_default();
        let composer = Arc::new(SequenceComposer::new(
            Arc::clone(&timing),
            Arc::clone(&channels),
            mode,
        )?);
        let queue = Arc::new(SequencerQueue::new(Arc::clone(&timing), config.timing.retry));

        let motors = Arc::new(MotorRegistry::new());
        let mut simulated_motors = BTreeMap::new();
        let mut expander = ScanExpander::new();
        for axis in &config.axes {
            let target = if axis.kind == AxisKind::Repeat {
                continue;
            } else if axis.kind.has_motor() {
                let path = axis.motor.clone().ok_or_else(|| {
                    DaqError::Configuration(format!("scan axis {} needs a motor path", axis.kind))
                })?;
                let initial = expand_scan_points(&axis.values)?
                    .first()
                    .copied()
                    .unwrap_or(0.0);
                let motor = Arc::new(SimulatedMotor::new(path.clone(), initial));
                motors.register(path.clone(), motor.clone() as Arc<dyn Motor>);
                simulated_motors.insert(path, Arc::clone(&motor));
                DriverTarget::Motor(motor)
            } else {
                DriverTarget::Sequence
            };
            expander.insert(ScanDriver::new(axis.clone(), target)?);
        }

        let readables: Vec<(String, Arc<dyn Readable>)> = config
            .diagnostics
            .channels
            .iter()
            .map(|name| {
                let readable: Arc<dyn Readable> = Arc::new(SimulatedReadable::new(100.0, 0.5));
                (name.clone(), readable)
            })
            .collect();
        let diagnostics = Arc::new(DiagnosticsRecorder::new(
            readables,
            config.diagnostics.interval,
            config.diagnostics.min_capacity,
        ));

        let image_number = timing.register("image_number")?.count_monitor().subscribe();
        let detectors: Vec<Arc<SimulatedDetector>> = DETECTORS
            .iter()
            .map(|(name, counter)| Arc::new(SimulatedDetector::new(*name, *counter, image_number.clone())))
            .collect();

        let tables = Arc::new(RwLock::new(TableSet::new(Arc::clone(&motors))));
        let mut controller = AcquisitionController::new(
            config.acquisition.clone(),
            Arc::clone(&composer),
            Arc::clone(&queue),
            expander,
            Arc::clone(&diagnostics),
        )
        .with_tables(Arc::clone(&tables));
        for detector in &detectors {
            controller = controller.with_detector(detector.clone() as Arc<dyn Detector>);
        }

        fpga.start();
        info!(
            domain = %config.timing.domain,
            axes = config.axes.len(),
            motors = simulated_motors.len(),
            "simulated beamline ready"
        );
        Ok(Self {
            config,
            fpga,
            timing,
            channels,
            composer,
            queue,
            motors,
            tables,
            diagnostics,
            controller: Arc::new(controller),
            simulated_motors,
            detectors,
        })
    }

    /// Simulated motor at a motor path.
    pub fn motor(&self, path: &str) -> Option<Arc<SimulatedMotor>> {
        self.simulated_motors.get(path).cloned()
    }

    /// Add a simulated motor, for table columns that are not scan axes.
    pub fn add_motor(&mut self, path: &str, initial: impl Into<MotorValue>) -> Arc<SimulatedMotor> {
        let motor = Arc::new(SimulatedMotor::new(path, initial));
        self.motors.register(path, motor.clone() as Arc<dyn Motor>);
        self.simulated_motors.insert(path.to_string(), Arc::clone(&motor));
        motor
    }

    /// Simulated detector by name, e.g. `xray_detector`.
    pub fn detector(&self, name: &str) -> Option<Arc<SimulatedDetector>> {
        self.detectors.iter().find(|d| d.name() == name).cloned()
    }

    /// Load every table file in `directory`. Returns how many were loaded.
    ///
    /// A table that fails to load or would close a cycle is skipped.
    pub fn load_tables(&self, directory: &Path) -> AppResult<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == TABLE_EXTENSION))
            .collect();
        paths.sort();

        let mut tables = self.tables.write();
        let mut loaded = 0;
        for path in paths {
            match ConfigTable::load(&path).and_then(|table| tables.insert(table)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), "table skipped: {e}"),
            }
        }
        Ok(loaded)
    }
}
