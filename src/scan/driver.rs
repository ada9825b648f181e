//! Scan drivers.
//!
//! One driver per scanned quantity. A driver knows its values, the period
//! (`divider`) at which its value changes along the scan, and what to move
//! when the index changes: a motor, or nothing at all for the sequence axes
//! (Delay, Laser_on) whose values end up in the composed sequences.
//!
//! Moves are fire-and-forget. The driver publishes `slewing` so the
//! acquisition loop can decide whether to hold the sequencer.

use super::axis::AxisKind;
use super::expression::expand_scan_points;
use crate::error::{AppResult, DaqError};
use crate::format::ValueFormat;
use crate::hardware::{Motor, MotorValue};
use crate::observable::{Delivery, HandlerId, Monitored};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Persistent settings of one scan axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub kind: AxisKind,
    /// Values string, see [`expand_scan_points`]
    #[serde(default)]
    pub values: String,
    /// Pause acquisition while this axis moves (default depends on the kind)
    #[serde(default)]
    pub wait: Option<bool>,
    /// Restore the return value when a dataset ends
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Motor path, e.g. `temperature.value`
    #[serde(default)]
    pub motor: Option<String>,
    #[serde(default)]
    pub tolerance: f64,
    #[serde(default)]
    pub file_format: Option<String>,
    #[serde(default)]
    pub log_format: Option<String>,
    /// Position to restore; the position at dataset start when unset
    #[serde(default)]
    pub return_value: Option<f64>,
    #[serde(with = "humantime_serde", default = "default_settle_timeout")]
    pub settle_timeout: Duration,
}

fn default_enabled() -> bool {
    true
}

fn default_settle_timeout() -> Duration {
    Duration::from_secs(60)
}

impl AxisConfig {
    /// Defaults for `kind` with the given values string.
    pub fn new(kind: AxisKind, values: impl Into<String>) -> Self {
        Self {
            kind,
            values: values.into(),
            wait: None,
            enabled: true,
            motor: None,
            tolerance: 0.0,
            file_format: None,
            log_format: None,
            return_value: None,
            settle_timeout: default_settle_timeout(),
        }
    }
}

/// What a driver moves.
#[derive(Clone)]
pub enum DriverTarget {
    Motor(Arc<dyn Motor>),
    /// Realised by the sequence composer
    Sequence,
}

/// Drives one axis as the scan advances.
pub struct ScanDriver {
    kind: AxisKind,
    config: RwLock<AxisConfig>,
    /// Parsed from the configured values string
    configured: RwLock<Vec<f64>>,
    /// Values of the current expansion
    values: RwLock<Vec<f64>>,
    target: DriverTarget,
    divider: AtomicUsize,
    values_index: Monitored<Option<usize>>,
    slewing: Monitored<bool>,
    return_value: RwLock<Option<MotorValue>>,
    generation: AtomicU64,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ScanDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanDriver")
            .field("kind", &self.kind)
            .field("values", &*self.values.read())
            .field("divider", &self.divider())
            .field("values_index", &self.values_index.get())
            .field("slewing", &self.slewing.get())
            .finish()
    }
}

impl ScanDriver {
    /// Create a driver; moves start when `values_index` changes.
    pub fn new(config: AxisConfig, target: DriverTarget) -> AppResult<Arc<Self>> {
        let kind = config.kind;
        match (&target, kind.has_motor()) {
            (DriverTarget::Sequence, true) => {
                return Err(DaqError::Configuration(format!(
                    "scan axis {kind} needs a motor"
                )))
            }
            (DriverTarget::Motor(_), false) => {
                return Err(DaqError::Configuration(format!(
                    "scan axis {kind} does not drive a motor"
                )))
            }
            _ => {}
        }
        let values = parse_values(&config)?;
        let object = format!("scan.{}", kind.name().to_ascii_lowercase());

        Ok(Arc::new_cyclic(|weak: &Weak<ScanDriver>| {
            let values_index = Monitored::new(object.clone(), "values_index", None);
            let weak = weak.clone();
            values_index.add_handler(Delivery::Inline, move |event| {
                if let (Some(driver), Some(index)) = (weak.upgrade(), event.value) {
                    driver.start_move(index);
                }
            });
            ScanDriver {
                kind,
                config: RwLock::new(config),
                configured: RwLock::new(values.clone()),
                values: RwLock::new(values),
                target,
                divider: AtomicUsize::new(1),
                values_index,
                slewing: Monitored::new(object, "slewing", false),
                return_value: RwLock::new(None),
                generation: AtomicU64::new(0),
                pending: Mutex::new(Vec::new()),
            }
        }))
    }

    pub fn kind(&self) -> AxisKind {
        self.kind
    }

    pub fn config(&self) -> AxisConfig {
        self.config.read().clone()
    }

    /// Replace the settings; the values string is re-parsed first.
    pub fn configure(&self, config: AxisConfig) -> AppResult<()> {
        if config.kind != self.kind {
            return Err(DaqError::Configuration(format!(
                "cannot reconfigure {} driver as {}",
                self.kind, config.kind
            )));
        }
        let values = parse_values(&config)?;
        *self.configured.write() = values.clone();
        *self.values.write() = values;
        *self.config.write() = config;
        self.values_index.set_if_changed(None);
        Ok(())
    }

    /// Values from the axis configuration.
    pub fn values(&self) -> Vec<f64> {
        self.configured.read().clone()
    }

    /// Values the driver is following in the current expansion.
    pub fn scan_values(&self) -> Vec<f64> {
        self.values.read().clone()
    }

    /// Whether acquisition holds while this axis moves.
    pub fn wait(&self) -> bool {
        if self.kind.is_sequence_axis() {
            return false;
        }
        self.config.read().wait.unwrap_or_else(|| self.kind.default_wait())
    }

    pub fn enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn tolerance(&self) -> f64 {
        self.config.read().tolerance
    }

    pub fn file_format(&self) -> AppResult<ValueFormat> {
        match &self.config.read().file_format {
            Some(text) => text.parse(),
            None => Ok(self.kind.default_file_format()),
        }
    }

    pub fn log_format(&self) -> AppResult<ValueFormat> {
        match &self.config.read().log_format {
            Some(text) => text.parse(),
            None => Ok(self.kind.default_log_format()),
        }
    }

    pub fn motor(&self) -> Option<&Arc<dyn Motor>> {
        match &self.target {
            DriverTarget::Motor(motor) => Some(motor),
            DriverTarget::Sequence => None,
        }
    }

    /// Number of consecutive scan points sharing one value.
    pub fn divider(&self) -> usize {
        self.divider.load(Ordering::SeqCst)
    }

    pub fn set_divider(&self, divider: usize) {
        self.divider.store(divider.max(1), Ordering::SeqCst);
    }

    /// Values of the current expansion. Inline values in a collection order
    /// apply to that expansion only; [`ScanDriver::values`] keeps returning
    /// the configured ones.
    pub fn set_scan_values(&self, values: Vec<f64>) {
        let mut current = self.values.write();
        if *current != values {
            *current = values;
            self.values_index.set_if_changed(None);
        }
    }

    pub fn values_index(&self) -> Option<usize> {
        self.values_index.get()
    }

    pub fn values_index_monitor(&self) -> &Monitored<Option<usize>> {
        &self.values_index
    }

    pub fn slewing_monitor(&self) -> &Monitored<bool> {
        &self.slewing
    }

    pub fn return_value(&self) -> Option<MotorValue> {
        self.return_value.read().clone()
    }

    /// Follow the scan to point `i`.
    pub fn on_scan_point(&self, i: usize) {
        let len = self.values.read().len();
        if len == 0 {
            return;
        }
        let index = (i / self.divider()) % len;
        self.values_index.set_if_changed(Some(index));
    }

    /// Not moving towards a new value.
    pub fn is_ready(&self) -> bool {
        !self.slewing.get()
    }

    /// Whether the readback matches the value at the current index.
    pub async fn in_position(&self) -> bool {
        let Some(motor) = self.motor() else {
            return true;
        };
        let Some(nominal) = self.nominal() else {
            return true;
        };
        match motor.value().await {
            Ok(value) => value.matches(&nominal, self.tolerance()),
            Err(e) => {
                debug!(axis = %self.kind, "readback failed: {e}");
                false
            }
        }
    }

    /// Wait until the axis has settled, the timeout expires or `cancel` is set.
    ///
    /// Returns whether the axis reached its value.
    pub async fn wait_until_ready(&self, cancel: &AtomicBool, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            if self.is_ready() && self.in_position().await {
                return true;
            }
            if started.elapsed() >= timeout {
                warn!(axis = %self.kind, ?timeout, "axis did not settle");
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn nominal(&self) -> Option<MotorValue> {
        let index = self.values_index.get()?;
        self.values.read().get(index).copied().map(MotorValue::Number)
    }

    fn start_move(self: &Arc<Self>, index: usize) {
        let Some(motor) = self.motor().cloned() else {
            return;
        };
        let Some(value) = self.values.read().get(index).copied() else {
            return;
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.slewing.set_if_changed(true);

        let Ok(runtime) = Handle::try_current() else {
            warn!(axis = %self.kind, index, "no async runtime, move skipped");
            self.slewing.set_if_changed(false);
            return;
        };
        let driver = Arc::clone(self);
        let handle = runtime.spawn(async move {
            debug!(axis = %driver.kind, index, value, "moving");
            if let Err(e) = motor.set_command_value(MotorValue::Number(value)).await {
                warn!(axis = %driver.kind, value, "move failed: {e}");
            } else {
                driver.settle(&*motor, generation).await;
            }
            if driver.generation.load(Ordering::SeqCst) == generation {
                driver.slewing.set_if_changed(false);
            }
        });
        self.track(handle);
    }

    async fn settle(&self, motor: &dyn Motor, generation: u64) {
        let timeout = self.config.read().settle_timeout;
        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let moving = motor.moving().await.unwrap_or(false);
            if !moving && self.in_position().await {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        warn!(axis = %self.kind, ?timeout, "motor still not in position");
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Remember where to go back to when the dataset ends.
    pub async fn capture_return_value(&self) {
        let Some(motor) = self.motor() else {
            return;
        };
        let configured = self.config.read().return_value;
        let value = match configured {
            Some(value) => Some(MotorValue::Number(value)),
            None => motor.value().await.ok(),
        };
        debug!(axis = %self.kind, ?value, "return value captured");
        *self.return_value.write() = value;
    }

    /// Send the motor back to the return value (enabled drivers only).
    pub async fn restore(&self) -> AppResult<()> {
        let Some(motor) = self.motor() else {
            return Ok(());
        };
        if !self.enabled() {
            return Ok(());
        }
        let Some(value) = self.return_value() else {
            return Ok(());
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.values_index.set_if_changed(None);
        info!(axis = %self.kind, %value, "returning to start position");
        motor
            .set_command_value(value)
            .await
            .map_err(DaqError::transport)?;
        self.slewing.set_if_changed(false);
        Ok(())
    }

    /// Follow a dataset's collecting flag: capture on start, restore on end.
    pub fn attach(self: &Arc<Self>, collecting: &Monitored<bool>) -> HandlerId {
        let weak = Arc::downgrade(self);
        collecting.add_handler(Delivery::Inline, move |event| {
            let Some(driver) = weak.upgrade() else {
                return;
            };
            let Ok(runtime) = Handle::try_current() else {
                warn!(axis = %driver.kind, "no async runtime, collecting change ignored");
                return;
            };
            let started = event.value;
            let task_driver = Arc::clone(&driver);
            let handle = runtime.spawn(async move {
                if started {
                    task_driver.capture_return_value().await;
                } else if let Err(e) = task_driver.restore().await {
                    warn!(axis = %task_driver.kind, "restore failed: {e}");
                }
            });
            driver.track(handle);
        })
    }

    /// Wait for every move and restore started so far.
    pub async fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = self.pending.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(axis = %self.kind, "axis task failed: {e}");
            }
        }
    }
}

fn parse_values(config: &AxisConfig) -> AppResult<Vec<f64>> {
    if config.values.trim().is_empty() {
        return Ok(Vec::new());
    }
    expand_scan_points(&config.values)
}
