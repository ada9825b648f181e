//! Mock Hardware Implementations
//!
//! Simulated devices for running the controller without a beamline.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `SimulatedMotor` - set point with a finite slew rate
//! - `DummyMotor` - stand-in for an unresolved motor path; logs and ignores writes
//! - `SimulatedReadable` - scalar readout with Gaussian-ish noise
//! - `SimulatedDetector` - writes one file per scan point as `image_number` advances

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::hardware::capabilities::{Detector, DetectorRun, Motor, MotorValue, Readable};

// =============================================================================
// SimulatedMotor
// =============================================================================

struct MotorState {
    command: MotorValue,
    value: MotorValue,
    moving: bool,
}

/// Simulated set-point device.
///
/// Numeric moves take `|distance| / speed` seconds; string values switch
/// after one settle interval.
///
/// # Example
///
/// ```rust,ignore
/// let chiller = SimulatedMotor::new("temperature", 20.0).with_speed(50.0);
/// chiller.set_command_value(MotorValue::Number(25.0)).await?; // returns immediately
/// ```
pub struct SimulatedMotor {
    name: String,
    state: Arc<RwLock<MotorState>>,
    speed: f64,
    settle: Duration,
    generation: Arc<AtomicU64>,
    commands: Arc<Mutex<Vec<MotorValue>>>,
}

impl SimulatedMotor {
    /// Create a motor at an initial value with instant moves.
    pub fn new(name: impl Into<String>, initial: impl Into<MotorValue>) -> Self {
        let initial = initial.into();
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(MotorState {
                command: initial.clone(),
                value: initial,
                moving: false,
            })),
            speed: f64::INFINITY,
            settle: Duration::ZERO,
            generation: Arc::new(AtomicU64::new(0)),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Slew rate in units per second.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Extra settle time after each move.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<MotorValue> {
        self.commands.lock().clone()
    }

    /// Readback without going through the trait.
    pub fn current(&self) -> MotorValue {
        self.state.read().value.clone()
    }
}

#[async_trait]
impl Motor for SimulatedMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_command_value(&self, target: MotorValue) -> Result<()> {
        self.commands.lock().push(target.clone());
        let travel = {
            let mut state = self.state.write();
            let travel = match (&state.value, &target) {
                (MotorValue::Number(from), MotorValue::Number(to)) if self.speed.is_finite() => {
                    Duration::from_secs_f64(((to - from).abs() / self.speed).min(3600.0))
                }
                _ => Duration::ZERO,
            };
            state.command = target.clone();
            state.moving = true;
            travel
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = travel + self.settle;
        debug!(motor = %self.name, %target, delay_ms = delay.as_millis() as u64, "moving");

        if delay.is_zero() {
            let mut state = self.state.write();
            state.value = target;
            state.moving = false;
            return Ok(());
        }
        let state = Arc::clone(&self.state);
        let latest = Arc::clone(&self.generation);
        tokio::spawn(async move {
            sleep(delay).await;
            if latest.load(Ordering::SeqCst) == generation {
                let mut state = state.write();
                state.value = target;
                state.moving = false;
            }
        });
        Ok(())
    }

    async fn command_value(&self) -> Result<MotorValue> {
        Ok(self.state.read().command.clone())
    }

    async fn value(&self) -> Result<MotorValue> {
        Ok(self.state.read().value.clone())
    }

    async fn moving(&self) -> Result<bool> {
        Ok(self.state.read().moving)
    }

    async fn stop(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write();
        state.command = state.value.clone();
        state.moving = false;
        Ok(())
    }
}

// =============================================================================
// DummyMotor
// =============================================================================

/// Motor for a path that did not resolve.
///
/// Accepts every write with a warning and reads back NaN, so a table or scan
/// referring to a missing device degrades instead of failing.
pub struct DummyMotor {
    name: String,
}

impl DummyMotor {
    /// Motor that ignores commands and reads NaN.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Motor for DummyMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_command_value(&self, value: MotorValue) -> Result<()> {
        warn!(motor = %self.name, %value, "ignoring write to dummy motor");
        Ok(())
    }

    async fn command_value(&self) -> Result<MotorValue> {
        Ok(MotorValue::Number(f64::NAN))
    }

    async fn value(&self) -> Result<MotorValue> {
        Ok(MotorValue::Number(f64::NAN))
    }
}

// =============================================================================
// SimulatedReadable
// =============================================================================

/// Scalar readout around a base value.
pub struct SimulatedReadable {
    base: RwLock<f64>,
    noise: f64,
    failing: AtomicBool,
}

impl SimulatedReadable {
    /// Readings within `noise` of `base`.
    pub fn new(base: f64, noise: f64) -> Self {
        Self {
            base: RwLock::new(base),
            noise,
            failing: AtomicBool::new(false),
        }
    }

    /// Shift the value readings are spread around.
    pub fn set_base(&self, base: f64) {
        *self.base.write() = base;
    }

    /// Make reads fail (simulates a disconnected sensor).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Readable for SimulatedReadable {
    async fn read(&self) -> Result<f64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("sensor not responding"));
        }
        let base = *self.base.read();
        if self.noise == 0.0 {
            return Ok(base);
        }
        let jitter: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Ok(base + jitter * self.noise)
    }
}

// =============================================================================
// SimulatedDetector
// =============================================================================

/// Detector that writes a small file per scan point.
///
/// It follows the timing system's `image_number`: when the counter moves from
/// `k` to `k + 1`, the file of point `k` is written.
pub struct SimulatedDetector {
    name: String,
    counter_register: String,
    image_number: watch::Receiver<i64>,
    skip: Mutex<BTreeSet<usize>>,
    task: Mutex<Option<JoinHandle<()>>>,
    written: Arc<AtomicU64>,
}

impl SimulatedDetector {
    pub fn new(
        name: impl Into<String>,
        counter_register: impl Into<String>,
        image_number: watch::Receiver<i64>,
    ) -> Self {
        Self {
            name: name.into(),
            counter_register: counter_register.into(),
            image_number,
            skip: Mutex::new(BTreeSet::new()),
            task: Mutex::new(None),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Do not write the file of these points (simulates lost images).
    pub fn skip_points(&self, points: impl IntoIterator<Item = usize>) {
        self.skip.lock().extend(points);
    }

    /// Files written so far.
    pub fn files_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for SimulatedDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn counter_register(&self) -> &str {
        &self.counter_register
    }

    async fn start(&self, run: DetectorRun) -> Result<()> {
        tokio::fs::create_dir_all(&run.directory).await?;
        let mut rx = self.image_number.clone();
        let skip = self.skip.lock().clone();
        let written = Arc::clone(&self.written);
        let name = self.name.clone();
        let mut next = (*rx.borrow_and_update()).max(0) as usize;
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let reached = (*rx.borrow_and_update()).max(0) as usize;
                if reached < next {
                    next = reached;
                    continue;
                }
                for point in next..reached {
                    if point < run.first_point || skip.contains(&point) {
                        continue;
                    }
                    let Some(filename) = run.filenames.get(point) else {
                        continue;
                    };
                    let path = run.directory.join(filename);
                    let contents = format!("{name} point {point}\n");
                    match tokio::fs::write(&path, contents).await {
                        Ok(()) => {
                            written.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => warn!(detector = %name, path = %path.display(), "write failed: {e}"),
                    }
                }
                next = reached;
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Let the task write the file of the point that just finished.
        sleep(Duration::from_millis(10)).await;
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}
