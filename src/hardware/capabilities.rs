//! Atomic Hardware Capabilities
//!
//! The controller sees devices only through small capability traits:
//!
//! - A temperature controller, a power attenuator or a sample stage implements `Motor`
//! - A beam-current monitor or a photodiode implements `Readable`
//! - An area detector or an oscilloscope implements `Detector`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn go_to(motor: &dyn Motor, target: f64, tolerance: f64) -> Result<()> {
//!     motor.set_command_value(MotorValue::Number(target)).await?;
//!     while motor.moving().await? {
//!         tokio::time::sleep(Duration::from_millis(100)).await;
//!     }
//!     let reached = motor.value().await?;
//!     anyhow::ensure!(reached.matches(&MotorValue::Number(target), tolerance));
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Value of a motor: most are numeric, some (modes, named presets) are strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MotorValue {
    Number(f64),
    Text(String),
}

impl MotorValue {
    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MotorValue::Number(x) => Some(*x),
            MotorValue::Text(_) => None,
        }
    }

    /// Whether `self` is within `tolerance` of `nominal` (strings: equality).
    pub fn matches(&self, nominal: &MotorValue, tolerance: f64) -> bool {
        match (self, nominal) {
            (MotorValue::Number(a), MotorValue::Number(b)) => {
                (a.is_nan() && b.is_nan()) || (a - b).abs() <= tolerance
            }
            (MotorValue::Text(a), MotorValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for MotorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorValue::Number(x) => write!(f, "{x}"),
            MotorValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MotorValue {
    fn from(x: f64) -> Self {
        MotorValue::Number(x)
    }
}

impl From<&str> for MotorValue {
    fn from(s: &str) -> Self {
        MotorValue::Text(s.to_string())
    }
}

/// Capability: Set-point Control
///
/// Anything with a command value and a readback: motors, temperature
/// controllers, attenuators, mode selectors.
///
/// # Contract
/// - `set_command_value` starts the change and returns without waiting
/// - `value` is the readback (may lag the command while moving)
/// - `moving` reports whether the device is still on its way
#[async_trait]
pub trait Motor: Send + Sync {
    /// Name used in logs and tables
    fn name(&self) -> &str;

    /// Send a new set point
    async fn set_command_value(&self, value: MotorValue) -> Result<()>;

    /// Last set point sent
    async fn command_value(&self) -> Result<MotorValue>;

    /// Current readback
    async fn value(&self) -> Result<MotorValue>;

    /// Whether the device is still moving
    ///
    /// # Default Implementation
    /// Devices without a motion flag report `false`.
    async fn moving(&self) -> Result<bool> {
        Ok(false)
    }

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (beam current, photodiodes,
/// temperature sensors). Used by the diagnostics recorder.
///
/// # Contract
/// - `read()` performs measurement and returns value
/// - Units are device-specific (document in implementation)
/// - Reading should be fast (<100ms typical)
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read current value
    async fn read(&self) -> Result<f64>;
}

/// What a detector needs to know to save one dataset.
#[derive(Debug, Clone)]
pub struct DetectorRun {
    /// Directory the files go to
    pub directory: PathBuf,
    /// File name of every scan point, indexed by point
    pub filenames: Vec<String>,
    /// First point of this run
    pub first_point: usize,
}

/// Capability: Triggered File Acquisition
///
/// Area detectors and oscilloscopes are triggered by the timing system and
/// save one file per scan point.
///
/// # Contract
/// - `start` arms the device; files for points `>= first_point` follow
/// - the timing-system register named by `counter_register` holds the
///   acquire counter, so the device and the controller agree on file names
/// - `stop` disarms; files already written are kept
#[async_trait]
pub trait Detector: Send + Sync {
    /// Identifier, e.g. `xray_detector` or `xray_scope`
    fn name(&self) -> &str;

    /// Timing-system register holding this device's acquire counter
    fn counter_register(&self) -> &str;

    /// Arm for a run
    async fn start(&self, run: DetectorRun) -> Result<()>;

    /// Disarm
    async fn stop(&self) -> Result<()>;
}
