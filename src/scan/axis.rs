//! Scan axes.

use super::driver::ScanDriver;
use crate::error::DaqError;
use crate::format::ValueFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Recognised axis kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AxisKind {
    Delay,
    #[serde(rename = "Laser_on")]
    LaserOn,
    Temperature,
    Power,
    #[serde(rename = "Scan_Motor")]
    ScanMotor,
    Alio,
    Repeat,
}

impl AxisKind {
    pub const ALL: [AxisKind; 7] = [
        AxisKind::Delay,
        AxisKind::LaserOn,
        AxisKind::Temperature,
        AxisKind::Power,
        AxisKind::ScanMotor,
        AxisKind::Alio,
        AxisKind::Repeat,
    ];

    /// Name as written in `collection_order` and the logfile header.
    pub fn name(&self) -> &'static str {
        match self {
            AxisKind::Delay => "Delay",
            AxisKind::LaserOn => "Laser_on",
            AxisKind::Temperature => "Temperature",
            AxisKind::Power => "Power",
            AxisKind::ScanMotor => "Scan_Motor",
            AxisKind::Alio => "Alio",
            AxisKind::Repeat => "Repeat",
        }
    }

    /// Whether acquisition pauses while this axis moves, unless configured.
    pub fn default_wait(&self) -> bool {
        matches!(self, AxisKind::Temperature)
    }

    /// Axes realised by the sequence composer rather than a motor.
    pub fn is_sequence_axis(&self) -> bool {
        matches!(self, AxisKind::Delay | AxisKind::LaserOn)
    }

    /// Axes that drive a physical motor.
    pub fn has_motor(&self) -> bool {
        !self.is_sequence_axis() && *self != AxisKind::Repeat
    }

    /// Format of the value in file names.
    pub fn default_file_format(&self) -> ValueFormat {
        match self {
            AxisKind::Delay => ValueFormat::Time(3),
            AxisKind::LaserOn => ValueFormat::OnOff,
            AxisKind::Temperature => ValueFormat::Fixed(1),
            AxisKind::Power => ValueFormat::Fixed(3),
            AxisKind::ScanMotor | AxisKind::Alio => ValueFormat::Fixed(3),
            AxisKind::Repeat => ValueFormat::Integer,
        }
    }

    /// Format of the value in the logfile.
    pub fn default_log_format(&self) -> ValueFormat {
        match self {
            AxisKind::Delay => ValueFormat::Time(3),
            AxisKind::LaserOn | AxisKind::Repeat => ValueFormat::Integer,
            AxisKind::Temperature => ValueFormat::Fixed(3),
            AxisKind::Power | AxisKind::ScanMotor | AxisKind::Alio => ValueFormat::Fixed(4),
        }
    }
}

impl fmt::Display for AxisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AxisKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "");
        AxisKind::ALL
            .into_iter()
            .find(|k| k.name().to_ascii_lowercase().replace('_', "") == wanted)
            .ok_or_else(|| DaqError::Configuration(format!("unknown scan axis '{}'", s.trim())))
    }
}

/// One expanded axis.
#[derive(Clone)]
pub struct ScanAxis {
    pub kind: AxisKind,
    pub values: Vec<f64>,
    /// Number of consecutive points that share one value
    pub divider: usize,
    pub wait: bool,
    pub file_format: ValueFormat,
    pub log_format: ValueFormat,
    pub driver: Option<Arc<ScanDriver>>,
}

impl fmt::Debug for ScanAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanAxis")
            .field("kind", &self.kind)
            .field("values", &self.values)
            .field("divider", &self.divider)
            .field("wait", &self.wait)
            .finish()
    }
}

impl ScanAxis {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Index into `values` for scan point `i`.
    pub fn index_at(&self, i: usize) -> usize {
        (i / self.divider.max(1)) % self.len().max(1)
    }

    pub fn value_at(&self, i: usize) -> f64 {
        self.values.get(self.index_at(i)).copied().unwrap_or(f64::NAN)
    }

    /// Whether the axis motor is where it was last sent.
    pub fn ready(&self) -> bool {
        self.driver.as_ref().map_or(true, |d| d.is_ready())
    }

    fn repeat_label(&self, index: usize) -> String {
        let width = self.len().to_string().len();
        format!("{:0width$}", index + 1)
    }

    /// Label of the value at `index` in file names.
    pub fn file_label(&self, index: usize) -> String {
        match self.kind {
            AxisKind::Repeat => self.repeat_label(index),
            _ => self
                .file_format
                .format_number(self.values.get(index).copied().unwrap_or(f64::NAN)),
        }
    }

    /// Cell text of the value at `index` in the logfile.
    pub fn log_label(&self, index: usize) -> String {
        match self.kind {
            AxisKind::Repeat => (index + 1).to_string(),
            _ => self
                .log_format
                .format_number(self.values.get(index).copied().unwrap_or(f64::NAN)),
        }
    }

    /// File labels of every value.
    pub fn formatted_values(&self) -> Vec<String> {
        (0..self.len()).map(|k| self.file_label(k)).collect()
    }
}
