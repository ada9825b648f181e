//! Timing-system registers.
//!
//! A register is an integer cell in the FPGA. Its semantic value is
//! `count * stepsize * sign + offset`, where the stepsize follows a clock
//! period (`timebase`) so that changing the clock rescales every register.

use super::clock::Clock;
use crate::error::{AppResult, DaqError};
use crate::observable::Monitored;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Register map shipped with the crate.
pub const DEFAULT_REGISTERS: &str = include_str!("../../config/registers.toml");

/// Number of output channels on the timing system.
pub const CHANNEL_COUNT: usize = 24;

const CHANNEL_BASE_ADDRESS: u32 = 0x0200;

/// Clock period that one count of a register corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timebase {
    /// Dimensionless counter (stepsize 1)
    #[default]
    Count,
    /// Base clock tick
    Bct,
    /// Single-bunch period
    P0t,
    /// High-speed chopper period
    Hsct,
    /// Heat-load chopper period
    Hlct,
    /// Laser period
    Nslt,
}

impl Timebase {
    fn period(&self, clock: &Clock) -> f64 {
        match self {
            Timebase::Count => 1.0,
            Timebase::Bct => clock.bct(),
            Timebase::P0t => clock.p0t(),
            Timebase::Hsct => clock.hsct(),
            Timebase::Hlct => clock.hlct(),
            Timebase::Nslt => clock.nslt(),
        }
    }
}

fn default_width() -> u32 {
    32
}
fn default_scale() -> f64 {
    1.0
}
fn default_sign() -> i32 {
    1
}

/// One entry of the register description file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub address: u32,
    #[serde(default)]
    pub bit_offset: u32,
    #[serde(default = "default_width")]
    pub bit_width: u32,
    #[serde(default)]
    pub timebase: Timebase,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Fixed stepsize in seconds; overrides `timebase * scale`
    #[serde(default)]
    pub stepsize: Option<f64>,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_sign")]
    pub sign: i32,
    #[serde(default)]
    pub min_count: Option<i64>,
    #[serde(default)]
    pub max_count: Option<i64>,
}

impl RegisterSpec {
    fn simple(name: String, address: u32, bit_width: u32, timebase: Timebase) -> Self {
        Self {
            name,
            description: String::new(),
            address,
            bit_offset: 0,
            bit_width,
            timebase,
            scale: 1.0,
            stepsize: None,
            offset: 0.0,
            sign: 1,
            min_count: None,
            max_count: None,
        }
    }
}

/// The register description file: a list of `[[register]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterDescription {
    #[serde(rename = "register", default)]
    pub registers: Vec<RegisterSpec>,
}

impl RegisterDescription {
    /// Parse a description from TOML text.
    pub fn from_toml(text: &str) -> AppResult<Self> {
        let description: Self = toml::from_str(text)
            .map_err(|e| DaqError::Configuration(format!("register description: {e}")))?;
        description.validate()?;
        Ok(description)
    }

    /// Load a description file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// The built-in register map.
    pub fn builtin() -> AppResult<Self> {
        Self::from_toml(DEFAULT_REGISTERS)
    }

    /// Append the per-channel registers for all output channels.
    pub fn with_channel_registers(mut self) -> Self {
        for index in 0..CHANNEL_COUNT {
            let n = index + 1;
            let base = CHANNEL_BASE_ADDRESS + 0x10 * index as u32;
            self.registers.extend([
                RegisterSpec::simple(format!("ch{n}_delay"), base, 24, Timebase::Bct),
                RegisterSpec::simple(format!("ch{n}_pulse"), base + 4, 24, Timebase::Bct),
                RegisterSpec::simple(format!("ch{n}_enable"), base + 8, 1, Timebase::Count),
                RegisterSpec::simple(format!("ch{n}_override"), base + 12, 1, Timebase::Count),
                RegisterSpec {
                    bit_offset: 1,
                    ..RegisterSpec::simple(format!("ch{n}_state"), base + 12, 1, Timebase::Count)
                },
            ]);
        }
        self
    }

    fn validate(&self) -> AppResult<()> {
        let mut names = BTreeSet::new();
        for spec in &self.registers {
            if !names.insert(spec.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "register '{}' defined twice",
                    spec.name
                )));
            }
            if spec.bit_width == 0 || spec.bit_width > 64 {
                return Err(DaqError::Configuration(format!(
                    "register '{}': bit width {} not in 1..=64",
                    spec.name, spec.bit_width
                )));
            }
            if spec.sign != 1 && spec.sign != -1 {
                return Err(DaqError::Configuration(format!(
                    "register '{}': sign must be +1 or -1",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// A register with its cached count.
#[derive(Debug, Clone)]
pub struct Register {
    spec: RegisterSpec,
    clock: Arc<Clock>,
    count: Monitored<i64>,
}

impl Register {
    pub(crate) fn new(spec: RegisterSpec, clock: Arc<Clock>) -> Self {
        let count = Monitored::new("timing_system", format!("registers.{}.count", spec.name), 0);
        Self { spec, clock, count }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &RegisterSpec {
        &self.spec
    }

    /// Last known count.
    pub fn count(&self) -> i64 {
        self.count.get()
    }

    /// Observable count.
    pub fn count_monitor(&self) -> &Monitored<i64> {
        &self.count
    }

    /// Record a count read from (or written to) the hardware.
    pub(crate) fn update_count(&self, count: i64) {
        self.count.set_if_changed(count);
    }

    /// Seconds (or units) per count.
    pub fn stepsize(&self) -> f64 {
        self.spec
            .stepsize
            .unwrap_or_else(|| self.spec.timebase.period(&self.clock) * self.spec.scale)
    }

    pub fn offset(&self) -> f64 {
        self.spec.offset
    }

    pub fn sign(&self) -> f64 {
        f64::from(self.spec.sign)
    }

    pub fn min_count(&self) -> i64 {
        self.spec.min_count.unwrap_or(0)
    }

    pub fn max_count(&self) -> i64 {
        self.spec.max_count.unwrap_or(if self.spec.bit_width >= 63 {
            i64::MAX
        } else {
            (1_i64 << self.spec.bit_width) - 1
        })
    }

    /// `count * stepsize * sign + offset`
    pub fn value_from_count(&self, count: i64) -> f64 {
        count as f64 * self.stepsize() * self.sign() + self.offset()
    }

    /// Inverse of [`Register::value_from_count`], rounded to the nearest count.
    pub fn count_from_value(&self, value: f64) -> AppResult<i64> {
        let count = ((value - self.offset()) / self.sign() / self.stepsize()).round();
        if count.is_nan() {
            return Err(DaqError::NotANumber {
                register: self.spec.name.clone(),
            });
        }
        Ok(count as i64)
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value_from_count(self.count())
    }

    /// `count * stepsize`, without sign and offset.
    pub fn dial(&self) -> f64 {
        self.count() as f64 * self.stepsize()
    }

    pub fn min_value(&self) -> f64 {
        self.value_from_count(self.min_count())
            .min(self.value_from_count(self.max_count()))
    }

    pub fn max_value(&self) -> f64 {
        self.value_from_count(self.min_count())
            .max(self.value_from_count(self.max_count()))
    }

    /// Refuse counts outside `[min_count, max_count]`.
    pub fn check_count(&self, count: i64) -> AppResult<()> {
        let (min, max) = (self.min_count(), self.max_count());
        if count < min || count > max {
            return Err(DaqError::OutOfRange {
                register: self.spec.name.clone(),
                count,
                min,
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::clock::ClockConfig;

    fn clock() -> Arc<Clock> {
        Arc::new(Clock::new(&ClockConfig::default()).unwrap())
    }

    #[test]
    fn test_builtin_description() {
        let description = RegisterDescription::builtin().unwrap().with_channel_registers();
        let names: Vec<&str> = description.registers.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"image_number"));
        assert!(names.contains(&"p0fd2"));
        assert!(names.contains(&"ch24_state"));
        assert_eq!(
            description.registers.iter().filter(|r| r.name.starts_with("ch")).count(),
            5 * CHANNEL_COUNT
        );
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let text = r#"
            [[register]]
            name = "a"
            address = 1
            [[register]]
            name = "a"
            address = 2
        "#;
        assert!(RegisterDescription::from_toml(text).is_err());
    }

    #[test]
    fn test_value_mapping() {
        let spec = RegisterSpec {
            offset: 1e-6,
            sign: -1,
            ..RegisterSpec::simple("psod".into(), 0, 8, Timebase::Bct)
        };
        let register = Register::new(spec, clock());
        register.update_count(10);
        let bct = register.stepsize();
        assert!((register.value() - (-10.0 * bct + 1e-6)).abs() < 1e-18);
        assert!((register.dial() - 10.0 * bct).abs() < 1e-18);
        assert_eq!(register.max_count(), 255);
        assert!(register.min_value() < register.max_value());
    }

    #[test]
    fn test_count_value_round_trip() {
        let spec = RegisterSpec::simple("hlcnd".into(), 0, 24, Timebase::Bct);
        let register = Register::new(spec, clock());
        let step = register.stepsize();
        let (lo, hi) = (register.min_value(), register.max_value());
        for k in 0..50 {
            let v = lo + (hi - lo) * (k as f64 / 49.0) * 0.999_37;
            let back = register.value_from_count(register.count_from_value(v).unwrap());
            assert!((back - v).abs() <= step, "{v} -> {back}");
        }
    }

    #[test]
    fn test_range_and_nan() {
        let spec = RegisterSpec::simple("p0fd2".into(), 0, 2, Timebase::Bct);
        let register = Register::new(spec, clock());
        assert!(register.check_count(3).is_ok());
        assert!(matches!(
            register.check_count(4),
            Err(DaqError::OutOfRange { count: 4, max: 3, .. })
        ));
        assert!(matches!(
            register.count_from_value(f64::NAN),
            Err(DaqError::NotANumber { .. })
        ));
    }
}
