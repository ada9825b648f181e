//! Controller Configuration using Figment
//!
//! Configuration is layered:
//! 1. built-in defaults
//! 2. `config/beamline.toml` (or the file given to [`ControllerConfig::load_from`])
//! 3. environment variables prefixed `BEAMLINE_DAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use beamline_daq::config::ControllerConfig;
//!
//! let config = ControllerConfig::load()?;
//! config.validate()?;
//! println!("timing domain: {}", config.timing.domain);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! `BEAMLINE_DAQ_APPLICATION__LOG_LEVEL=debug` overrides `application.log_level`.

use crate::acquisition::AcquisitionConfig;
use crate::channels::{ChannelConfig, TimingReference};
use crate::error::AppResult;
use crate::logging::OutputFormat;
use crate::scan::{AxisConfig, AxisKind};
use crate::sequence::SequenceMode;
use crate::settings::SettingsStore;
use crate::timing::{ClockConfig, RegisterDescription, RetryPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config/beamline.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BEAMLINE_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    /// Timing-system output channels
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    /// Scan drivers
    #[serde(default = "default_axes")]
    pub axes: Vec<AxisConfig>,
    /// Named sequence modes; the first one is used unless another is selected
    #[serde(default = "default_methods")]
    pub methods: Vec<SequenceMode>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Settings store location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_settings_root")]
    pub root: PathBuf,
    /// Target of `local.` tables; the per-user config directory when unset
    #[serde(default)]
    pub local: Option<PathBuf>,
    /// How often a settings file is checked for outside changes
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,
}

/// Timing system connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// PV prefix, e.g. `BIOCARS`
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Register description; the built-in map when unset
    #[serde(default)]
    pub register_file: Option<PathBuf>,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Sequence period of the simulator (real hardware: one hsct)
    #[serde(with = "humantime_serde", default = "default_simulator_period")]
    pub simulator_period: Duration,
}

/// Diagnostics sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Logged channels, one logfile column each
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_diagnostics_interval")]
    pub interval: Duration,
    #[serde(default = "default_min_capacity")]
    pub min_capacity: usize,
}

// Default value functions
fn default_name() -> String {
    "beamline-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_settings_root() -> PathBuf {
    PathBuf::from("settings")
}

fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_domain() -> String {
    "BIOCARS".to_string()
}

fn default_simulator_period() -> Duration {
    Duration::from_millis(1)
}

fn default_diagnostics_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_min_capacity() -> usize {
    1000
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig {
            mnemonic: "xdet".into(),
            description: "X-ray detector trigger".into(),
            pp_enabled: true,
            pulse_length: 1e-6,
            ..ChannelConfig::unused(3)
        },
        ChannelConfig {
            mnemonic: "pst".into(),
            description: "Picosecond laser trigger".into(),
            pp_enabled: true,
            reference: TimingReference::Laser,
            pulse_length: 1e-6,
            ..ChannelConfig::unused(5)
        },
        ChannelConfig {
            mnemonic: "xosct".into(),
            description: "X-ray scope trigger".into(),
            pp_enabled: true,
            pulse_length: 1e-6,
            ..ChannelConfig::unused(9)
        },
        ChannelConfig {
            mnemonic: "losct".into(),
            description: "Laser scope trigger".into(),
            pp_enabled: true,
            reference: TimingReference::Laser,
            pulse_length: 1e-6,
            ..ChannelConfig::unused(10)
        },
    ]
}

fn default_axes() -> Vec<AxisConfig> {
    vec![
        AxisConfig::new(AxisKind::Delay, "[-10us, 0, 10us]"),
        AxisConfig::new(AxisKind::LaserOn, "[0, 1]"),
        AxisConfig {
            motor: Some("temperature.value".into()),
            tolerance: 0.1,
            ..AxisConfig::new(AxisKind::Temperature, "[20, 25, 30]")
        },
    ]
}

fn default_methods() -> Vec<SequenceMode> {
    vec![SequenceMode::default()]
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            root: default_settings_root(),
            local: None,
            check_interval: default_check_interval(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            register_file: None,
            clock: ClockConfig::default(),
            retry: RetryPolicy::default(),
            simulator_period: default_simulator_period(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            interval: default_diagnostics_interval(),
            min_capacity: default_min_capacity(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            settings: SettingsConfig::default(),
            timing: TimingConfig::default(),
            acquisition: AcquisitionConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            channels: default_channels(),
            axes: default_axes(),
            methods: default_methods(),
        }
    }
}

impl TimingConfig {
    /// Register map with the per-channel registers added.
    pub fn register_description(&self) -> AppResult<RegisterDescription> {
        let description = match &self.register_file {
            Some(path) => RegisterDescription::load(path)?,
            None => RegisterDescription::builtin()?,
        };
        Ok(description.with_channel_registers())
    }
}

impl SettingsConfig {
    /// Open the settings store.
    pub fn store(&self, application: &str) -> SettingsStore {
        let store = match &self.local {
            Some(local) => SettingsStore::new(&self.root, local),
            None => SettingsStore::with_user_local(&self.root, application),
        };
        store.with_check_interval(self.check_interval)
    }
}

impl ControllerConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path; a missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack, for callers that merge more sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ControllerConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let mut mnemonics = HashSet::new();
        let mut numbers = HashSet::new();
        for channel in &self.channels {
            if !numbers.insert(channel.number) {
                return Err(format!("Duplicate channel number: {}", channel.number));
            }
            if !channel.mnemonic.is_empty() && !mnemonics.insert(channel.mnemonic.as_str()) {
                return Err(format!("Duplicate channel mnemonic: {}", channel.mnemonic));
            }
        }

        let mut kinds = HashSet::new();
        for axis in &self.axes {
            if !kinds.insert(axis.kind) {
                return Err(format!("Duplicate scan axis: {}", axis.kind));
            }
            if axis.kind.has_motor() && axis.motor.is_none() {
                return Err(format!("Scan axis {} needs a motor path", axis.kind));
            }
        }

        if self.methods.is_empty() {
            return Err("At least one method (sequence mode) is required".to_string());
        }
        for mode in &self.methods {
            if mode.sequences_per_scan_point == 0 {
                return Err(format!(
                    "Method '{}': sequences_per_scan_point must be at least 1",
                    mode.name
                ));
            }
        }

        if self.timing.clock.k1 == 0 || self.timing.clock.k2 == 0 {
            return Err("Clock dividers k1 and k2 must be non-zero".to_string());
        }
        if self.timing.clock.k3 == 0 || self.timing.clock.k4 == 0 {
            return Err("Clock dividers k3 and k4 must be non-zero".to_string());
        }
        if self.timing.retry.max_attempts == 0 {
            return Err("timing.retry.max_attempts must be at least 1".to_string());
        }
        if self.acquisition.poll_interval.is_zero() {
            return Err("acquisition.poll_interval must be non-zero".to_string());
        }
        Ok(())
    }

    /// Sequence mode by name; the first configured one when `name` is `None`.
    pub fn method(&self, name: Option<&str>) -> Option<&SequenceMode> {
        match name {
            Some(name) => self.methods.iter().find(|m| m.name == name),
            None => self.methods.first(),
        }
    }
}
