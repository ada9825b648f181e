//! Timing-system output channels.
//!
//! 24 channels, addressed by number (1-based) or by mnemonic (`xdet`,
//! `losct`, `xosct`, `pst`, `ms`, `trans`, ...). A channel that is
//! PP-enabled fires according to the executing sequence; otherwise its
//! override registers force it low or high.
//!
//! Looking up a mnemonic that is not configured hands out a dummy channel.
//! It accepts writes (logging a warning) so that sequences referring to an
//! optional channel still compose on a minimal configuration.

use crate::error::{AppResult, DaqError};
use crate::observable::{Derived, Observed, ValueEq};
use crate::timing::{TimingSystem, CHANNEL_COUNT};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Which pulse a channel's delay is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingReference {
    /// Fires relative to the x-ray pulse
    #[default]
    Xray,
    /// Fires relative to the laser pulse, i.e. shifted by the scan delay
    Laser,
}

/// Persistent definition of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// 1-based channel number
    pub number: usize,
    #[serde(default)]
    pub mnemonic: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pp_enabled: bool,
    /// Seconds
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_sign")]
    pub sign: i32,
    /// Seconds
    #[serde(default)]
    pub pulse_length: f64,
    /// Hardware mode tag (e.g. `ms`, `trans`)
    #[serde(default)]
    pub special: String,
    #[serde(default)]
    pub gated: String,
    #[serde(default)]
    pub timed: String,
    #[serde(default)]
    pub reference: TimingReference,
}

fn default_sign() -> i32 {
    1
}

impl ChannelConfig {
    /// An unconfigured channel.
    pub fn unused(number: usize) -> Self {
        Self {
            number,
            mnemonic: String::new(),
            description: String::new(),
            pp_enabled: false,
            offset: 0.0,
            sign: 1,
            pulse_length: 0.0,
            special: String::new(),
            gated: String::new(),
            timed: String::new(),
            reference: TimingReference::Xray,
        }
    }
}

/// Output state as seen from the override registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStatus {
    /// Driven by the sequence
    PP,
    Low,
    High,
}

impl ValueEq for OutputStatus {
    fn value_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStatus::PP => write!(f, "PP"),
            OutputStatus::Low => write!(f, "Low"),
            OutputStatus::High => write!(f, "High"),
        }
    }
}

impl std::str::FromStr for OutputStatus {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PP" => Ok(OutputStatus::PP),
            "Low" => Ok(OutputStatus::Low),
            "High" => Ok(OutputStatus::High),
            other => Err(DaqError::Configuration(format!(
                "unknown output status '{other}'"
            ))),
        }
    }
}

/// One output channel.
pub struct Channel {
    config: RwLock<ChannelConfig>,
    output_status: Option<Derived<OutputStatus>>,
}

impl Channel {
    fn new(config: ChannelConfig, timing: &TimingSystem) -> AppResult<Self> {
        let n = config.number;
        let enable = timing.register(&format!("ch{n}_override"))?.clone();
        let state = timing.register(&format!("ch{n}_state"))?.clone();
        let inputs: Vec<Arc<dyn Observed>> = vec![
            Arc::new(enable.count_monitor().clone()),
            Arc::new(state.count_monitor().clone()),
        ];
        let output_status = Derived::new(
            format!("channels.ch{n}"),
            "output_status",
            inputs,
            move || match (enable.count(), state.count()) {
                (0, _) => OutputStatus::PP,
                (_, 0) => OutputStatus::Low,
                _ => OutputStatus::High,
            },
        );
        Ok(Self {
            config: RwLock::new(config),
            output_status: Some(output_status),
        })
    }

    fn dummy() -> Self {
        Self {
            config: RwLock::new(ChannelConfig::unused(0)),
            output_status: None,
        }
    }

    /// Whether this is the stand-in for an unknown mnemonic.
    pub fn is_dummy(&self) -> bool {
        self.output_status.is_none()
    }

    pub fn config(&self) -> ChannelConfig {
        self.config.read().clone()
    }

    pub fn number(&self) -> usize {
        self.config.read().number
    }

    pub fn mnemonic(&self) -> String {
        self.config.read().mnemonic.clone()
    }

    pub fn description(&self) -> String {
        self.config.read().description.clone()
    }

    pub fn pp_enabled(&self) -> bool {
        !self.is_dummy() && self.config.read().pp_enabled
    }

    pub fn offset(&self) -> f64 {
        self.config.read().offset
    }

    pub fn sign(&self) -> f64 {
        f64::from(self.config.read().sign)
    }

    pub fn pulse_length(&self) -> f64 {
        self.config.read().pulse_length
    }

    pub fn special(&self) -> String {
        self.config.read().special.clone()
    }

    pub fn reference(&self) -> TimingReference {
        self.config.read().reference
    }

    /// Register name of a per-channel register, e.g. `ch3_delay`.
    pub fn register_name(&self, field: &str) -> String {
        format!("ch{}_{}", self.number(), field)
    }

    /// `PP` when the override register is clear, else the forced level.
    pub fn output_status(&self) -> OutputStatus {
        self.output_status
            .as_ref()
            .map(|d| d.get())
            .unwrap_or(OutputStatus::PP)
    }

    /// Force the output or hand it back to the sequence.
    pub async fn set_output_status(
        &self,
        timing: &TimingSystem,
        status: OutputStatus,
    ) -> AppResult<()> {
        if self.is_dummy() {
            warn!(%status, "ignoring output status write to dummy channel");
            return Ok(());
        }
        let (enable, state) = match status {
            OutputStatus::PP => (0, 0),
            OutputStatus::Low => (1, 0),
            OutputStatus::High => (1, 1),
        };
        timing.set_count(&self.register_name("state"), state).await?;
        timing.set_count(&self.register_name("override"), enable).await
    }

    /// Apply a setup change.
    pub fn update(&self, change: impl FnOnce(&mut ChannelConfig)) {
        if self.is_dummy() {
            warn!("ignoring configuration write to dummy channel");
            return;
        }
        let mut config = self.config.write();
        let number = config.number;
        change(&mut config);
        config.number = number;
    }
}

/// All channels of a timing system.
pub struct ChannelBank {
    channels: Vec<Arc<Channel>>,
    by_mnemonic: HashMap<String, usize>,
    dummy: Arc<Channel>,
}

impl ChannelBank {
    /// Build the bank. Channels missing from `configs` are created unused.
    pub fn new(configs: &[ChannelConfig], timing: &TimingSystem) -> AppResult<Self> {
        let mut slots: Vec<ChannelConfig> = (1..=CHANNEL_COUNT).map(ChannelConfig::unused).collect();
        for config in configs {
            if config.number == 0 || config.number > CHANNEL_COUNT {
                return Err(DaqError::Configuration(format!(
                    "channel number {} not in 1..={CHANNEL_COUNT}",
                    config.number
                )));
            }
            slots[config.number - 1] = config.clone();
        }

        let mut by_mnemonic = HashMap::new();
        for (index, config) in slots.iter().enumerate() {
            if config.mnemonic.is_empty() {
                continue;
            }
            if by_mnemonic.insert(config.mnemonic.clone(), index).is_some() {
                return Err(DaqError::Configuration(format!(
                    "channel mnemonic '{}' used twice",
                    config.mnemonic
                )));
            }
        }

        let channels = slots
            .into_iter()
            .map(|config| Channel::new(config, timing).map(Arc::new))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            channels,
            by_mnemonic,
            dummy: Arc::new(Channel::dummy()),
        })
    }

    /// Channel by 1-based number.
    pub fn get(&self, number: usize) -> Option<Arc<Channel>> {
        number
            .checked_sub(1)
            .and_then(|i| self.channels.get(i))
            .cloned()
    }

    /// Channel by mnemonic, or `None`.
    pub fn find(&self, mnemonic: &str) -> Option<Arc<Channel>> {
        self.by_mnemonic
            .get(mnemonic)
            .map(|i| Arc::clone(&self.channels[*i]))
    }

    /// Channel by mnemonic; unknown mnemonics yield the dummy channel.
    pub fn by_mnemonic(&self, mnemonic: &str) -> Arc<Channel> {
        self.find(mnemonic).unwrap_or_else(|| {
            warn!(mnemonic, "unknown channel mnemonic, using dummy channel");
            Arc::clone(&self.dummy)
        })
    }

    /// Channel by mnemonic, failing for unknown mnemonics.
    pub fn require(&self, mnemonic: &str) -> AppResult<Arc<Channel>> {
        self.find(mnemonic).ok_or_else(|| {
            DaqError::Configuration(format!("unknown channel mnemonic '{mnemonic}'"))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.iter()
    }

    /// Channels whose firing pattern comes from the sequence.
    pub fn pp_enabled(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .filter(|c| c.pp_enabled())
            .cloned()
            .collect()
    }

    /// Current definitions, for persisting.
    pub fn configs(&self) -> Vec<ChannelConfig> {
        self.channels.iter().map(|c| c.config()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{Clock, ClockConfig, RegisterDescription, SimulatedFpga};
    use std::time::Duration;

    fn timing() -> TimingSystem {
        TimingSystem::new(
            "TEST",
            Clock::new(&ClockConfig::default()).unwrap(),
            RegisterDescription::builtin().unwrap().with_channel_registers(),
            SimulatedFpga::new(Duration::from_millis(1)),
        )
        .unwrap()
    }

    fn xdet() -> ChannelConfig {
        ChannelConfig {
            mnemonic: "xdet".into(),
            description: "X-ray detector trigger".into(),
            pp_enabled: true,
            ..ChannelConfig::unused(3)
        }
    }

    #[test]
    fn test_lookup_by_number_and_mnemonic() {
        let timing = timing();
        let bank = ChannelBank::new(&[xdet()], &timing).unwrap();
        assert_eq!(bank.iter().count(), CHANNEL_COUNT);
        assert_eq!(bank.require("xdet").unwrap().number(), 3);
        assert_eq!(bank.get(3).unwrap().mnemonic(), "xdet");
        assert!(bank.get(0).is_none());
        assert!(bank.require("nope").is_err());
        assert_eq!(bank.pp_enabled().len(), 1);
    }

    #[test]
    fn test_duplicate_mnemonic_rejected() {
        let timing = timing();
        let mut other = xdet();
        other.number = 4;
        assert!(ChannelBank::new(&[xdet(), other], &timing).is_err());
    }

    #[tokio::test]
    async fn test_dummy_channel_accepts_writes() {
        let timing = timing();
        let bank = ChannelBank::new(&[], &timing).unwrap();
        let dummy = bank.by_mnemonic("pst");
        assert!(dummy.is_dummy());
        assert!(!dummy.pp_enabled());
        dummy.update(|c| c.offset = 1.0);
        assert_eq!(dummy.offset(), 0.0);
        dummy
            .set_output_status(&timing, OutputStatus::High)
            .await
            .unwrap();
        assert_eq!(dummy.output_status(), OutputStatus::PP);
    }

    #[tokio::test]
    async fn test_output_status_follows_registers() {
        let timing = timing();
        let bank = ChannelBank::new(&[xdet()], &timing).unwrap();
        let channel = bank.require("xdet").unwrap();
        assert_eq!(channel.output_status(), OutputStatus::PP);
        channel
            .set_output_status(&timing, OutputStatus::High)
            .await
            .unwrap();
        assert_eq!(channel.output_status(), OutputStatus::High);
        channel
            .set_output_status(&timing, OutputStatus::Low)
            .await
            .unwrap();
        assert_eq!(channel.output_status(), OutputStatus::Low);
        channel
            .set_output_status(&timing, OutputStatus::PP)
            .await
            .unwrap();
        assert_eq!(channel.output_status(), OutputStatus::PP);
    }
}
