//! Sequence composer.
//!
//! Turns a scan point (delay, laser on/off) and the selected mode into the
//! sequences the FPGA executes for that point: `sequences_per_scan_point`
//! consecutive hsct periods, the last of which increments `image_number`.
//!
//! For every PP-enabled channel a sequence carries three registers:
//!
//! ```text
//! ch<N>_delay  = round(sign * (t - offset) / bct) mod (hsct / bct)
//! ch<N>_pulse  = round(pulse_length / bct)
//! ch<N>_enable = flag of the channel for this sequence
//! ```
//!
//! where `t` is the x-ray arrival time within the period, or the laser time
//! (`xray_time - delay`) for channels referenced to the laser.

use super::{Sequence, SequenceFlags};
use crate::channels::{Channel, ChannelBank, TimingReference};
use crate::error::{AppResult, DaqError};
use crate::format::{seconds, time_string};
use crate::scan::{expand_scan_points, AxisKind, ScanExpansion};
use crate::timing::TimingSystem;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// A named set of sequence parameters (one row of the methods configuration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceMode {
    pub name: String,
    #[serde(default = "default_sequences_per_scan_point")]
    pub sequences_per_scan_point: usize,
    #[serde(default)]
    pub pump_on: bool,
    #[serde(default = "default_true")]
    pub xdet_on: bool,
    #[serde(default)]
    pub xosct_on: bool,
    #[serde(default)]
    pub losct_on: bool,
    #[serde(default)]
    pub ms_on: bool,
    #[serde(default)]
    pub trans_on: bool,
    /// Laser enabled at all; combined with the Laser_on scan value
    #[serde(default = "default_true")]
    pub laser_on: bool,
    /// Delay when the scan has no Delay axis, seconds
    #[serde(default)]
    pub delay: f64,
    /// X-ray arrival within the hsct period, seconds
    #[serde(default)]
    pub xray_time: f64,
}

fn default_sequences_per_scan_point() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for SequenceMode {
    fn default() -> Self {
        Self {
            name: "default".into(),
            sequences_per_scan_point: 1,
            pump_on: false,
            xdet_on: true,
            xosct_on: false,
            losct_on: false,
            ms_on: false,
            trans_on: false,
            laser_on: true,
            delay: 0.0,
            xray_time: 0.0,
        }
    }
}

/// Builds sequences from scan points.
pub struct SequenceComposer {
    timing: Arc<TimingSystem>,
    channels: Arc<ChannelBank>,
    mode: RwLock<SequenceMode>,
}

impl SequenceComposer {
    pub fn new(
        timing: Arc<TimingSystem>,
        channels: Arc<ChannelBank>,
        mode: SequenceMode,
    ) -> AppResult<Self> {
        validate_mode(&mode)?;
        Ok(Self {
            timing,
            channels,
            mode: RwLock::new(mode),
        })
    }

    pub fn mode(&self) -> SequenceMode {
        self.mode.read().clone()
    }

    pub fn set_mode(&self, mode: SequenceMode) -> AppResult<()> {
        validate_mode(&mode)?;
        debug!(mode = %mode.name, "sequence mode selected");
        *self.mode.write() = mode;
        Ok(())
    }

    pub fn sequences_per_scan_point(&self) -> usize {
        self.mode.read().sequences_per_scan_point
    }

    /// Sequences of one scan point.
    pub fn sequences_basic(&self, delay: f64, laser_on: bool) -> AppResult<Vec<Sequence>> {
        if delay.is_nan() {
            return Err(DaqError::NotANumber {
                register: "delay".into(),
            });
        }
        let mode = self.mode();
        let laser_on = laser_on && mode.laser_on;
        let channels = self.channels.pp_enabled();
        let count = mode.sequences_per_scan_point;
        (0..count)
            .map(|k| self.sequence(&mode, &channels, delay, laser_on, k + 1 == count))
            .collect()
    }

    /// [`SequenceComposer::sequences_basic`] for each `(delay, laser_on)` in turn.
    pub fn sequences_simple(&self, points: &[(f64, bool)]) -> AppResult<Vec<Sequence>> {
        let mut sequences = Vec::new();
        for (delay, laser_on) in points {
            sequences.extend(self.sequences_basic(*delay, *laser_on)?);
        }
        Ok(sequences)
    }

    /// The queue for a scan: one period of the sequence axes.
    ///
    /// Scan points `i` and `i + sequence_period` compose identically, so the
    /// FPGA can repeat this queue for the whole dataset.
    pub fn queue_sequences(&self, scan: &ScanExpansion) -> AppResult<Vec<Sequence>> {
        let mode = self.mode();
        let points: Vec<(f64, bool)> = (0..scan.sequence_period())
            .map(|p| {
                let delay = scan.value_of(AxisKind::Delay, p).unwrap_or(mode.delay);
                let laser_on = scan
                    .value_of(AxisKind::LaserOn, p)
                    .map_or(true, |v| v != 0.0);
                (delay, laser_on)
            })
            .collect();
        self.sequences_simple(&points)
    }

    /// Rewrite a delay values string into a sequences expression.
    pub fn delay_sequences(&self, values: &str) -> AppResult<DelaySequences> {
        let laser_on = self.mode.read().laser_on;
        let entries = expand_scan_points(values)?
            .into_iter()
            .map(|delay| (delay, laser_on))
            .collect();
        Ok(DelaySequences { entries })
    }

    fn sequence(
        &self,
        mode: &SequenceMode,
        channels: &[Arc<Channel>],
        delay: f64,
        laser_on: bool,
        last: bool,
    ) -> AppResult<Sequence> {
        let flags = SequenceFlags {
            acquiring: true,
            image_number_inc: last,
            pump_on: mode.pump_on,
            laser_on,
            xdet_on: mode.xdet_on && last,
            xosct_on: mode.xosct_on,
            losct_on: mode.losct_on && laser_on,
            ms_on: mode.ms_on,
            trans_on: mode.trans_on,
        };
        let clock = self.timing.clock();
        let bct = clock.bct();
        let period = clock.hsct_ticks() as i64;

        let mut sequence = Sequence {
            flags,
            ..Sequence::default()
        };
        for channel in channels {
            let t = match channel.reference() {
                TimingReference::Xray => mode.xray_time,
                TimingReference::Laser => mode.xray_time - delay,
            };
            let delay_register = channel.register_name("delay");
            let ticks = (channel.sign() * (t - channel.offset()) / bct).round();
            if !ticks.is_finite() {
                return Err(DaqError::NotANumber {
                    register: delay_register,
                });
            }
            let delay_count = (ticks as i64).rem_euclid(period);

            let pulse_register = channel.register_name("pulse");
            let pulse = (channel.pulse_length() / bct).round();
            if !pulse.is_finite() {
                return Err(DaqError::NotANumber {
                    register: pulse_register,
                });
            }
            let pulse_count = pulse as i64;

            let enable_register = channel.register_name("enable");
            let enable = i64::from(channel_enabled(channel, &flags));

            for (name, count) in [
                (delay_register, delay_count),
                (pulse_register, pulse_count),
                (enable_register, enable),
            ] {
                self.timing.register(&name)?.check_count(count)?;
                sequence.registers.insert(name, count);
            }
        }
        Ok(sequence)
    }
}

fn validate_mode(mode: &SequenceMode) -> AppResult<()> {
    if mode.sequences_per_scan_point == 0 {
        return Err(DaqError::Configuration(format!(
            "mode '{}': sequences_per_scan_point must be at least 1",
            mode.name
        )));
    }
    Ok(())
}

/// Whether a channel fires in a sequence with these flags.
fn channel_enabled(channel: &Channel, flags: &SequenceFlags) -> bool {
    match channel.mnemonic().as_str() {
        "xdet" => flags.xdet_on,
        "xosct" => flags.xosct_on,
        "losct" => flags.losct_on,
        "ms" => flags.ms_on,
        "trans" => flags.trans_on,
        "pump" => flags.pump_on,
        "pst" | "nsl" => flags.laser_on,
        _ if channel.reference() == TimingReference::Laser => flags.laser_on,
        _ => true,
    }
}

/// A list of `(delay, laser_on)` scan points, convertible to and from the
/// expression `[sequences(delay=-10us, laser_on=True), ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DelaySequences {
    pub entries: Vec<(f64, bool)>,
}

fn entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"sequences\(\s*delay\s*=\s*([^,()]+?)\s*,\s*laser_on\s*=\s*(True|False)\s*\)")
            .unwrap_or_else(|_| unreachable!("sequences pattern is a valid regex"))
    })
}

impl DelaySequences {
    pub fn expression(&self) -> String {
        let items: Vec<String> = self
            .entries
            .iter()
            .map(|(delay, laser_on)| {
                format!(
                    "sequences(delay={}, laser_on={})",
                    time_string(*delay, 6),
                    if *laser_on { "True" } else { "False" }
                )
            })
            .collect();
        format!("[{}]", items.join(", "))
    }

    /// Parse an expression produced by [`DelaySequences::expression`].
    pub fn parse(expression: &str) -> AppResult<Self> {
        let trimmed = expression.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| DaqError::expression(expression, "expected [sequences(...), ...]"))?;
        let leftover = entry_regex().replace_all(inner, "");
        if leftover.chars().any(|c| c != ',' && !c.is_whitespace()) {
            return Err(DaqError::expression(
                expression,
                "unexpected text between sequences",
            ));
        }
        let mut entries = Vec::new();
        for captures in entry_regex().captures_iter(inner) {
            let delay = seconds(&captures[1])?;
            entries.push((delay, &captures[2] == "True"));
        }
        Ok(Self { entries })
    }

    /// The sequences this expression stands for.
    pub fn evaluate(&self, composer: &SequenceComposer) -> AppResult<Vec<Sequence>> {
        composer.sequences_simple(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelConfig;
    use crate::scan::ScanExpander;
    use crate::timing::{Clock, ClockConfig, RegisterDescription, SimulatedFpga};
    use std::time::Duration;

    fn composer(mode: SequenceMode) -> SequenceComposer {
        let timing = Arc::new(
            TimingSystem::new(
                "TEST",
                Clock::new(&ClockConfig::default()).unwrap(),
                RegisterDescription::builtin().unwrap().with_channel_registers(),
                SimulatedFpga::new(Duration::from_millis(1)),
            )
            .unwrap(),
        );
        let configs = [
            ChannelConfig {
                mnemonic: "xdet".into(),
                pp_enabled: true,
                pulse_length: 1e-6,
                ..ChannelConfig::unused(3)
            },
            ChannelConfig {
                mnemonic: "pst".into(),
                pp_enabled: true,
                reference: TimingReference::Laser,
                ..ChannelConfig::unused(5)
            },
            ChannelConfig {
                mnemonic: "hsc".into(),
                ..ChannelConfig::unused(7)
            },
        ];
        let channels = Arc::new(ChannelBank::new(&configs, &timing).unwrap());
        SequenceComposer::new(timing, channels, mode).unwrap()
    }

    #[test]
    fn test_last_sequence_of_point_increments_image_number() {
        let composer = composer(SequenceMode {
            sequences_per_scan_point: 2,
            ..SequenceMode::default()
        });
        let sequences = composer.sequences_basic(0.0, true).unwrap();
        assert_eq!(sequences.len(), 2);
        assert!(sequences.iter().all(|s| s.flags.acquiring));
        assert!(!sequences[0].flags.image_number_inc);
        assert!(sequences[1].flags.image_number_inc);
        assert_eq!(sequences[0].registers["ch3_enable"], 0);
        assert_eq!(sequences[1].registers["ch3_enable"], 1);
        assert_eq!(sequences[1].registers["ch3_pulse"], 352);
        // only PP-enabled channels are assigned
        assert!(!sequences[0].registers.contains_key("ch7_delay"));
    }

    #[test]
    fn test_laser_channel_follows_delay() {
        let composer = composer(SequenceMode::default());
        let sequence = &composer.sequences_basic(1e-6, true).unwrap()[0];
        assert_eq!(sequence.registers["ch5_delay"], 356_400 - 352);
        assert_eq!(sequence.registers["ch3_delay"], 0);
        assert_eq!(sequence.registers["ch5_enable"], 1);

        let dark = &composer.sequences_basic(1e-6, false).unwrap()[0];
        assert_eq!(dark.registers["ch5_enable"], 0);
        assert!(!dark.flags.laser_on);
    }

    #[test]
    fn test_composition_is_deterministic() {
        let composer = composer(SequenceMode::default());
        let a = composer.sequences_basic(-1e-5, true).unwrap();
        let b = composer.sequences_basic(-1e-5, true).unwrap();
        assert_eq!(a[0].id(), b[0].id());
        let c = composer.sequences_basic(-1e-6, true).unwrap();
        assert_ne!(a[0].id(), c[0].id());
    }

    #[test]
    fn test_nan_delay_is_refused() {
        let composer = composer(SequenceMode::default());
        assert!(matches!(
            composer.sequences_basic(f64::NAN, true),
            Err(DaqError::NotANumber { .. })
        ));
    }

    #[test]
    fn test_mode_without_laser_overrides_scan() {
        let composer = composer(SequenceMode {
            laser_on: false,
            ..SequenceMode::default()
        });
        let sequence = &composer.sequences_basic(0.0, true).unwrap()[0];
        assert!(!sequence.flags.laser_on);
        assert!(composer
            .set_mode(SequenceMode {
                sequences_per_scan_point: 0,
                ..SequenceMode::default()
            })
            .is_err());
    }

    #[test]
    fn test_queue_covers_one_sequence_period() {
        let composer = composer(SequenceMode::default());
        let scan = ScanExpander::new()
            .expand("Delay=[0, 1us],Laser_on=[0,1],Temperature=[1,2]", None)
            .unwrap();
        assert_eq!(scan.n(), 8);
        let queue = composer.queue_sequences(&scan).unwrap();
        let expected = composer
            .sequences_simple(&[(0.0, false), (1e-6, false), (0.0, true), (1e-6, true)])
            .unwrap();
        assert_eq!(queue, expected);

        let single = ScanExpander::new().expand("Repeat=3", None).unwrap();
        assert_eq!(composer.queue_sequences(&single).unwrap().len(), 1);
    }

    #[test]
    fn test_delay_sequences_expression() {
        let composer = composer(SequenceMode::default());
        let delays = composer.delay_sequences("-10us, 0, 100us").unwrap();
        let expression = delays.expression();
        assert_eq!(
            expression,
            "[sequences(delay=-10us, laser_on=True), sequences(delay=0, laser_on=True), \
             sequences(delay=100us, laser_on=True)]"
        );
        let parsed = DelaySequences::parse(&expression).unwrap();
        assert_eq!(parsed.entries.len(), 3);
        for ((a, la), (b, lb)) in parsed.entries.iter().zip(&delays.entries) {
            assert!((a - b).abs() <= 1e-12);
            assert_eq!(la, lb);
        }
        assert_eq!(parsed.evaluate(&composer).unwrap().len(), 3);
        assert!(DelaySequences::parse("[sequences(delay=1us, laser_on=True), os.remove()]").is_err());
    }
}
