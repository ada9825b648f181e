//! FPGA clock periods.
//!
//! Every period the timing system knows about is an exact integer multiple of
//! the base clock tick `bct` (one cycle of the storage-ring RF):
//!
//! | period | ticks            |
//! |--------|------------------|
//! | `hsct` | `4 * k1`         |
//! | `P0t`  | `4 * k1 / k2`    |
//! | `hlct` | `4 * k1 * k3`    |
//! | `nslt` | `4 * k1 * k4`    |
//!
//! Setters take a period in seconds and solve for the nearest integer divider.

use crate::error::{AppResult, DaqError};
use crate::observable::Monitored;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Storage-ring RF frequency, in Hz.
pub const DEFAULT_RF_FREQUENCY: f64 = 351.934e6;

/// Clock dividers as stored in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClockConfig {
    /// RF frequency in Hz; `bct = 1 / rf_frequency`
    #[serde(default = "default_rf")]
    pub rf_frequency: f64,
    /// hsct = 4 * k1 ticks
    #[serde(default = "default_k1")]
    pub k1: u64,
    /// Bunches per hsct period; must divide `4 * k1`
    #[serde(default = "default_k2")]
    pub k2: u64,
    /// hlct = k3 * hsct
    #[serde(default = "default_k3")]
    pub k3: u64,
    /// nslt = k4 * hsct
    #[serde(default = "default_k4")]
    pub k4: u64,
}

fn default_rf() -> f64 {
    DEFAULT_RF_FREQUENCY
}
fn default_k1() -> u64 {
    89100
}
fn default_k2() -> u64 {
    275
}
fn default_k3() -> u64 {
    4
}
fn default_k4() -> u64 {
    48
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            rf_frequency: default_rf(),
            k1: default_k1(),
            k2: default_k2(),
            k3: default_k3(),
            k4: default_k4(),
        }
    }
}

/// Observable clock state.
#[derive(Debug, Clone)]
pub struct Clock {
    bct: Monitored<f64>,
    k1: Monitored<u64>,
    k2: Monitored<u64>,
    k3: Monitored<u64>,
    k4: Monitored<u64>,
}

impl Clock {
    /// Build a clock, checking that every divider is usable.
    pub fn new(config: &ClockConfig) -> AppResult<Self> {
        if !(config.rf_frequency.is_finite() && config.rf_frequency > 0.0) {
            return Err(DaqError::Configuration(format!(
                "clock: invalid RF frequency {}",
                config.rf_frequency
            )));
        }
        if config.k1 == 0 || config.k2 == 0 || config.k3 == 0 || config.k4 == 0 {
            return Err(DaqError::Configuration("clock: dividers must be positive".into()));
        }
        if (4 * config.k1) % config.k2 != 0 {
            return Err(DaqError::Configuration(format!(
                "clock: k2={} does not divide 4*k1={}",
                config.k2,
                4 * config.k1
            )));
        }
        Ok(Self {
            bct: Monitored::new("timing_system", "bct", 1.0 / config.rf_frequency),
            k1: Monitored::new("timing_system", "hsc.divider", config.k1),
            k2: Monitored::new("timing_system", "p0.divider", config.k2),
            k3: Monitored::new("timing_system", "hlc.divider", config.k3),
            k4: Monitored::new("timing_system", "nsl.divider", config.k4),
        })
    }

    /// Current dividers as a config record.
    pub fn config(&self) -> ClockConfig {
        ClockConfig {
            rf_frequency: 1.0 / self.bct(),
            k1: self.k1.get(),
            k2: self.k2.get(),
            k3: self.k3.get(),
            k4: self.k4.get(),
        }
    }

    /// Base clock tick, in seconds.
    pub fn bct(&self) -> f64 {
        self.bct.get()
    }

    /// Observable `k1` (anything that depends on hsct can listen here).
    pub fn hsct_divider(&self) -> &Monitored<u64> {
        &self.k1
    }

    /// Ticks per high-speed chopper period.
    pub fn hsct_ticks(&self) -> u64 {
        4 * self.k1.get()
    }

    /// Ticks per single-bunch period.
    pub fn p0t_ticks(&self) -> u64 {
        self.hsct_ticks() / self.k2.get()
    }

    /// Ticks per heat-load chopper period.
    pub fn hlct_ticks(&self) -> u64 {
        self.hsct_ticks() * self.k3.get()
    }

    /// Ticks per laser period.
    pub fn nslt_ticks(&self) -> u64 {
        self.hsct_ticks() * self.k4.get()
    }

    /// High-speed chopper period, in seconds.
    pub fn hsct(&self) -> f64 {
        self.hsct_ticks() as f64 * self.bct()
    }

    /// Single-bunch period, in seconds.
    pub fn p0t(&self) -> f64 {
        self.p0t_ticks() as f64 * self.bct()
    }

    /// Heat-load chopper period, in seconds.
    pub fn hlct(&self) -> f64 {
        self.hlct_ticks() as f64 * self.bct()
    }

    /// Laser period, in seconds.
    pub fn nslt(&self) -> f64 {
        self.nslt_ticks() as f64 * self.bct()
    }

    /// Change the base tick. Dividers are kept, so every period scales.
    pub fn set_bct(&self, bct: f64) -> AppResult<()> {
        if !(bct.is_finite() && bct > 0.0) {
            return Err(DaqError::Configuration(format!("clock: invalid bct {bct}")));
        }
        self.bct.set_if_changed(bct);
        Ok(())
    }

    /// Set hsct to the nearest achievable period.
    ///
    /// If the current `k2` no longer divides the new `4 * k1`, it is moved to
    /// the nearest divider that does.
    pub fn set_hsct(&self, period: f64) -> AppResult<()> {
        let k1 = nearest_multiplier(period, 4.0 * self.bct(), "hsct")?;
        let k2 = nearest_divisor(4 * k1, self.k2.get() as f64);
        self.k1.set_if_changed(k1);
        self.k2.set_if_changed(k2);
        info!(k1, k2, hsct = self.hsct(), "clock: hsct changed");
        Ok(())
    }

    /// Set P0t to the nearest period that divides hsct evenly.
    pub fn set_p0t(&self, period: f64) -> AppResult<()> {
        if !(period.is_finite() && period > 0.0) {
            return Err(DaqError::Configuration(format!("clock: invalid P0t {period}")));
        }
        let k2 = nearest_divisor(self.hsct_ticks(), self.hsct() / period);
        self.k2.set_if_changed(k2);
        Ok(())
    }

    /// Set hlct to the nearest multiple of hsct.
    pub fn set_hlct(&self, period: f64) -> AppResult<()> {
        let k3 = nearest_multiplier(period, self.hsct(), "hlct")?;
        self.k3.set_if_changed(k3);
        Ok(())
    }

    /// Set nslt to the nearest multiple of hsct.
    pub fn set_nslt(&self, period: f64) -> AppResult<()> {
        let k4 = nearest_multiplier(period, self.hsct(), "nslt")?;
        self.k4.set_if_changed(k4);
        Ok(())
    }
}

fn nearest_multiplier(period: f64, unit: f64, name: &str) -> AppResult<u64> {
    if !(period.is_finite() && period > 0.0) {
        return Err(DaqError::Configuration(format!("clock: invalid {name} {period}")));
    }
    Ok(((period / unit).round() as u64).max(1))
}

/// Divisor of `n` closest to `target` (ties go to the smaller divisor).
fn nearest_divisor(n: u64, target: f64) -> u64 {
    let mut best = 1;
    let mut best_distance = f64::INFINITY;
    let mut d = 1;
    while d * d <= n {
        if n % d == 0 {
            for candidate in [d, n / d] {
                let distance = (candidate as f64 - target).abs();
                if distance < best_distance || (distance == best_distance && candidate < best) {
                    best = candidate;
                    best_distance = distance;
                }
            }
        }
        d += 1;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_periods() {
        let clock = Clock::new(&ClockConfig::default()).unwrap();
        assert!((clock.bct() - 2.8414e-9).abs() < 1e-12);
        assert!((clock.hsct() - 1.0127e-3).abs() < 1e-6);
        assert!((clock.p0t() - 3.6826e-6).abs() < 1e-9);
        assert_eq!(clock.p0t_ticks() * 275, clock.hsct_ticks());
        assert_eq!(clock.hlct_ticks(), 4 * clock.hsct_ticks());
        assert_eq!(clock.nslt_ticks(), 48 * clock.hsct_ticks());
    }

    #[test]
    fn test_rejects_non_dividing_k2() {
        let config = ClockConfig {
            k2: 7,
            ..ClockConfig::default()
        };
        assert!(Clock::new(&config).is_err());
    }

    #[test]
    fn test_setters_pick_nearest_integer() {
        let clock = Clock::new(&ClockConfig::default()).unwrap();
        clock.set_hlct(clock.hsct() * 3.4).unwrap();
        assert_eq!(clock.hlct_ticks(), 3 * clock.hsct_ticks());
        clock.set_nslt(clock.hsct() * 9.6).unwrap();
        assert_eq!(clock.nslt_ticks(), 10 * clock.hsct_ticks());
        clock.set_p0t(clock.hsct() / 270.0).unwrap();
        assert_eq!(clock.hsct_ticks() % clock.p0t_ticks(), 0);

        let before = clock.bct();
        clock.set_hsct(2e-3).unwrap();
        assert_eq!(clock.bct(), before);
        assert!((clock.hsct() - 2e-3).abs() <= 2.0 * clock.bct());
        assert_eq!(clock.hsct_ticks() % clock.p0t_ticks(), 0);
        assert!(clock.set_hsct(f64::NAN).is_err());
    }

    #[test]
    fn test_nearest_divisor() {
        assert_eq!(nearest_divisor(12, 5.0), 4);
        assert_eq!(nearest_divisor(12, 5.0 - 1e-9), 4);
        assert_eq!(nearest_divisor(356400, 275.0), 275);
        assert_eq!(nearest_divisor(7, 3.0), 1);
    }
}
