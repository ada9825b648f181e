//! FPGA timing system.
//!
//! Owns the register map, the clock and the transport. Register counts are
//! cached as [`Monitored`] values so observers see every change, whether it
//! was written by this process or reported by the device through a monitor.
//!
//! Writes are checked before they reach the hardware:
//! - a count outside `[min_count, max_count]` fails with `OutOfRange`;
//! - a value that maps to a NaN count fails with `NotANumber`.
//!
//! Register reads and writes that fail in the transport are retried under the
//! system's [`RetryPolicy`] before a `Transport` error is returned.

pub mod clock;
pub mod register;
pub mod simulator;
pub mod transport;

pub use clock::{Clock, ClockConfig};
pub use register::{Register, RegisterDescription, RegisterSpec, Timebase, CHANNEL_COUNT};
pub use simulator::SimulatedFpga;
pub use transport::{pv_name, RetriesExhausted, RetryPolicy, TimingTransport};

use crate::error::{AppResult, DaqError};
use crate::observable::{Derived, Monitored, Observed};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Registers mirrored from the device while the controller runs.
pub const MONITORED_REGISTERS: [&str; 6] = [
    "image_number",
    "acquiring",
    "queue_active",
    "queue_sequence_count",
    "queue_repeat_count",
    "queue_length",
];

/// Registers, clock and transport of one timing system.
pub struct TimingSystem {
    domain: String,
    clock: Arc<Clock>,
    registers: BTreeMap<String, Register>,
    transport: Arc<dyn TimingTransport>,
    retry: RetryPolicy,
    p0_shift: Derived<i64>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl TimingSystem {
    /// Build the register map from a description.
    pub fn new(
        domain: impl Into<String>,
        clock: Clock,
        description: RegisterDescription,
        transport: Arc<dyn TimingTransport>,
    ) -> AppResult<Self> {
        let clock = Arc::new(clock);
        let registers: BTreeMap<String, Register> = description
            .registers
            .into_iter()
            .map(|spec| (spec.name.clone(), Register::new(spec, Arc::clone(&clock))))
            .collect();

        let lookup = |name: &str| {
            registers.get(name).cloned().ok_or_else(|| {
                DaqError::Configuration(format!("register description lacks '{name}'"))
            })
        };
        let (p0d2, p0fd2) = (lookup("p0d2")?, lookup("p0fd2")?);
        let inputs: Vec<Arc<dyn Observed>> = vec![
            Arc::new(p0d2.count_monitor().clone()),
            Arc::new(p0fd2.count_monitor().clone()),
        ];
        let p0_shift = Derived::new("timing_system", "p0_shift.count", inputs, move || {
            p0_shift_from(p0d2.count(), p0fd2.count())
        });

        Ok(Self {
            domain: domain.into(),
            clock,
            registers,
            transport,
            retry: RetryPolicy::default(),
            p0_shift,
            monitors: Mutex::new(Vec::new()),
        })
    }

    /// Replace the retry policy for register access.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// PV domain, e.g. `BIOCARS`.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn transport(&self) -> &Arc<dyn TimingTransport> {
        &self.transport
    }

    /// Look up a register.
    pub fn register(&self, name: &str) -> AppResult<&Register> {
        self.registers
            .get(name)
            .ok_or_else(|| DaqError::UnknownRegister(name.to_string()))
    }

    pub fn has_register(&self, name: &str) -> bool {
        self.registers.contains_key(name)
    }

    pub fn register_names(&self) -> impl Iterator<Item = &str> {
        self.registers.keys().map(String::as_str)
    }

    /// Cached count.
    pub fn count(&self, name: &str) -> AppResult<i64> {
        Ok(self.register(name)?.count())
    }

    /// Read a count from the device and refresh the cache.
    pub async fn read_count(&self, name: &str) -> AppResult<i64> {
        let register = self.register(name)?;
        let transport = &self.transport;
        let count = self
            .retry
            .run(&format!("read {name}"), || transport.read(name))
            .await
            .map_err(|e| DaqError::transport(e.error))?;
        register.update_count(count);
        Ok(count)
    }

    /// Write a count after checking its range.
    pub async fn set_count(&self, name: &str, count: i64) -> AppResult<()> {
        let register = self.register(name)?;
        if let Err(e) = register.check_count(count) {
            warn!(register = name, count, "refusing register write: {e}");
            return Err(e);
        }
        let transport = &self.transport;
        self.retry
            .run(&format!("write {name}"), || transport.write(name, count))
            .await
            .map_err(|e| DaqError::transport(e.error))?;
        register.update_count(count);
        debug!(
            register = name,
            pv = %pv_name(&self.domain, name),
            count,
            "register written"
        );
        Ok(())
    }

    /// Write a value in user units.
    pub async fn set_value(&self, name: &str, value: f64) -> AppResult<()> {
        let count = self.register(name)?.count_from_value(value)?;
        self.set_count(name, count).await
    }

    /// `p0d2 * 4 + (p0fd2 + 2) mod 4`
    pub fn p0_shift(&self) -> i64 {
        self.p0_shift.get()
    }

    pub fn p0_shift_monitor(&self) -> &Monitored<i64> {
        self.p0_shift.output()
    }

    /// Set the composite phase, updating both underlying registers.
    pub async fn set_p0_shift(&self, count: i64) -> AppResult<()> {
        let (coarse, fine) = p0_shift_split(count);
        self.register("p0d2")?.check_count(coarse)?;
        self.register("p0fd2")?.check_count(fine)?;
        self.set_count("p0d2", coarse).await?;
        self.set_count("p0fd2", fine).await
    }

    /// Mirror device-side changes of `names` into the cached counts.
    pub async fn start_monitoring(&self, names: &[&str]) -> AppResult<()> {
        for name in names {
            let register = self.register(name)?.clone();
            let transport = &self.transport;
            let mut rx = self
                .retry
                .run(&format!("monitor {name}"), || transport.monitor(name))
                .await
                .map_err(|e| DaqError::transport(e.error))?;
            let handle = tokio::spawn(async move {
                let initial = *rx.borrow_and_update();
                register.update_count(initial);
                while rx.changed().await.is_ok() {
                    let count = *rx.borrow_and_update();
                    register.update_count(count);
                }
            });
            self.monitors.lock().push(handle);
        }
        Ok(())
    }

    /// Stop all monitor tasks.
    pub fn stop_monitoring(&self) {
        for handle in self.monitors.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TimingSystem {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

fn p0_shift_from(coarse: i64, fine: i64) -> i64 {
    coarse * 4 + (fine + 2).rem_euclid(4)
}

fn p0_shift_split(count: i64) -> (i64, i64) {
    (count.div_euclid(4), (count.rem_euclid(4) - 2).rem_euclid(4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn system() -> (TimingSystem, Arc<SimulatedFpga>) {
        let fpga = SimulatedFpga::new(Duration::from_millis(1));
        let description = RegisterDescription::builtin()
            .unwrap()
            .with_channel_registers();
        let system = TimingSystem::new(
            "TEST",
            Clock::new(&ClockConfig::default()).unwrap(),
            description,
            fpga.clone(),
        )
        .unwrap();
        (system, fpga)
    }

    #[test]
    fn test_p0_shift_packing() {
        for k in 0..64 {
            let (coarse, fine) = p0_shift_split(k);
            assert!((0..4).contains(&fine));
            assert_eq!(p0_shift_from(coarse, fine), k);
        }
    }

    #[tokio::test]
    async fn test_set_p0_shift_updates_both_registers() {
        let (system, fpga) = system();
        system.set_p0_shift(13).await.unwrap();
        assert_eq!(system.count("p0d2").unwrap(), 3);
        assert_eq!(system.count("p0fd2").unwrap(), 3);
        assert_eq!(fpga.register("p0fd2"), 3);
        assert_eq!(system.p0_shift(), 13);

        system.set_count("p0fd2", 0).await.unwrap();
        assert_eq!(system.p0_shift(), 3 * 4 + 2);
    }

    #[tokio::test]
    async fn test_out_of_range_write_is_refused() {
        let (system, fpga) = system();
        let err = system.set_count("ch1_enable", 2).await.unwrap_err();
        assert!(matches!(err, DaqError::OutOfRange { .. }));
        assert_eq!(fpga.register("ch1_enable"), 0);
        let err = system.set_value("hlcnd", f64::NAN).await.unwrap_err();
        assert!(matches!(err, DaqError::NotANumber { .. }));
        assert!(matches!(
            system.set_count("nonexistent", 0).await,
            Err(DaqError::UnknownRegister(_))
        ));
    }

    #[tokio::test]
    async fn test_monitoring_mirrors_device_changes() {
        let (system, fpga) = system();
        system.start_monitoring(&["image_number"]).await.unwrap();
        let mut rx = system.register("image_number").unwrap().count_monitor().subscribe();
        fpga.write("image_number", 7).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n == 7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(system.count("image_number").unwrap(), 7);
        system.stop_monitoring();
    }

    #[tokio::test]
    async fn test_transport_failure_maps_to_transport_error() {
        let (system, fpga) = system();
        let system = system.with_retry_policy(RetryPolicy::never());
        fpga.set_connected(false);
        let err = system.read_count("image_number").await.unwrap_err();
        assert!(matches!(err, DaqError::Transport(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_register_access_survives_a_short_outage() {
        let (system, fpga) = system();
        let system = system.with_retry_policy(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
        });
        fpga.write("image_number", 3).await.unwrap();
        fpga.set_connected(false);
        let reconnect = {
            let fpga = fpga.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fpga.set_connected(true);
            })
        };
        assert_eq!(system.read_count("image_number").await.unwrap(), 3);
        reconnect.await.unwrap();

        fpga.set_connected(false);
        let reconnect = {
            let fpga = fpga.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fpga.set_connected(true);
            })
        };
        system.set_count("image_number", 9).await.unwrap();
        assert_eq!(fpga.register("image_number"), 9);
        reconnect.await.unwrap();
    }
}
