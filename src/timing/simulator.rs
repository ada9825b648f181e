//! In-memory FPGA simulator.
//!
//! Implements [`TimingTransport`] with a register file, a packet cache keyed by
//! sequence hash and a queue that executes one sequence per tick. The tick
//! period stands in for hsct and can be scaled for tests.
//!
//! Queue semantics follow the hardware:
//! - while `queue_active` is set, each tick executes
//!   `queue[queue_sequence_count]`;
//! - a sequence flagged `image_number_inc` increments `image_number`;
//! - after the last sequence of a pass `queue_repeat_count` increments and
//!   `queue_sequence_count` wraps to 0;
//! - when `queue_repeat_count` reaches a non-zero `queue_max_repeat_count`
//!   the queue clears `queue_active` itself.

use super::transport::TimingTransport;
use crate::sequence::{queue_hash, Sequence};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Simulated timing system.
pub struct SimulatedFpga {
    registers: Mutex<HashMap<String, watch::Sender<i64>>>,
    packets: Mutex<HashMap<String, Sequence>>,
    queue: Mutex<Vec<String>>,
    period: Duration,
    connected: AtomicBool,
    upload_failures: AtomicU32,
    uploaded: AtomicU64,
    executed: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedFpga {
    /// Create a simulator executing one sequence every `period`.
    pub fn new(period: Duration) -> Arc<Self> {
        Arc::new(Self {
            registers: Mutex::new(HashMap::new()),
            packets: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            period,
            connected: AtomicBool::new(true),
            upload_failures: AtomicU32::new(0),
            uploaded: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            task: Mutex::new(None),
        })
    }

    /// Start executing the queue in a background task.
    ///
    /// The task holds only a weak reference and ends when the simulator is
    /// dropped or [`SimulatedFpga::stop`] is called.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(fpga) => fpga.step(),
                    None => break,
                }
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!(period_us = period.as_micros() as u64, "FPGA simulator started");
    }

    /// Stop the background task.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Fail the next `n` packet uploads with a transport error.
    pub fn fail_next_uploads(&self, n: u32) {
        self.upload_failures.store(n, Ordering::SeqCst);
    }

    /// Simulate loss (or recovery) of the connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Packets uploaded since creation.
    pub fn uploaded_packets(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    /// Sequences executed since creation.
    pub fn executed_sequences(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Current count of a register (0 if never written).
    pub fn register(&self, name: &str) -> i64 {
        self.registers
            .lock()
            .get(name)
            .map(|tx| *tx.borrow())
            .unwrap_or(0)
    }

    fn set_register(&self, name: &str, count: i64) {
        let mut registers = self.registers.lock();
        match registers.get(name) {
            Some(tx) => {
                tx.send_if_modified(|current| {
                    let changed = *current != count;
                    *current = count;
                    changed
                });
            }
            None => {
                let (tx, _) = watch::channel(count);
                registers.insert(name.to_string(), tx);
            }
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("timing system not reachable"))
        }
    }

    /// Execute one sequence if the queue is active.
    pub fn step(&self) {
        if self.register("queue_active") == 0 {
            if self.register("acquiring") != 0 {
                self.set_register("acquiring", 0);
            }
            return;
        }
        let (len, index, hash) = {
            let queue = self.queue.lock();
            let len = queue.len();
            let index = (self.register("queue_sequence_count").max(0) as usize)
                .checked_rem(len)
                .unwrap_or(0);
            (len, index, queue.get(index).cloned())
        };
        let Some(hash) = hash else {
            warn!("FPGA simulator: queue empty, stopping");
            self.set_register("queue_active", 0);
            return;
        };
        let max_repeat = self.register("queue_max_repeat_count");
        let repeat = self.register("queue_repeat_count");
        if max_repeat > 0 && repeat >= max_repeat {
            self.set_register("queue_active", 0);
            self.set_register("acquiring", 0);
            return;
        }

        let sequence = self.packets.lock().get(&hash).cloned().unwrap_or_default();
        for (register, count) in &sequence.registers {
            self.set_register(register, *count);
        }
        self.set_register("acquiring", i64::from(sequence.flags.acquiring));

        let mut sequence_count = index as i64 + 1;
        let mut repeat = repeat;
        if index + 1 >= len {
            sequence_count = 0;
            repeat += 1;
        }
        self.set_register("queue_sequence_count", sequence_count);
        self.set_register("queue_repeat_count", repeat);
        self.executed.fetch_add(1, Ordering::Relaxed);

        if sequence.flags.image_number_inc {
            let image_number = self.register("image_number") + 1;
            self.set_register("image_number", image_number);
            debug!(image_number, "FPGA simulator: image number incremented");
        }
        if max_repeat > 0 && repeat >= max_repeat {
            self.set_register("queue_active", 0);
            self.set_register("acquiring", 0);
            debug!(repeat, "FPGA simulator: reached max repeat count");
        }
    }
}

#[async_trait]
impl TimingTransport for SimulatedFpga {
    async fn read(&self, register: &str) -> Result<i64> {
        self.check_connected()?;
        Ok(self.register(register))
    }

    async fn write(&self, register: &str, count: i64) -> Result<()> {
        self.check_connected()?;
        self.set_register(register, count);
        Ok(())
    }

    async fn monitor(&self, register: &str) -> Result<watch::Receiver<i64>> {
        self.check_connected()?;
        let mut registers = self.registers.lock();
        let tx = registers
            .entry(register.to_string())
            .or_insert_with(|| watch::channel(0).0);
        Ok(tx.subscribe())
    }

    async fn cached_packets(&self) -> Result<Vec<String>> {
        self.check_connected()?;
        Ok(self.packets.lock().keys().cloned().collect())
    }

    async fn upload_packet(&self, hash: &str, packet: &[u8]) -> Result<()> {
        self.check_connected()?;
        let injected = self
            .upload_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            bail!("packet upload timed out");
        }
        let sequence = Sequence::decode(packet).map_err(|e| anyhow!("bad packet: {e}"))?;
        if sequence.id() != hash {
            bail!("packet hash mismatch for {hash}");
        }
        self.packets.lock().insert(hash.to_string(), sequence);
        self.uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_queue(&self, hashes: &[String]) -> Result<()> {
        self.check_connected()?;
        {
            let packets = self.packets.lock();
            if let Some(missing) = hashes.iter().find(|h| !packets.contains_key(*h)) {
                bail!("queue refers to packet {missing} that is not cached");
            }
        }
        *self.queue.lock() = hashes.to_vec();
        self.set_register("queue_length", hashes.len() as i64);
        Ok(())
    }

    async fn queue_hash(&self) -> Result<String> {
        self.check_connected()?;
        Ok(queue_hash(&self.queue.lock()))
    }
}

impl Drop for SimulatedFpga {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
