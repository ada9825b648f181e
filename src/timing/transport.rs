//! Timing-system transport.
//!
//! The controller never talks to the FPGA directly; it goes through a
//! [`TimingTransport`]. A channel-access client implements this against the
//! `<DOMAIN>:TIMING.registers.<name>.count` process variables and the packet
//! endpoint; [`super::simulator::SimulatedFpga`] implements it in memory.
//!
//! # Contract
//! - Register access is by register name; the transport maps names to PVs.
//! - `upload_packet` is idempotent: uploading a packet that is already
//!   cached is not an error.
//! - `load_queue` replaces the queue index and blocks until acknowledged.
//! - All methods are async, `&self`, and use `anyhow::Result` like the other
//!   hardware capability traits.
//!
//! Callers wrap transport calls in a [`RetryPolicy`]: a failed call is
//! repeated with exponential backoff until `max_attempts` is reached.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Retry settings for transport operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Last error of an operation that failed on every attempt.
#[derive(Debug)]
pub struct RetriesExhausted {
    /// Attempts made
    pub attempts: u32,
    /// Error of the last attempt
    pub error: anyhow::Error,
}

impl RetryPolicy {
    /// A single attempt.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1_u32 << attempt.saturating_sub(1).min(16))
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        mut operation: F,
    ) -> std::result::Result<T, RetriesExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts.max(1) => {
                    warn!(attempt, "{what} failed, giving up: {error}");
                    return Err(RetriesExhausted {
                        attempts: attempt,
                        error,
                    });
                }
                Err(e) => {
                    let backoff = self.backoff(attempt);
                    warn!(attempt, ?backoff, "{what} failed, retrying: {e}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Process-variable name of a register count.
pub fn pv_name(domain: &str, register: &str) -> String {
    format!("{domain}:TIMING.registers.{register}.count")
}

/// Access to FPGA registers and the sequence packet cache.
#[async_trait]
pub trait TimingTransport: Send + Sync {
    /// Read a register count.
    async fn read(&self, register: &str) -> Result<i64>;

    /// Write a register count.
    async fn write(&self, register: &str, count: i64) -> Result<()>;

    /// Subscribe to count changes of a register.
    async fn monitor(&self, register: &str) -> Result<watch::Receiver<i64>>;

    /// Hashes of all sequence packets cached on the device.
    async fn cached_packets(&self) -> Result<Vec<String>>;

    /// Store a sequence packet under its hash.
    async fn upload_packet(&self, hash: &str, packet: &[u8]) -> Result<()>;

    /// Replace the queue with the given packet hashes.
    async fn load_queue(&self, hashes: &[String]) -> Result<()>;

    /// Hash of the queue currently loaded on the device.
    async fn queue_hash(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = policy
            .run("read", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(anyhow::anyhow!("busy"));
                }
                Ok::<_, anyhow::Error>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let err = RetryPolicy::never()
            .run("read", || async { Err::<(), _>(anyhow::anyhow!("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[test]
    fn test_pv_name() {
        assert_eq!(
            pv_name("BIOCARS", "image_number"),
            "BIOCARS:TIMING.registers.image_number.count"
        );
    }
}
