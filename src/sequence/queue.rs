//! Sequencer queue.
//!
//! The FPGA runs a queue of sequences over and over. Its position is
//! `queue_repeat_count * queue_length + queue_sequence_count`; divided by
//! `sequences_per_scan_point` that is the scan point being executed.
//!
//! Uploads go through a lock: starting the queue while an upload is in flight
//! waits for the upload to finish.

use super::{queue_hash, Sequence};
use crate::error::{AppResult, DaqError};
use crate::observable::Monitored;
use crate::timing::{RetryPolicy, TimingSystem};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of loading a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Loaded { uploaded: usize, total: usize },
    Cancelled,
}

struct LoadedQueue {
    sequences: Vec<Sequence>,
    ids: Vec<String>,
}

/// Loads sequences into the FPGA and positions the queue.
pub struct SequencerQueue {
    timing: Arc<TimingSystem>,
    upload_lock: Mutex<()>,
    retry: RetryPolicy,
    cancelled: AtomicBool,
    generating_packets: Monitored<bool>,
    sequences_loading: Monitored<bool>,
    sequences_per_scan_point: AtomicUsize,
    loaded: parking_lot::Mutex<LoadedQueue>,
}

impl SequencerQueue {
    /// Queue on `timing`; uploads are retried under `retry`.
    pub fn new(timing: Arc<TimingSystem>, retry: RetryPolicy) -> Self {
        Self {
            timing,
            upload_lock: Mutex::new(()),
            retry,
            cancelled: AtomicBool::new(false),
            generating_packets: Monitored::new("sequencer", "generating_packets", false),
            sequences_loading: Monitored::new("sequencer", "sequences_loading", false),
            sequences_per_scan_point: AtomicUsize::new(1),
            loaded: parking_lot::Mutex::new(LoadedQueue {
                sequences: Vec::new(),
                ids: Vec::new(),
            }),
        }
    }

    pub fn timing(&self) -> &Arc<TimingSystem> {
        &self.timing
    }

    /// Make a running upload return after the current packet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True while sequence packets are being encoded and sent.
    pub fn generating_packets(&self) -> &Monitored<bool> {
        &self.generating_packets
    }

    pub fn sequences_loading(&self) -> &Monitored<bool> {
        &self.sequences_loading
    }

    /// Sequences executed for each scan point of the loaded queue.
    pub fn sequences_per_scan_point(&self) -> usize {
        self.sequences_per_scan_point.load(Ordering::SeqCst)
    }

    /// Sequences in the loaded queue.
    pub fn queue_length(&self) -> usize {
        self.loaded.lock().ids.len()
    }

    /// Upload missing packets, then the queue index.
    ///
    /// Packets already cached on the device are skipped, so repeating the
    /// call with the same sequences uploads nothing.
    pub async fn set_queue_sequences(
        &self,
        sequences: &[Sequence],
        sequences_per_scan_point: usize,
    ) -> AppResult<UploadOutcome> {
        if sequences_per_scan_point == 0 || sequences.len() % sequences_per_scan_point != 0 {
            return Err(DaqError::Configuration(format!(
                "{} sequences do not split into points of {sequences_per_scan_point}",
                sequences.len()
            )));
        }
        let _guard = self.upload_lock.lock().await;
        self.cancelled.store(false, Ordering::SeqCst);
        self.sequences_loading.set_if_changed(true);
        let outcome = self.upload(sequences).await;
        self.generating_packets.set_if_changed(false);
        self.sequences_loading.set_if_changed(false);

        if let Ok(UploadOutcome::Loaded { uploaded, total }) = &outcome {
            self.sequences_per_scan_point
                .store(sequences_per_scan_point, Ordering::SeqCst);
            info!(uploaded, total, "sequencer queue loaded");
        }
        outcome
    }

    async fn upload(&self, sequences: &[Sequence]) -> AppResult<UploadOutcome> {
        let transport = Arc::clone(self.timing.transport());
        let ids: Vec<String> = sequences.iter().map(Sequence::id).collect();

        let cached: HashSet<String> = self
            .with_retry("list cached packets", || transport.cached_packets())
            .await?
            .into_iter()
            .collect();

        self.generating_packets.set_if_changed(true);
        let mut sent = HashSet::new();
        for (sequence, id) in sequences.iter().zip(&ids) {
            if cached.contains(id) || !sent.insert(id.clone()) {
                continue;
            }
            if self.cancelled.load(Ordering::SeqCst) {
                info!(uploaded = sent.len() - 1, "sequence upload cancelled");
                return Ok(UploadOutcome::Cancelled);
            }
            let packet = sequence.encode();
            self.with_retry("upload packet", || transport.upload_packet(id, &packet))
                .await?;
            debug!(packet = %id, "packet uploaded");
        }
        self.generating_packets.set_if_changed(false);

        self.with_retry("load queue", || transport.load_queue(&ids))
            .await?;
        let total = ids.len();
        *self.loaded.lock() = LoadedQueue {
            sequences: sequences.to_vec(),
            ids,
        };
        Ok(UploadOutcome::Loaded {
            uploaded: sent.len(),
            total,
        })
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, operation: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.retry
            .run(what, operation)
            .await
            .map_err(|e| DaqError::SequenceUploadFailed {
                attempts: e.attempts,
                reason: format!("{what}: {}", e.error),
            })
    }

    /// Reload the queue if the device holds a different one.
    ///
    /// Returns whether a reload was needed.
    pub async fn ensure_queue(&self) -> AppResult<bool> {
        let (sequences, expected) = {
            let loaded = self.loaded.lock();
            (loaded.sequences.clone(), queue_hash(&loaded.ids))
        };
        if sequences.is_empty() {
            return Err(DaqError::Configuration("no sequences loaded".into()));
        }
        let transport = Arc::clone(self.timing.transport());
        let actual = self
            .with_retry("read queue hash", || transport.queue_hash())
            .await?;
        if actual == expected {
            return Ok(false);
        }
        warn!("queue on the device differs from the loaded one, reloading");
        let spp = self.sequences_per_scan_point();
        match self.set_queue_sequences(&sequences, spp).await? {
            UploadOutcome::Loaded { .. } => Ok(true),
            UploadOutcome::Cancelled => Ok(false),
        }
    }

    /// Start or stop execution. Waits for an upload in flight.
    pub async fn set_queue_active(&self, active: bool) -> AppResult<()> {
        let _guard = self.upload_lock.lock().await;
        self.timing
            .set_count("queue_active", i64::from(active))
            .await?;
        debug!(active, "queue active");
        Ok(())
    }

    /// Whether the device is executing the queue.
    pub async fn queue_active(&self) -> AppResult<bool> {
        Ok(self.timing.read_count("queue_active").await? != 0)
    }

    fn layout(&self) -> AppResult<(usize, usize)> {
        let len = self.queue_length();
        if len == 0 {
            return Err(DaqError::Configuration("no sequences loaded".into()));
        }
        Ok((len, self.sequences_per_scan_point().max(1)))
    }

    /// Position the queue so the next executed sequence starts point `i`.
    pub async fn set_first_scan_point(&self, i: usize) -> AppResult<()> {
        let (len, spp) = self.layout()?;
        let total = i * spp;
        self.timing
            .set_count("queue_repeat_count", (total / len) as i64)
            .await?;
        self.timing
            .set_count("queue_sequence_count", (total % len) as i64)
            .await?;
        self.timing.set_count("image_number", i as i64).await?;
        debug!(point = i, "first scan point set");
        Ok(())
    }

    /// Stop the queue after the pass that contains point `i`.
    pub async fn set_last_scan_point(&self, i: usize) -> AppResult<()> {
        let (len, spp) = self.layout()?;
        let max_repeat = ((i + 1) * spp).div_ceil(len);
        self.timing
            .set_count("queue_max_repeat_count", max_repeat as i64)
            .await?;
        debug!(point = i, max_repeat, "last scan point set");
        Ok(())
    }

    /// Point currently executing, from the queue position.
    pub async fn current_scan_point(&self) -> AppResult<usize> {
        let (len, spp) = self.layout()?;
        let repeat = self.timing.read_count("queue_repeat_count").await?.max(0) as usize;
        let sequence = self.timing.read_count("queue_sequence_count").await?.max(0) as usize;
        Ok((repeat * len + sequence) / spp)
    }

    /// Completed points, as counted by the device.
    pub async fn image_number(&self) -> AppResult<usize> {
        Ok(self.timing.read_count("image_number").await?.max(0) as usize)
    }
}
