//! Diagnostics recorder.
//!
//! Samples scalar channels (beam current, photodiodes, temperatures) into
//! ring buffers and, when a scan point finishes, reduces the samples taken
//! during that point to mean, standard deviation and count.

use crate::hardware::Readable;
use crate::observable::{now, Monitored, Timestamp, ValueEq};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Reduction of one channel over one scan point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub mean: f64,
    pub stdev: f64,
    pub count: usize,
}

impl Aggregate {
    /// Mean and population standard deviation; NaN when there are no samples.
    pub fn of(values: &[f64]) -> Self {
        let count = values.len();
        if count == 0 {
            return Self {
                mean: f64::NAN,
                stdev: f64::NAN,
                count,
            };
        }
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        Self {
            mean,
            stdev: variance.sqrt(),
            count,
        }
    }
}

/// Diagnostics of one finished scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDiagnostics {
    pub point: usize,
    pub started: Timestamp,
    pub finished: Timestamp,
    pub channels: BTreeMap<String, Aggregate>,
}

impl ValueEq for PointDiagnostics {
    fn value_eq(&self, other: &Self) -> bool {
        self.point == other.point
            && self.started.value_eq(&other.started)
            && self.finished.value_eq(&other.finished)
    }
}

type Buffers = BTreeMap<String, VecDeque<(Timestamp, f64)>>;

/// Ring buffers for a set of scalar channels.
pub struct DiagnosticsRecorder {
    channels: Vec<(String, Arc<dyn Readable>)>,
    buffers: Arc<Mutex<Buffers>>,
    capacity: Arc<AtomicUsize>,
    min_capacity: usize,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    results: Mutex<BTreeMap<usize, PointDiagnostics>>,
    finished: Monitored<Option<PointDiagnostics>>,
}

impl DiagnosticsRecorder {
    /// Record `channels` every `interval`, keeping at least `min_capacity` samples each.
    pub fn new(
        channels: Vec<(String, Arc<dyn Readable>)>,
        interval: Duration,
        min_capacity: usize,
    ) -> Self {
        let buffers = channels
            .iter()
            .map(|(name, _)| (name.clone(), VecDeque::new()))
            .collect();
        let min_capacity = min_capacity.max(1);
        Self {
            channels,
            buffers: Arc::new(Mutex::new(buffers)),
            capacity: Arc::new(AtomicUsize::new(min_capacity)),
            min_capacity,
            interval,
            task: Mutex::new(None),
            results: Mutex::new(BTreeMap::new()),
            finished: Monitored::new("diagnostics", "finished", None),
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Size the buffers so `points` scan points of `point_duration` fit.
    pub fn size_for(&self, points: usize, point_duration: Duration) {
        let per_point = (point_duration.as_secs_f64() / self.interval.as_secs_f64().max(1e-6)).ceil();
        let needed = (per_point as usize).saturating_add(1).saturating_mul(points);
        let capacity = needed.max(self.min_capacity);
        self.capacity.store(capacity, Ordering::SeqCst);
        debug!(capacity, "diagnostics buffer sized");
    }

    /// Event fired with the diagnostics of each finished point.
    pub fn finished(&self) -> &Monitored<Option<PointDiagnostics>> {
        &self.finished
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start sampling in a background task.
    pub fn start(&self) {
        if self.channels.is_empty() {
            return;
        }
        let channels = self.channels.clone();
        let buffers = Arc::clone(&self.buffers);
        let capacity = Arc::clone(&self.capacity);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for (name, source) in &channels {
                    match source.read().await {
                        Ok(value) => {
                            push(&mut buffers.lock(), name, now(), value, capacity.load(Ordering::SeqCst))
                        }
                        Err(e) => trace!(channel = %name, "diagnostics read failed: {e}"),
                    }
                }
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!(channels = self.channels.len(), ?interval, "diagnostics recording started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("diagnostics recording stopped");
        }
    }

    /// Add a sample by hand.
    pub fn record(&self, channel: &str, time: Timestamp, value: f64) {
        push(&mut self.buffers.lock(), channel, time, value, self.capacity());
    }

    /// Samples of `channel` taken within `[started, finished]`.
    pub fn samples(&self, channel: &str, started: Timestamp, finished: Timestamp) -> Vec<f64> {
        self.buffers
            .lock()
            .get(channel)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|(t, _)| *t >= started && *t <= finished)
                    .map(|(_, v)| *v)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Close point `i` and publish its aggregates.
    pub fn finish_point(&self, i: usize, started: Timestamp, finished: Timestamp) -> PointDiagnostics {
        let channels = self
            .channel_names()
            .into_iter()
            .map(|name| {
                let aggregate = Aggregate::of(&self.samples(&name, started, finished));
                (name, aggregate)
            })
            .collect();
        let diagnostics = PointDiagnostics {
            point: i,
            started,
            finished,
            channels,
        };
        self.results.lock().insert(i, diagnostics.clone());
        self.finished.set(Some(diagnostics.clone()));
        diagnostics
    }

    /// Aggregates of a finished point.
    pub fn point(&self, i: usize) -> Option<PointDiagnostics> {
        self.results.lock().get(&i).cloned()
    }

    /// Forget samples and results (new dataset).
    pub fn clear(&self) {
        for buffer in self.buffers.lock().values_mut() {
            buffer.clear();
        }
        self.results.lock().clear();
    }
}

impl Drop for DiagnosticsRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn push(buffers: &mut Buffers, channel: &str, time: Timestamp, value: f64, capacity: usize) {
    let buffer = buffers.entry(channel.to_string()).or_default();
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back((time, value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedReadable;

    fn recorder(capacity: usize) -> DiagnosticsRecorder {
        let current: Arc<dyn Readable> = Arc::new(SimulatedReadable::new(100.0, 0.0));
        DiagnosticsRecorder::new(
            vec![("ring_current".into(), current)],
            Duration::from_millis(5),
            capacity,
        )
    }

    #[test]
    fn test_aggregate() {
        let a = Aggregate::of(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(a.mean, 2.5);
        assert!((a.stdev - 1.118_033_988_7).abs() < 1e-9);
        assert_eq!(a.count, 4);
        let empty = Aggregate::of(&[]);
        assert!(empty.mean.is_nan());
        assert_eq!(empty.count, 0);
    }

    #[test]
    fn test_finish_point_uses_samples_in_window() {
        let recorder = recorder(100);
        for (t, v) in [(1.0, 10.0), (2.0, 20.0), (3.0, 30.0), (4.0, 40.0)] {
            recorder.record("ring_current", t, v);
        }
        let point = recorder.finish_point(0, 2.0, 3.0);
        assert_eq!(point.channels["ring_current"].mean, 25.0);
        assert_eq!(point.channels["ring_current"].count, 2);
        assert_eq!(recorder.point(0), Some(point.clone()));
        assert_eq!(recorder.finished().get(), Some(point));
    }

    #[test]
    fn test_ring_drops_oldest() {
        let recorder = recorder(3);
        for t in 0..5 {
            recorder.record("ring_current", f64::from(t), f64::from(t));
        }
        assert_eq!(recorder.samples("ring_current", 0.0, 10.0), vec![2.0, 3.0, 4.0]);
        recorder.size_for(10, Duration::from_millis(50));
        assert_eq!(recorder.capacity(), 110);
    }

    #[tokio::test]
    async fn test_sampling_task_fills_buffer() {
        let recorder = recorder(1000);
        let started = now();
        recorder.start();
        assert!(recorder.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;
        recorder.stop();
        let point = recorder.finish_point(0, started, now());
        let current = point.channels["ring_current"];
        assert!(current.count >= 2);
        assert_eq!(current.mean, 100.0);
    }
}
