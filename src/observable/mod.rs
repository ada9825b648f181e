//! Observable Properties
//!
//! Reactive attribute layer shared by the scheduler, the logfile writer and any
//! external observer (GUI panels subscribe to the same references).
//!
//! # Model
//!
//! - A [`Reference`] names an attribute as `(object, attribute)`.
//! - A [`Monitored<T>`] holds the current value of one reference. Writing it fans
//!   out an [`Event`] `(time, value, reference)` to every registered handler.
//!   Reading is synchronous and cheap.
//! - A [`Derived<T>`] declares its input references and a pure calculate function.
//!   It is re-evaluated whenever an input changes and fires only when its output
//!   changes by content ([`ValueEq`], NaN-safe for floats, element-wise for vectors).
//! - Handlers run inline in the producing thread unless they opt into
//!   [`Delivery::Thread`].
//! - Duplicate consecutive events (same value, same time) are suppressed and
//!   out-of-order events (older than the last delivered one) are dropped.
//!
//! Async consumers can use [`Monitored::subscribe`], which hands out a
//! `tokio::sync::watch` receiver like the rest of the crate's parameters.
//!
//! # Example
//!
//! ```rust,ignore
//! let count = Monitored::new("timing", "image_number", 0_i64);
//! count.add_handler(Delivery::Inline, |event| {
//!     tracing::info!(value = event.value, "image number changed");
//! });
//! count.set(1);
//! ```

pub mod derived;
pub mod graph;

pub use derived::Derived;
pub use graph::DependencyGraph;

use parking_lot::{ReentrantMutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Seconds since the Unix epoch, with microsecond resolution.
pub type Timestamp = f64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

// =============================================================================
// Content equality
// =============================================================================

/// Equality by content, used to decide whether a derived value changed.
///
/// Unlike `PartialEq`, two NaN floats compare equal so that a derived value
/// that stays NaN does not fire on every input change.
pub trait ValueEq {
    /// Whether `self` and `other` hold the same content.
    fn value_eq(&self, other: &Self) -> bool;
}

impl ValueEq for f64 {
    fn value_eq(&self, other: &Self) -> bool {
        (self.is_nan() && other.is_nan()) || self == other
    }
}

impl ValueEq for f32 {
    fn value_eq(&self, other: &Self) -> bool {
        (self.is_nan() && other.is_nan()) || self == other
    }
}

macro_rules! value_eq_by_partial_eq {
    ($($t:ty),*) => {
        $(impl ValueEq for $t {
            fn value_eq(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

value_eq_by_partial_eq!(bool, i32, i64, u32, u64, usize, String, &'static str);

impl<T: ValueEq> ValueEq for Option<T> {
    fn value_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.value_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: ValueEq> ValueEq for Vec<T> {
    fn value_eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.value_eq(b))
    }
}

impl<K: Ord, V: ValueEq> ValueEq for BTreeMap<K, V> {
    fn value_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other)
                .all(|((ka, va), (kb, vb))| ka == kb && va.value_eq(vb))
    }
}

impl<A: ValueEq, B: ValueEq> ValueEq for (A, B) {
    fn value_eq(&self, other: &Self) -> bool {
        self.0.value_eq(&other.0) && self.1.value_eq(&other.1)
    }
}

// =============================================================================
// References and events
// =============================================================================

/// Name of a monitored attribute: `(object, attribute)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// Owning component, e.g. `timing_system`
    pub object: String,
    /// Attribute on that component, e.g. `image_number.count`
    pub attribute: String,
}

impl Reference {
    /// Create a reference.
    pub fn new(object: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.attribute)
    }
}

/// A change notification delivered to handlers.
#[derive(Debug, Clone)]
pub struct Event<T> {
    /// Time of the change
    pub time: Timestamp,
    /// New value
    pub value: T,
    /// Attribute that changed
    pub reference: Reference,
}

/// Where a handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// In the thread that produced the change
    Inline,
    /// On a freshly spawned thread (long-running handlers, GUI updates)
    Thread,
}

/// Identifier returned by `add_handler`, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&Event<T>) + Send + Sync>;

struct HandlerEntry<T> {
    id: HandlerId,
    delivery: Delivery,
    handler: Handler<T>,
}

struct MonitoredState<T> {
    value: T,
    last_time: Timestamp,
}

struct MonitoredInner<T> {
    reference: Reference,
    state: RwLock<MonitoredState<T>>,
    handlers: RwLock<Vec<HandlerEntry<T>>>,
    sender: watch::Sender<T>,
    next_id: AtomicU64,
    // Serialises writers so events for one reference leave in timestamp order.
    write_lock: ReentrantMutex<()>,
}

// =============================================================================
// Monitored<T>
// =============================================================================

/// A monitored attribute value with event fan-out.
///
/// Clones share the same underlying value and handler list.
pub struct Monitored<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<MonitoredInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Monitored<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> fmt::Debug for Monitored<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitored")
            .field("reference", &self.inner.reference)
            .field("value", &self.inner.state.read().value)
            .finish()
    }
}

impl<T> Monitored<T>
where
    T: Clone + Send + Sync + ValueEq + 'static,
{
    /// Create a monitored attribute with an initial value.
    pub fn new(object: impl Into<String>, attribute: impl Into<String>, initial: T) -> Self {
        let (sender, _) = watch::channel(initial.clone());
        Self {
            inner: Arc::new(MonitoredInner {
                reference: Reference::new(object, attribute),
                state: RwLock::new(MonitoredState {
                    value: initial,
                    last_time: f64::NEG_INFINITY,
                }),
                handlers: RwLock::new(Vec::new()),
                sender,
                next_id: AtomicU64::new(1),
                write_lock: ReentrantMutex::new(()),
            }),
        }
    }

    /// The reference this attribute is published under.
    pub fn reference(&self) -> &Reference {
        &self.inner.reference
    }

    /// Current value (clone).
    pub fn get(&self) -> T {
        self.inner.state.read().value.clone()
    }

    /// Time of the last delivered change.
    pub fn last_time(&self) -> Timestamp {
        self.inner.state.read().last_time
    }

    /// Write a value now. Returns whether an event was delivered.
    pub fn set(&self, value: T) -> bool {
        self.set_at(now(), value)
    }

    /// Write a value with an explicit timestamp.
    ///
    /// Events older than the last delivered one are dropped, and an event with
    /// the same value and the same time as the previous one is suppressed.
    pub fn set_at(&self, time: Timestamp, value: T) -> bool {
        self.write(time, value, false)
    }

    /// Write only if the content differs from the current value.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.write(now(), value, true)
    }

    /// Same as [`Monitored::set_if_changed`] with an explicit timestamp.
    pub fn set_if_changed_at(&self, time: Timestamp, value: T) -> bool {
        self.write(time, value, true)
    }

    fn write(&self, time: Timestamp, value: T, only_on_change: bool) -> bool {
        let _guard = self.inner.write_lock.lock();
        {
            let mut state = self.inner.state.write();
            if time < state.last_time {
                debug!(
                    reference = %self.inner.reference,
                    time,
                    last_time = state.last_time,
                    "dropping out-of-order event"
                );
                return false;
            }
            let same = state.value.value_eq(&value);
            if same && (only_on_change || time == state.last_time) {
                return false;
            }
            state.value = value.clone();
            state.last_time = time;
        }
        self.inner.sender.send_replace(value.clone());
        self.dispatch(Event {
            time,
            value,
            reference: self.inner.reference.clone(),
        });
        true
    }

    fn dispatch(&self, event: Event<T>) {
        let handlers: Vec<(Delivery, Handler<T>)> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|entry| (entry.delivery, Arc::clone(&entry.handler)))
            .collect();
        for (delivery, handler) in handlers {
            match delivery {
                Delivery::Inline => handler(&event),
                Delivery::Thread => {
                    let event = event.clone();
                    std::thread::spawn(move || handler(&event));
                }
            }
        }
    }

    /// Register an event handler.
    pub fn add_handler<F>(&self, delivery: Delivery, handler: F) -> HandlerId
    where
        F: Fn(&Event<T>) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.write().push(HandlerEntry {
            id,
            delivery,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a previously registered handler. Returns whether it was present.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|entry| entry.id != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Subscribe for async consumers.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.sender.subscribe()
    }
}

// =============================================================================
// Type-erased inputs for derived values
// =============================================================================

/// Something a [`Derived`] value can depend on.
pub trait Observed: Send + Sync {
    /// Reference of the input.
    fn observed_reference(&self) -> Reference;

    /// Call `notify` with the event time whenever the input changes.
    fn on_change(&self, notify: Arc<dyn Fn(Timestamp) + Send + Sync>) -> HandlerId;

    /// Undo [`Observed::on_change`].
    fn remove_on_change(&self, id: HandlerId);
}

impl<T> Observed for Monitored<T>
where
    T: Clone + Send + Sync + ValueEq + 'static,
{
    fn observed_reference(&self) -> Reference {
        self.reference().clone()
    }

    fn on_change(&self, notify: Arc<dyn Fn(Timestamp) + Send + Sync>) -> HandlerId {
        self.add_handler(Delivery::Inline, move |event| notify(event.time))
    }

    fn remove_on_change(&self, id: HandlerId) {
        self.remove_handler(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_monitored_basic() {
        let m = Monitored::new("timing", "image_number", 0_i64);
        assert_eq!(m.get(), 0);
        assert!(m.set(5));
        assert_eq!(m.get(), 5);
        assert_eq!(m.reference().to_string(), "timing.image_number");
    }

    #[test]
    fn test_handler_receives_event() {
        let m = Monitored::new("scan", "current", 0_i64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        m.add_handler(Delivery::Inline, move |event| {
            sink.lock().push((event.value, event.reference.attribute.clone()));
        });
        m.set_at(1.0, 3);
        m.set_at(2.0, 4);
        assert_eq!(
            *seen.lock(),
            vec![(3, "current".to_string()), (4, "current".to_string())]
        );
    }

    #[test]
    fn test_duplicate_and_out_of_order_suppressed() {
        let m = Monitored::new("scan", "current", 0_i64);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        m.add_handler(Delivery::Inline, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(m.set_at(10.0, 1));
        assert!(!m.set_at(10.0, 1), "duplicate must be suppressed");
        assert!(!m.set_at(9.0, 2), "older event must be dropped");
        assert!(m.set_at(11.0, 1), "same value at a later time is a new event");
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(m.get(), 1);
    }

    #[test]
    fn test_nan_safe_equality() {
        assert!(f64::NAN.value_eq(&f64::NAN));
        assert!(!1.0_f64.value_eq(&f64::NAN));
        assert!(vec![1.0, f64::NAN].value_eq(&vec![1.0, f64::NAN]));
        assert!(!vec![1.0].value_eq(&vec![1.0, 2.0]));
    }

    #[test]
    fn test_remove_handler() {
        let m = Monitored::new("a", "b", false);
        let id = m.add_handler(Delivery::Inline, |_| {});
        assert_eq!(m.handler_count(), 1);
        assert!(m.remove_handler(id));
        assert_eq!(m.handler_count(), 0);
    }

    #[test]
    fn test_thread_delivery() {
        let m = Monitored::new("a", "b", 0_i64);
        let (tx, rx) = std::sync::mpsc::channel();
        m.add_handler(Delivery::Thread, move |event| {
            let _ = tx.send((event.value, std::thread::current().id()));
        });
        m.set(7);
        let (value, thread) = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(value, 7);
        assert_ne!(thread, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_watch_subscription() {
        let m = Monitored::new("a", "b", 0_i64);
        let mut rx = m.subscribe();
        m.set(42);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 42);
    }
}
