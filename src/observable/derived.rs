//! Derived (computed) attributes.
//!
//! A derived value lists its inputs explicitly and recomputes through a pure
//! function whenever one of them changes. The output is itself a
//! [`Monitored`] value, so it can feed further derived values or handlers.

use super::{HandlerId, Monitored, Observed, Reference, ValueEq};
use parking_lot::Mutex;
use std::sync::Arc;

type Calculate<T> = Arc<dyn Fn() -> T + Send + Sync>;
type Setter<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A computed attribute that tracks its inputs.
pub struct Derived<T>
where
    T: Clone + Send + Sync + ValueEq + 'static,
{
    output: Monitored<T>,
    calculate: Calculate<T>,
    inputs: Vec<Reference>,
    subscriptions: Mutex<Vec<(Arc<dyn Observed>, HandlerId)>>,
    setter: Option<Setter<T>>,
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + ValueEq + 'static,
{
    /// Create a derived value from its inputs and calculate function.
    ///
    /// The function is evaluated once immediately to seed the output.
    pub fn new<F>(
        object: impl Into<String>,
        attribute: impl Into<String>,
        inputs: Vec<Arc<dyn Observed>>,
        calculate: F,
    ) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let calculate: Calculate<T> = Arc::new(calculate);
        let output = Monitored::new(object, attribute, calculate());
        let references = inputs.iter().map(|i| i.observed_reference()).collect();

        let mut subscriptions = Vec::with_capacity(inputs.len());
        for input in inputs {
            let out = output.clone();
            let calc = Arc::clone(&calculate);
            let id = input.on_change(Arc::new(move |time| {
                out.set_if_changed_at(time, calc());
            }));
            subscriptions.push((input, id));
        }

        Self {
            output,
            calculate,
            inputs: references,
            subscriptions: Mutex::new(subscriptions),
            setter: None,
        }
    }

    /// Attach a setter. Assigning the derived value calls it; the setter decides
    /// how to push the value back into the inputs.
    pub fn with_setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.output.get()
    }

    /// Assign through the setter. Returns false for read-only derived values.
    pub fn set(&self, value: T) -> bool {
        match &self.setter {
            Some(setter) => {
                setter(value);
                true
            }
            None => false,
        }
    }

    /// Force a re-evaluation, e.g. after an input that is not observable changed.
    pub fn refresh(&self) -> bool {
        self.output.set_if_changed((self.calculate)())
    }

    /// The monitored output, for handlers and chaining.
    pub fn output(&self) -> &Monitored<T> {
        &self.output
    }

    /// References this value depends on.
    pub fn inputs(&self) -> &[Reference] {
        &self.inputs
    }

    /// Stop tracking the inputs.
    pub fn detach(&self) {
        for (input, id) in self.subscriptions.lock().drain(..) {
            input.remove_on_change(id);
        }
    }
}

impl<T> Drop for Derived<T>
where
    T: Clone + Send + Sync + ValueEq + 'static,
{
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::Delivery;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_derived_recomputes() {
        let a = Monitored::new("scan", "a", 2_i64);
        let b = Monitored::new("scan", "b", 3_i64);
        let (ca, cb) = (a.clone(), b.clone());
        let product = Derived::new(
            "scan",
            "n",
            vec![Arc::new(a.clone()), Arc::new(b.clone())],
            move || ca.get() * cb.get(),
        );
        assert_eq!(product.get(), 6);
        a.set(4);
        assert_eq!(product.get(), 12);
        assert_eq!(product.inputs().len(), 2);
    }

    #[test]
    fn test_derived_fires_only_on_change() {
        let a = Monitored::new("x", "a", 1_i64);
        let ca = a.clone();
        let parity = Derived::new("x", "parity", vec![Arc::new(a.clone())], move || {
            ca.get() % 2
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        parity.output().add_handler(Delivery::Inline, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        a.set(3); // parity still 1
        a.set(4); // parity 0
        a.set(6); // parity still 0
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_derived_nan_is_stable() {
        let a = Monitored::new("x", "a", 0.0_f64);
        let ca = a.clone();
        let ratio = Derived::new("x", "ratio", vec![Arc::new(a.clone())], move || {
            ca.get() / 0.0 * 0.0
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        ratio.output().add_handler(Delivery::Inline, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        a.set(1.0);
        a.set(2.0);
        assert!(ratio.get().is_nan());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_derived_setter() {
        let a = Monitored::new("x", "a", 1_i64);
        let ca = a.clone();
        let wa = a.clone();
        let doubled = Derived::new("x", "doubled", vec![Arc::new(a.clone())], move || {
            ca.get() * 2
        })
        .with_setter(move |v| {
            wa.set(v / 2);
        });
        assert!(doubled.set(10));
        assert_eq!(a.get(), 5);
        assert_eq!(doubled.get(), 10);
    }

    #[test]
    fn test_detach_on_drop() {
        let a = Monitored::new("x", "a", 1_i64);
        {
            let ca = a.clone();
            let _d = Derived::new("x", "d", vec![Arc::new(a.clone())], move || ca.get());
            assert_eq!(a.handler_count(), 1);
        }
        assert_eq!(a.handler_count(), 0);
    }
}
