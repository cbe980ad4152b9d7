use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use sluice_core::error::{ensure_positive, Result, SluiceError};
use tracing::warn;

use crate::observer::ObserverList;

/// Receives `(from, to)` after every effective change of a [`Counter`].
pub trait CounterObserver: Send + Sync {
    fn on_value_changed(&self, counter: &Counter, from: i64, to: i64) -> Result<()>;
}

impl<F> CounterObserver for F
where
    F: Fn(&Counter, i64, i64) -> Result<()> + Send + Sync,
{
    fn on_value_changed(&self, counter: &Counter, from: i64, to: i64) -> Result<()> {
        self(counter, from, to)
    }
}

/// Thread-safe non-negative counter.
///
/// Updates clamp instead of wrapping: the value saturates at `i64::MAX` and
/// never drops below zero. Every mutator returns the magnitude actually
/// applied, which is smaller than requested when clamped.
pub struct Counter {
    value: AtomicI64,
    observers: ObserverList<dyn CounterObserver>,
}

impl Counter {
    pub fn new(initial: i64) -> Result<Self> {
        if initial < 0 {
            return Err(SluiceError::InvalidArgument(format!(
                "initial counter value must not be negative [value={}]",
                initial
            )));
        }
        Ok(Self {
            value: AtomicI64::new(initial),
            observers: ObserverList::new(),
        })
    }

    pub fn zero() -> Self {
        Self {
            value: AtomicI64::new(0),
            observers: ObserverList::new(),
        }
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    pub fn increase(&self, delta: i64) -> Result<i64> {
        ensure_positive(delta, "counter increase")?;
        Ok(self.add(delta))
    }

    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    pub fn decrease(&self, delta: i64) -> Result<i64> {
        ensure_positive(delta, "counter decrease")?;
        Ok(self.add(-delta))
    }

    pub fn observe(&self, observer: Arc<dyn CounterObserver>) {
        self.observers.add(observer);
    }

    pub fn unobserve(&self, observer: &Arc<dyn CounterObserver>) -> bool {
        self.observers.remove(observer)
    }

    fn add(&self, delta: i64) -> i64 {
        let mut from = self.value.load(Ordering::Acquire);
        loop {
            let to = clamp_target(from, delta);
            match self
                .value
                .compare_exchange_weak(from, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if from != to {
                        self.notify(from, to);
                    }
                    return (to - from).abs();
                }
                Err(actual) => from = actual,
            }
        }
    }

    fn notify(&self, from: i64, to: i64) {
        for observer in self.observers.snapshot().iter() {
            if let Err(e) = observer.on_value_changed(self, from, to) {
                warn!(from, to, error = %e, "Counter observer failed");
            }
        }
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter").field("value", &self.value()).finish()
    }
}

fn clamp_target(from: i64, delta: i64) -> i64 {
    match from.checked_add(delta) {
        Some(to) => to.max(0),
        None if delta > 0 => i64::MAX,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_negative_initial_rejected() {
        assert!(matches!(Counter::new(-1), Err(SluiceError::InvalidArgument(_))));
        assert_eq!(Counter::new(5).unwrap().value(), 5);
    }

    #[test]
    fn test_increase_and_decrease() {
        let counter = Counter::zero();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increase(4).unwrap(), 4);
        assert_eq!(counter.value(), 5);
        assert_eq!(counter.decrease(2).unwrap(), 2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn test_non_positive_delta_rejected() {
        let counter = Counter::zero();
        assert!(matches!(counter.increase(0), Err(SluiceError::InvalidArgument(_))));
        assert!(matches!(counter.decrease(-3), Err(SluiceError::InvalidArgument(_))));
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_saturates_at_max() {
        let counter = Counter::zero();
        assert_eq!(counter.increase(i64::MAX).unwrap(), i64::MAX);
        assert_eq!(counter.increase(1).unwrap(), 0);
        assert_eq!(counter.value(), i64::MAX);
    }

    #[test]
    fn test_clamps_at_zero() {
        let counter = Counter::new(3).unwrap();
        assert_eq!(counter.decrease(10).unwrap(), 3);
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_observers_see_changes() {
        let counter = Counter::zero();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        counter.observe(Arc::new(move |_: &Counter, from: i64, to: i64| -> Result<()> {
            sink.lock().unwrap().push((from, to));
            Ok(())
        }));

        counter.increase(2).unwrap();
        counter.decrease(5).unwrap();
        counter.decrement();

        // The last decrement was clamped to a no-op and not reported.
        assert_eq!(*seen.lock().unwrap(), vec![(0, 2), (2, 0)]);
    }

    #[test]
    fn test_failing_observer_is_isolated() {
        let counter = Counter::zero();
        let calls = Arc::new(AtomicI64::new(0));
        let failing: Arc<dyn CounterObserver> =
            Arc::new(|_: &Counter, _: i64, _: i64| -> Result<()> {
            Err(SluiceError::IllegalState("boom".into()))
        });
        let counting = calls.clone();
        counter.observe(failing.clone());
        counter.observe(Arc::new(move |_: &Counter, _: i64, _: i64| -> Result<()> {
            counting.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert_eq!(counter.increment(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(counter.unobserve(&failing));
        counter.increment();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_updates_are_linearizable() {
        let counter = Arc::new(Counter::zero());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.value(), 8000);
    }
}
