use std::sync::{Arc, PoisonError, RwLock};

/// Copy-on-write observer list.
///
/// Notification iterates a snapshot, so observers may be added or removed
/// (even from inside a callback) without blocking the notifier.
pub struct ObserverList<T: ?Sized> {
    inner: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, observer: Arc<T>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(observer);
        *guard = Arc::new(next);
    }

    /// Remove by identity. Returns whether anything was removed.
    pub fn remove(&self, observer: &Arc<T>) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let target = Arc::as_ptr(observer) as *const ();
        let next: Vec<Arc<T>> = guard
            .iter()
            .filter(|o| Arc::as_ptr(o) as *const () != target)
            .cloned()
            .collect();
        let removed = next.len() != guard.len();
        if removed {
            *guard = Arc::new(next);
        }
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}
