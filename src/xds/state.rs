//! Publish-by-replacement holder for immutable snapshot inputs and outputs.

use std::sync::{Arc, PoisonError, RwLock};

/// Holds the latest published value.
///
/// Writers replace the whole `Arc` under a short write lock; readers clone the
/// `Arc` and keep a consistent view for as long as they need it.
#[derive(Debug)]
pub struct StateHolder<T> {
    current: RwLock<Arc<T>>,
}

impl<T> StateHolder<T> {
    pub fn new(initial: T) -> Self {
        Self { current: RwLock::new(Arc::new(initial)) }
    }

    /// Latest published value
    pub fn current(&self) -> Arc<T> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the value, returning the one it superseded
    pub fn publish(&self, value: T) -> Arc<T> {
        self.publish_arc(Arc::new(value))
    }

    pub fn publish_arc(&self, value: Arc<T>) -> Arc<T> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, value)
    }
}

impl<T: Default> Default for StateHolder<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
