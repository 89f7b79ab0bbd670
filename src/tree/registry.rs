//! Iterator registry.
//!
//! The enclosing session must be able to close every outstanding cursor
//! when its transaction ends. Each iterator registers a shared handle
//! here; `close_all` flips them at commit or rollback, after which any
//! further use of the cursor reports invalidation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Shared closed-flag of one open iterator
#[derive(Debug, Default)]
pub struct IterHandle {
    closed: AtomicBool,
}

impl IterHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Tracks every iterator opened against one tree
#[derive(Default)]
pub struct IteratorRegistry {
    handles: Mutex<Vec<Weak<IterHandle>>>,
}

impl IteratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a handle for a newly opened iterator
    pub fn register(&self) -> Arc<IterHandle> {
        let handle = Arc::new(IterHandle::default());
        let mut handles = self.handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        handles.push(Arc::downgrade(&handle));
        handle
    }

    /// Close every live iterator (commit and rollback path)
    pub fn close_all(&self) {
        let mut handles = self.handles.lock();
        for weak in handles.drain(..) {
            if let Some(handle) = weak.upgrade() {
                handle.close();
            }
        }
    }

    /// Number of iterators that are still open
    pub fn open_count(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        handles
            .iter()
            .filter_map(|weak| weak.upgrade())
            .filter(|handle| !handle.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_all_flips_live_handles() {
        let registry = IteratorRegistry::new();
        let h1 = registry.register();
        let h2 = registry.register();
        assert_eq!(registry.open_count(), 2);

        registry.close_all();
        assert!(h1.is_closed());
        assert!(h2.is_closed());
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_dropped_iterators_are_pruned() {
        let registry = IteratorRegistry::new();
        let h1 = registry.register();
        drop(registry.register());
        assert_eq!(registry.open_count(), 1);
        h1.close();
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_individual_close_is_idempotent() {
        let registry = IteratorRegistry::new();
        let h = registry.register();
        h.close();
        h.close();
        assert!(h.is_closed());
    }
}
