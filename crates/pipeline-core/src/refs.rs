//! Reference-counted handles for off-heap-style resources.
//!
//! Buffers and decoded images are shared across thread handoffs; the rule
//! is that a callback receiving a handle must clone it before retaining it
//! past the callback's return. Cloning increments the count, dropping
//! decrements it, and the underlying resource is released through its
//! releaser when the count reaches zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

struct Shared<T> {
    value: Mutex<Option<T>>,
    count: AtomicUsize,
    releaser: Box<dyn Fn(T) + Send + Sync>,
}

/// An owning, reference-counted handle to a resource of type `T`.
///
/// Unlike a bare `Arc<T>`, the handle carries an injected releaser (e.g.
/// returning a buffer to its pool) that runs exactly once, when the last
/// handle is dropped. A live handle always refers to a live resource, so
/// access never fails.
pub struct CloseableRef<T: Send> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> CloseableRef<T> {
    /// Wraps `value`; the resource is simply dropped when the count hits
    /// zero.
    pub fn of(value: T) -> CloseableRef<T> {
        CloseableRef::with_releaser(value, drop)
    }

    /// Wraps `value` with a custom releaser invoked once at count zero.
    pub fn with_releaser(
        value: T,
        releaser: impl Fn(T) + Send + Sync + 'static,
    ) -> CloseableRef<T> {
        CloseableRef {
            shared: Arc::new(Shared {
                value: Mutex::new(Some(value)),
                count: AtomicUsize::new(1),
                releaser: Box::new(releaser),
            }),
        }
    }

    /// Borrows the underlying resource.
    pub fn get(&self) -> MappedMutexGuard<'_, T> {
        MutexGuard::map(self.shared.value.lock(), |value| {
            // A live handle keeps the count above zero, so the value is
            // present until the last drop.
            value.as_mut().unwrap_or_else(|| unreachable!("live CloseableRef with released value"))
        })
    }

    /// Number of live handles sharing the resource.
    pub fn ref_count(&self) -> usize {
        self.shared.count.load(Ordering::Acquire)
    }

    /// Whether `a` and `b` share the same underlying resource.
    pub fn shares_with(a: &CloseableRef<T>, b: &CloseableRef<T>) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }
}

impl<T: Send> Clone for CloseableRef<T> {
    fn clone(&self) -> CloseableRef<T> {
        self.shared.count.fetch_add(1, Ordering::AcqRel);
        CloseableRef {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send> Drop for CloseableRef<T> {
    fn drop(&mut self) {
        if self.shared.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(value) = self.shared.value.lock().take() {
                (self.shared.releaser)(value);
            }
        }
    }
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for CloseableRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseableRef")
            .field("count", &self.ref_count())
            .field("value", &*self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releaser_runs_once_at_zero() {
        let released = Arc::new(AtomicUsize::new(0));
        let released_in_releaser = released.clone();
        let first = CloseableRef::with_releaser(vec![1u8, 2, 3], move |_buf| {
            released_in_releaser.fetch_add(1, Ordering::SeqCst);
        });
        let second = first.clone();
        assert_eq!(first.ref_count(), 2);

        drop(first);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(second.get().len(), 3);

        drop(second);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_resource() {
        let first = CloseableRef::of(42u32);
        let second = first.clone();
        assert!(CloseableRef::shares_with(&first, &second));
        assert_eq!(*second.get(), 42);

        let unrelated = CloseableRef::of(42u32);
        assert!(!CloseableRef::shares_with(&first, &unrelated));
    }
}
