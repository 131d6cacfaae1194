//! Request-scoped resource registry.
//!
//! Anything a stage opens on behalf of a request is registered with the
//! request's [`ResourceScope`]. The lifecycle controller closes the scope on
//! every exit path, after the response has been handed to the transport.
//!
//! # Guarantees
//!
//! - `close()` is idempotent; only the first call releases anything
//! - Release is total: a panicking resource is logged and the rest are still released
//! - A resource acquired after close is released immediately
//! - Dropping the last handle releases whatever is still registered

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Something that must be released when the request is done with it.
pub trait Resource: Send {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Release the resource. Called at most once per registration.
    fn release(&mut self);
}

/// Adapts a closure into a [`Resource`].
struct Deferred<F> {
    name: &'static str,
    release: Option<F>,
}

impl<F> Resource for Deferred<F>
where
    F: FnOnce() + Send,
{
    fn name(&self) -> &str {
        self.name
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

struct ScopeInner {
    resources: Mutex<Vec<Box<dyn Resource>>>,
    closed: AtomicBool,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining = std::mem::take(
            self.resources
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !remaining.is_empty() {
            tracing::warn!(
                count = remaining.len(),
                "Resource scope dropped without close, releasing remaining resources"
            );
            release_all(remaining);
        }
    }
}

/// Cloneable handle to one request's resource registry.
#[derive(Clone)]
pub struct ResourceScope {
    inner: Arc<ScopeInner>,
}

impl ResourceScope {
    /// Create an empty, open scope
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                resources: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a resource for release when the scope closes
    pub fn acquire<R: Resource + 'static>(&self, resource: R) {
        self.acquire_boxed(Box::new(resource));
    }

    /// Register an already boxed resource
    pub fn acquire_boxed(&self, resource: Box<dyn Resource>) {
        let mut resources = self
            .inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.inner.closed.load(Ordering::Acquire) {
            drop(resources);
            tracing::warn!(
                resource = resource.name(),
                "Resource acquired after scope closed, releasing immediately"
            );
            release_all(vec![resource]);
            return;
        }

        tracing::trace!(resource = resource.name(), "Resource acquired");
        resources.push(resource);
    }

    /// Register a closure to run when the scope closes
    pub fn defer<F>(&self, name: &'static str, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.acquire(Deferred {
            name,
            release: Some(release),
        });
    }

    /// Release every registered resource.
    ///
    /// Returns the number of resources released by this call; zero on every
    /// call after the first.
    pub fn close(&self) -> usize {
        let drained = {
            let mut resources = self
                .inner
                .resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return 0;
            }
            std::mem::take(&mut *resources)
        };

        let count = drained.len();
        release_all(drained);
        tracing::trace!(released = count, "Resource scope closed");
        count
    }

    /// Whether `close()` has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of resources currently registered
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no resources are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceScope")
            .field("closed", &self.is_closed())
            .field("registered", &self.len())
            .finish()
    }
}

/// Release in reverse acquisition order, surviving panics.
fn release_all(resources: Vec<Box<dyn Resource>>) {
    for mut resource in resources.into_iter().rev() {
        if catch_unwind(AssertUnwindSafe(|| resource.release())).is_err() {
            tracing::error!(
                resource = resource.name(),
                "Resource panicked during release; continuing with remaining resources"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counted(Arc<AtomicUsize>);

    impl Resource for Counted {
        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploding;

    impl Resource for Exploding {
        #[allow(clippy::panic)] // Intentional panic for testing total release
        fn release(&mut self) {
            panic!("release failed");
        }
    }

    #[test]
    fn test_close_releases_everything_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let scope = ResourceScope::new();
        scope.acquire(Counted(Arc::clone(&released)));
        scope.acquire(Counted(Arc::clone(&released)));

        assert_eq!(scope.close(), 2);
        assert_eq!(scope.close(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(scope.is_closed());
        assert!(scope.is_empty());
    }

    #[test]
    fn test_release_order_is_reverse_of_acquisition() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = ResourceScope::new();
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            scope.defer(name, move || {
                order.lock().unwrap_or_else(PoisonError::into_inner).push(name);
            });
        }

        scope.close();

        let order = order.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(*order, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_panicking_resource_does_not_leak_others() {
        let released = Arc::new(AtomicUsize::new(0));
        let scope = ResourceScope::new();
        scope.acquire(Counted(Arc::clone(&released)));
        scope.acquire(Exploding);
        scope.acquire(Counted(Arc::clone(&released)));

        assert_eq!(scope.close(), 3);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_acquire_after_close_releases_immediately() {
        let released = Arc::new(AtomicUsize::new(0));
        let scope = ResourceScope::new();
        scope.close();

        scope.acquire(Counted(Arc::clone(&released)));

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(scope.is_empty());
    }

    #[test]
    fn test_drop_without_close_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let scope = ResourceScope::new();
            let clone = scope.clone();
            clone.acquire(Counted(Arc::clone(&released)));
            drop(scope);
            assert_eq!(released.load(Ordering::SeqCst), 0);
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_the_same_registry() {
        let scope = ResourceScope::new();
        let clone = scope.clone();
        clone.defer("noop", || {});
        assert_eq!(scope.len(), 1);
        clone.close();
        assert!(scope.is_closed());
    }
}
