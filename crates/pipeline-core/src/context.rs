//! Per-request mutable state threaded through every pipeline stage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::listener::ProducerListener;
use crate::priority::Priority;
use crate::request::ImageRequest;

/// Reserved extras key holding the request id.
pub const EXTRA_ID: &str = "id";
/// Reserved extras key holding the source uri.
pub const EXTRA_URI_SOURCE: &str = "uri_source";

/// Callbacks fired when the mutable state of a [`ProducerContext`] changes.
///
/// All hooks default to no-ops so implementors override only what they need.
pub trait ContextCallbacks: Send + Sync {
    fn on_cancellation_requested(&self) {}
    fn on_priority_changed(&self) {}
    fn on_is_prefetch_changed(&self) {}
    fn on_is_intermediate_result_expected_changed(&self) {}
}

struct ContextState {
    priority: Priority,
    is_prefetch: bool,
    is_intermediate_result_expected: bool,
    is_cancelled: bool,
    callbacks: Vec<Arc<dyn ContextCallbacks>>,
}

/// Shared, cancellable state for one request flowing through the pipeline.
///
/// Every stage holds a reference; the context lives as long as its longest
/// holder. The cancellation flag is sticky: once set it never clears.
/// Priority, prefetch, and intermediate-result expectations may change
/// repeatedly until the request finishes.
///
/// The `*_no_callbacks` setters mutate state under the context lock and hand
/// the registered callback list back to the caller, who must fire the
/// matching hook *outside* any lock (see the `notify_*` helpers). Skipping
/// that step silently starves stages that key off state transitions.
pub struct ProducerContext {
    request: ImageRequest,
    id: String,
    listener: Arc<dyn ProducerListener>,
    state: Mutex<ContextState>,
    extras: Mutex<HashMap<String, String>>,
}

impl ProducerContext {
    pub fn new(
        request: ImageRequest,
        id: impl Into<String>,
        listener: Arc<dyn ProducerListener>,
        is_prefetch: bool,
        is_intermediate_result_expected: bool,
        priority: Priority,
    ) -> ProducerContext {
        let id = id.into();
        let mut extras = HashMap::new();
        extras.insert(EXTRA_ID.to_owned(), id.clone());
        extras.insert(EXTRA_URI_SOURCE.to_owned(), request.uri().to_string());
        ProducerContext {
            request,
            id,
            listener,
            state: Mutex::new(ContextState {
                priority,
                is_prefetch,
                is_intermediate_result_expected,
                is_cancelled: false,
                callbacks: Vec::new(),
            }),
            extras: Mutex::new(extras),
        }
    }

    /// Copies this context with a different request descriptor, preserving
    /// the current priority and flags. Used when only the byte range
    /// differs, e.g. to continue a partial fetch.
    pub fn with_request(&self, request: ImageRequest) -> ProducerContext {
        let state = self.state.lock();
        ProducerContext::new(
            request,
            self.id.clone(),
            self.listener.clone(),
            state.is_prefetch,
            state.is_intermediate_result_expected,
            state.priority,
        )
    }

    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn listener(&self) -> &Arc<dyn ProducerListener> {
        &self.listener
    }

    pub fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    pub fn is_prefetch(&self) -> bool {
        self.state.lock().is_prefetch
    }

    pub fn is_intermediate_result_expected(&self) -> bool {
        self.state.lock().is_intermediate_result_expected
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().is_cancelled
    }

    /// Reads an extras entry.
    pub fn extra(&self, key: &str) -> Option<String> {
        self.extras.lock().get(key).cloned()
    }

    /// Writes an extras entry. Reserved keys are immutable; attempts to
    /// overwrite them are logged and dropped.
    pub fn put_extra(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if key == EXTRA_ID || key == EXTRA_URI_SOURCE {
            warn!(request_id = %self.id, key = %key, "ignoring write to reserved extras key");
            return;
        }
        self.extras.lock().insert(key, value.into());
    }

    /// Registers callbacks for state changes. If the context was already
    /// cancelled, the cancellation hook fires immediately (outside the
    /// lock) instead of being merely recorded.
    pub fn add_callbacks(&self, callbacks: Arc<dyn ContextCallbacks>) {
        let cancel_immediately = {
            let mut state = self.state.lock();
            state.callbacks.push(callbacks.clone());
            state.is_cancelled
        };
        if cancel_immediately {
            callbacks.on_cancellation_requested();
        }
    }

    /// Cancels the request and fires every registered cancellation hook.
    pub fn cancel(&self) {
        notify_cancellation(self.cancel_no_callbacks());
    }

    /// Marks the context cancelled without firing hooks.
    ///
    /// Returns the callback list to notify if the flag actually changed;
    /// `None` on repeat calls, making cancellation idempotent.
    pub fn cancel_no_callbacks(&self) -> Option<Vec<Arc<dyn ContextCallbacks>>> {
        let mut state = self.state.lock();
        if state.is_cancelled {
            return None;
        }
        state.is_cancelled = true;
        Some(state.callbacks.clone())
    }

    pub fn set_priority(&self, priority: Priority) {
        notify_priority_changed(self.set_priority_no_callbacks(priority));
    }

    pub fn set_priority_no_callbacks(
        &self,
        priority: Priority,
    ) -> Option<Vec<Arc<dyn ContextCallbacks>>> {
        let mut state = self.state.lock();
        if state.priority == priority {
            return None;
        }
        state.priority = priority;
        Some(state.callbacks.clone())
    }

    pub fn set_is_prefetch(&self, is_prefetch: bool) {
        notify_is_prefetch_changed(self.set_is_prefetch_no_callbacks(is_prefetch));
    }

    pub fn set_is_prefetch_no_callbacks(
        &self,
        is_prefetch: bool,
    ) -> Option<Vec<Arc<dyn ContextCallbacks>>> {
        let mut state = self.state.lock();
        if state.is_prefetch == is_prefetch {
            return None;
        }
        state.is_prefetch = is_prefetch;
        Some(state.callbacks.clone())
    }

    pub fn set_is_intermediate_result_expected(&self, expected: bool) {
        notify_is_intermediate_result_expected_changed(
            self.set_is_intermediate_result_expected_no_callbacks(expected),
        );
    }

    pub fn set_is_intermediate_result_expected_no_callbacks(
        &self,
        expected: bool,
    ) -> Option<Vec<Arc<dyn ContextCallbacks>>> {
        let mut state = self.state.lock();
        if state.is_intermediate_result_expected == expected {
            return None;
        }
        state.is_intermediate_result_expected = expected;
        Some(state.callbacks.clone())
    }
}

/// Fires `on_cancellation_requested` on each callback. No-op for `None`.
pub fn notify_cancellation(callbacks: Option<Vec<Arc<dyn ContextCallbacks>>>) {
    if let Some(callbacks) = callbacks {
        for callback in callbacks {
            callback.on_cancellation_requested();
        }
    }
}

/// Fires `on_priority_changed` on each callback. No-op for `None`.
pub fn notify_priority_changed(callbacks: Option<Vec<Arc<dyn ContextCallbacks>>>) {
    if let Some(callbacks) = callbacks {
        for callback in callbacks {
            callback.on_priority_changed();
        }
    }
}

/// Fires `on_is_prefetch_changed` on each callback. No-op for `None`.
pub fn notify_is_prefetch_changed(callbacks: Option<Vec<Arc<dyn ContextCallbacks>>>) {
    if let Some(callbacks) = callbacks {
        for callback in callbacks {
            callback.on_is_prefetch_changed();
        }
    }
}

/// Fires `on_is_intermediate_result_expected_changed` on each callback.
/// No-op for `None`.
pub fn notify_is_intermediate_result_expected_changed(
    callbacks: Option<Vec<Arc<dyn ContextCallbacks>>>,
) {
    if let Some(callbacks) = callbacks {
        for callback in callbacks {
            callback.on_is_intermediate_result_expected_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    fn test_context() -> ProducerContext {
        let request = ImageRequest::new(Url::parse("https://example.com/img.jpg").unwrap());
        ProducerContext::new(
            request,
            "req-1",
            Arc::new(NoopListener),
            false,
            true,
            Priority::Medium,
        )
    }

    #[derive(Default)]
    struct CountingCallbacks {
        cancellations: AtomicUsize,
        priority_changes: AtomicUsize,
        prefetch_changes: AtomicUsize,
        intermediate_changes: AtomicUsize,
    }

    impl ContextCallbacks for CountingCallbacks {
        fn on_cancellation_requested(&self) {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
        }

        fn on_priority_changed(&self) {
            self.priority_changes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_is_prefetch_changed(&self) {
            self.prefetch_changes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_is_intermediate_result_expected_changed(&self) {
            self.intermediate_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let context = test_context();
        let callbacks = Arc::new(CountingCallbacks::default());
        context.add_callbacks(callbacks.clone());

        context.cancel();
        context.cancel();

        assert!(context.is_cancelled());
        assert_eq!(callbacks.cancellations.load(Ordering::SeqCst), 1);
        assert!(context.cancel_no_callbacks().is_none());
    }

    #[test]
    fn setters_report_changes_only() {
        let context = test_context();
        let callbacks = Arc::new(CountingCallbacks::default());
        context.add_callbacks(callbacks.clone());

        assert!(context.set_priority_no_callbacks(Priority::Medium).is_none());
        let changed = context.set_priority_no_callbacks(Priority::High);
        assert_eq!(changed.as_ref().map(Vec::len), Some(1));
        notify_priority_changed(changed);
        assert_eq!(callbacks.priority_changes.load(Ordering::SeqCst), 1);
        assert_eq!(context.priority(), Priority::High);

        context.set_is_prefetch(true);
        context.set_is_prefetch(true);
        assert_eq!(callbacks.prefetch_changes.load(Ordering::SeqCst), 1);

        context.set_is_intermediate_result_expected(false);
        assert_eq!(callbacks.intermediate_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_callbacks_fire_cancellation_immediately() {
        let context = test_context();
        context.cancel();

        let callbacks = Arc::new(CountingCallbacks::default());
        context.add_callbacks(callbacks.clone());
        assert_eq!(callbacks.cancellations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reserved_extras_are_immutable() {
        let context = test_context();
        assert_eq!(context.extra(EXTRA_ID).as_deref(), Some("req-1"));
        context.put_extra(EXTRA_ID, "overwritten");
        assert_eq!(context.extra(EXTRA_ID).as_deref(), Some("req-1"));

        context.put_extra("origin", "memory_cache");
        assert_eq!(context.extra("origin").as_deref(), Some("memory_cache"));
    }

    #[test]
    fn with_request_copies_current_flags() {
        let context = test_context();
        context.set_priority(Priority::High);
        context.set_is_prefetch(true);

        let request = ImageRequest::new(Url::parse("https://example.com/img.jpg").unwrap())
            .with_bytes_range(crate::request::BytesRange::from_offset(100));
        let copy = context.with_request(request.clone());

        assert_eq!(copy.priority(), Priority::High);
        assert!(copy.is_prefetch());
        assert!(!copy.is_cancelled());
        assert_eq!(copy.request(), &request);
        assert_eq!(copy.id(), context.id());
    }
}
