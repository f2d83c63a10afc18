//! The consumer side of the producer/consumer protocol.
//!
//! A producer delivers zero or more non-final results followed by exactly
//! one terminal signal (final result, failure, or cancellation). The
//! [`BaseConsumer`] wrapper enforces that contract with a single latch shared
//! across all four callbacks, so a consumer observes its callbacks in one
//! total order even when they physically arrive on different threads.

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::error;

use crate::DynError;

bitflags! {
    /// Status bitmask attached to every result delivery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConsumerStatus: u32 {
        /// This is the last result the producer will deliver.
        const IS_LAST = 1;
        /// The encoded bytes backing this result must not be written to the
        /// encoded cache.
        const DO_NOT_CACHE_ENCODED = 1 << 1;
        /// A low-quality stand-in delivered while the real result is computed.
        const IS_PLACEHOLDER = 1 << 2;
        /// A partial byte-range result, not a complete image.
        const IS_PARTIAL_RESULT = 1 << 3;
        /// Resizing has completed for this result.
        const IS_RESIZING_DONE = 1 << 4;
    }
}

impl ConsumerStatus {
    /// Status carrying only the last-result bit, set from a boolean.
    pub fn for_last(is_last: bool) -> ConsumerStatus {
        if is_last {
            ConsumerStatus::IS_LAST
        } else {
            ConsumerStatus::empty()
        }
    }

    pub fn is_last(self) -> bool {
        self.contains(ConsumerStatus::IS_LAST)
    }
}

/// Receives a producer's stream of results.
///
/// Contract: any number of `on_new_result` calls without `IS_LAST` and any
/// number of `on_progress_update` calls, then exactly one of
/// `on_new_result(.., IS_LAST)`, `on_failure`, or `on_cancellation`, after
/// which no further callback is delivered.
pub trait Consumer<T>: Send + Sync {
    /// Called when a new result is available. `status.is_last()` marks the
    /// terminal result.
    fn on_new_result(&self, result: T, status: ConsumerStatus);

    /// Called on terminal failure. No further callbacks follow.
    fn on_failure(&self, error: DynError);

    /// Called when the request is cancelled. No further callbacks follow.
    fn on_cancellation(&self);

    /// Called with download/processing progress in `[0, 1]`.
    fn on_progress_update(&self, progress: f32);
}

/// Hooks invoked by [`BaseConsumer`] once the terminal latch has admitted
/// the callback. Implementations do not need to worry about ordering or
/// double terminal signals.
pub trait ConsumerHandler<T>: Send + Sync {
    fn on_new_result_impl(&self, result: T, status: ConsumerStatus);
    fn on_failure_impl(&self, error: DynError);
    fn on_cancellation_impl(&self);
    fn on_progress_update_impl(&self, _progress: f32) {}
}

/// Enforces the single-terminal-signal guarantee for a [`ConsumerHandler`].
///
/// One mutex is shared by all four callbacks, so the handler observes them
/// as if delivered from a single thread. A panic escaping a handler hook is
/// caught and logged instead of propagated; the latch state is already
/// committed at that point, so the terminal guarantee survives a misbehaving
/// downstream stage.
pub struct BaseConsumer<H> {
    finished: Mutex<bool>,
    handler: H,
}

impl<H> BaseConsumer<H> {
    pub fn new(handler: H) -> BaseConsumer<H> {
        BaseConsumer {
            finished: Mutex::new(false),
            handler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

fn run_hook(hook_name: &'static str, hook: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(hook)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        error!(hook = hook_name, reason = %reason, "consumer hook panicked");
    }
}

impl<T, H: ConsumerHandler<T>> Consumer<T> for BaseConsumer<H> {
    fn on_new_result(&self, result: T, status: ConsumerStatus) {
        let mut finished = self.finished.lock();
        if *finished {
            return;
        }
        if status.is_last() {
            *finished = true;
        }
        run_hook("on_new_result", || {
            self.handler.on_new_result_impl(result, status)
        });
    }

    fn on_failure(&self, error: DynError) {
        let mut finished = self.finished.lock();
        if *finished {
            return;
        }
        *finished = true;
        run_hook("on_failure", || self.handler.on_failure_impl(error));
    }

    fn on_cancellation(&self) {
        let mut finished = self.finished.lock();
        if *finished {
            return;
        }
        *finished = true;
        run_hook("on_cancellation", || self.handler.on_cancellation_impl());
    }

    fn on_progress_update(&self, progress: f32) {
        let finished = self.finished.lock();
        if *finished {
            return;
        }
        run_hook("on_progress_update", || {
            self.handler.on_progress_update_impl(progress)
        });
    }
}

/// Handler that forwards failure, cancellation and progress unchanged to a
/// downstream consumer, leaving only the new-result path to the stage.
///
/// Most concrete stages are exactly this: intercept results, pass every
/// other signal through.
pub struct DelegatingHandler<I, O, F>
where
    F: Fn(I, ConsumerStatus, &Arc<dyn Consumer<O>>) + Send + Sync,
{
    downstream: Arc<dyn Consumer<O>>,
    on_result: F,
    _input: PhantomData<fn(I)>,
}

impl<I, O, F> DelegatingHandler<I, O, F>
where
    F: Fn(I, ConsumerStatus, &Arc<dyn Consumer<O>>) + Send + Sync,
{
    pub fn new(downstream: Arc<dyn Consumer<O>>, on_result: F) -> Self {
        DelegatingHandler {
            downstream,
            on_result,
            _input: PhantomData,
        }
    }

    /// Wraps the handler in a [`BaseConsumer`], ready to hand to an upstream
    /// producer.
    pub fn into_consumer(self) -> Arc<BaseConsumer<Self>> {
        Arc::new(BaseConsumer::new(self))
    }
}

impl<I, O, F> ConsumerHandler<I> for DelegatingHandler<I, O, F>
where
    I: Send,
    O: Send,
    F: Fn(I, ConsumerStatus, &Arc<dyn Consumer<O>>) + Send + Sync,
{
    fn on_new_result_impl(&self, result: I, status: ConsumerStatus) {
        (self.on_result)(result, status, &self.downstream);
    }

    fn on_failure_impl(&self, error: DynError) {
        self.downstream.on_failure(error);
    }

    fn on_cancellation_impl(&self) {
        self.downstream.on_cancellation();
    }

    fn on_progress_update_impl(&self, progress: f32) {
        self.downstream.on_progress_update(progress);
    }
}
