//! Two-lane priority queue in front of a delegate fetcher.
//!
//! High-priority fetches (for images on screen) run ahead of low-priority
//! ones (prefetches), with separate concurrency caps; the high-priority cap
//! is strictly larger so on-screen traffic always has exclusive headroom.
//! Failed fetches can be requeued, first immediately and then through a
//! delayed queue with a shared backoff window, with the retry decision
//! depending on failure kind, attempt counters and the request's current
//! priority.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pipeline_core::{
    Consumer, ContextCallbacks, ExtraMap, MonotonicClock, Priority, ProducerContext,
    ScheduledExecutor,
};
use tracing::{debug, error};

use crate::config::PriorityFetcherConfig;
use crate::error::{FetchError, PipelineError};
use crate::image::EncodedImage;
use crate::network::{FetchCallback, FetchState, FetchStateHolder, NetworkFetcher};

/// Queue bookkeeping wrapped around the delegate's own fetch state.
///
/// The delegate state is replaced with a fresh one on every requeue, so a
/// failed attempt cannot leak intermediate-result timing or response
/// bookkeeping into the next attempt. The base state lives here and is
/// stable across attempts.
pub struct PriorityFetchState<S> {
    base: FetchState,
    delegated: Mutex<Arc<S>>,
    callback: Mutex<Option<Arc<dyn FetchCallback>>>,
    enqueued_time_ms: AtomicU64,
    dequeued_time_ms: AtomicU64,
    requeue_count: AtomicU32,
    attempt_count: AtomicU32,
    connect_attempt_count: AtomicU32,
    priority_change_count: AtomicU32,
    hi_pri_count_at_enqueue: AtomicUsize,
    low_pri_count_at_enqueue: AtomicUsize,
    cancelled: AtomicBool,
}

impl<S> PriorityFetchState<S> {
    fn new(base: FetchState, delegated: S) -> PriorityFetchState<S> {
        PriorityFetchState {
            base,
            delegated: Mutex::new(Arc::new(delegated)),
            callback: Mutex::new(None),
            enqueued_time_ms: AtomicU64::new(0),
            dequeued_time_ms: AtomicU64::new(0),
            requeue_count: AtomicU32::new(0),
            attempt_count: AtomicU32::new(0),
            connect_attempt_count: AtomicU32::new(0),
            priority_change_count: AtomicU32::new(0),
            hi_pri_count_at_enqueue: AtomicUsize::new(0),
            low_pri_count_at_enqueue: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// The delegate state for the current attempt.
    pub fn delegated(&self) -> Arc<S> {
        self.delegated.lock().clone()
    }

    pub fn requeue_count(&self) -> u32 {
        self.requeue_count.load(Ordering::SeqCst)
    }

    pub fn priority_change_count(&self) -> u32 {
        self.priority_change_count.load(Ordering::SeqCst)
    }

    fn callback(&self) -> Option<Arc<dyn FetchCallback>> {
        self.callback.lock().clone()
    }
}

impl<S> FetchStateHolder for PriorityFetchState<S> {
    fn fetch_state(&self) -> &FetchState {
        &self.base
    }
}

struct Queues<S> {
    hi_pri: VecDeque<Arc<PriorityFetchState<S>>>,
    low_pri: VecDeque<Arc<PriorityFetchState<S>>>,
    delayed: Vec<Arc<PriorityFetchState<S>>>,
    /// Stamped when the first entry lands in an empty delayed queue; every
    /// delayed entry waits for this one shared stamp to expire.
    delayed_stamp_ms: Option<u64>,
    currently_fetching: Vec<Arc<PriorityFetchState<S>>>,
    paused: bool,
}

fn remove_state<S>(queue: &mut Vec<Arc<PriorityFetchState<S>>>, state: &Arc<PriorityFetchState<S>>) -> bool {
    let before = queue.len();
    queue.retain(|s| !Arc::ptr_eq(s, state));
    queue.len() != before
}

fn remove_state_deque<S>(
    queue: &mut VecDeque<Arc<PriorityFetchState<S>>>,
    state: &Arc<PriorityFetchState<S>>,
) -> bool {
    let before = queue.len();
    queue.retain(|s| !Arc::ptr_eq(s, state));
    queue.len() != before
}

fn is_enqueued<S>(queues: &Queues<S>, state: &Arc<PriorityFetchState<S>>) -> bool {
    queues.hi_pri.iter().any(|s| Arc::ptr_eq(s, state))
        || queues.low_pri.iter().any(|s| Arc::ptr_eq(s, state))
        || queues.delayed.iter().any(|s| Arc::ptr_eq(s, state))
        || queues.currently_fetching.iter().any(|s| Arc::ptr_eq(s, state))
}

struct PriorityInner<F: NetworkFetcher> {
    delegate: Arc<F>,
    config: PriorityFetcherConfig,
    clock: Arc<dyn MonotonicClock>,
    scheduled_executor: Arc<dyn ScheduledExecutor>,
    queues: Mutex<Queues<F::State>>,
}

/// The priority fetcher itself. Implements [`NetworkFetcher`] by wrapping a
/// delegate, so it slots into the network stage transparently.
pub struct PriorityNetworkFetcher<F: NetworkFetcher> {
    inner: Arc<PriorityInner<F>>,
}

impl<F: NetworkFetcher> PriorityNetworkFetcher<F> {
    pub fn new(
        delegate: Arc<F>,
        config: PriorityFetcherConfig,
        clock: Arc<dyn MonotonicClock>,
        scheduled_executor: Arc<dyn ScheduledExecutor>,
    ) -> Result<PriorityNetworkFetcher<F>, PipelineError> {
        config.validate()?;
        Ok(PriorityNetworkFetcher {
            inner: Arc::new(PriorityInner {
                delegate,
                config,
                clock,
                scheduled_executor,
                queues: Mutex::new(Queues {
                    hi_pri: VecDeque::new(),
                    low_pri: VecDeque::new(),
                    delayed: Vec::new(),
                    delayed_stamp_ms: None,
                    currently_fetching: Vec::new(),
                    paused: false,
                }),
            }),
        })
    }

    /// Stops dispatching new fetches; in-flight fetches finish normally.
    pub fn pause(&self) {
        self.inner.queues.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.queues.lock().paused = false;
        self.inner.dequeue_if_available_slots();
    }

    pub fn hi_pri_queue_size(&self) -> usize {
        self.inner.queues.lock().hi_pri.len()
    }

    pub fn low_pri_queue_size(&self) -> usize {
        self.inner.queues.lock().low_pri.len()
    }

    pub fn delayed_queue_size(&self) -> usize {
        self.inner.queues.lock().delayed.len()
    }

    pub fn currently_fetching_count(&self) -> usize {
        self.inner.queues.lock().currently_fetching.len()
    }
}

fn is_hi_pri(context: &ProducerContext) -> bool {
    context.priority() == Priority::High
}

impl<F: NetworkFetcher> PriorityInner<F> {
    fn put_in_queue_locked(
        &self,
        queues: &mut Queues<F::State>,
        state: Arc<PriorityFetchState<F::State>>,
        hi_pri: bool,
    ) {
        if hi_pri {
            if self.config.is_hi_pri_fifo {
                queues.hi_pri.push_back(state);
            } else {
                queues.hi_pri.push_front(state);
            }
        } else {
            queues.low_pri.push_back(state);
        }
    }

    fn move_delayed_if_ready_locked(&self, queues: &mut Queues<F::State>) {
        let Some(stamp) = queues.delayed_stamp_ms else {
            return;
        };
        if self.clock.now_ms() < stamp + self.config.requeue_delay_time_ms {
            return;
        }
        queues.delayed_stamp_ms = None;
        let delayed = std::mem::take(&mut queues.delayed);
        for state in delayed {
            if state.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            let hi_pri = is_hi_pri(state.fetch_state().context());
            self.put_in_queue_locked(queues, state, hi_pri);
        }
    }

    fn dequeue_if_available_slots(self: &Arc<Self>) {
        loop {
            let to_fetch = {
                let mut queues = self.queues.lock();
                if queues.paused {
                    return;
                }
                self.move_delayed_if_ready_locked(&mut queues);
                let fetching = queues.currently_fetching.len();
                let next = if !queues.hi_pri.is_empty()
                    && fetching < self.config.max_outstanding_hi_pri
                {
                    queues.hi_pri.pop_front()
                } else if !queues.low_pri.is_empty()
                    && fetching < self.config.max_outstanding_low_pri
                {
                    queues.low_pri.pop_front()
                } else {
                    None
                };
                if let Some(state) = &next {
                    queues.currently_fetching.push(state.clone());
                }
                next
            };
            let Some(state) = to_fetch else { return };
            self.delegate_fetch(&state);
            if !self.config.multiple_dequeue {
                return;
            }
        }
    }

    fn delegate_fetch(self: &Arc<Self>, state: &Arc<PriorityFetchState<F::State>>) {
        state
            .dequeued_time_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);
        debug!(
            request_id = state.fetch_state().id(),
            attempt = state.attempt_count.load(Ordering::SeqCst) + 1,
            "dispatching fetch to delegate"
        );
        let wrapper = Arc::new(DelegateCallback {
            inner: self.clone(),
            state: state.clone(),
        });
        let delegated = state.delegated();
        self.delegate.fetch(&delegated, wrapper);
    }

    fn remove_from_fetching(&self, state: &Arc<PriorityFetchState<F::State>>) {
        let mut queues = self.queues.lock();
        remove_state(&mut queues.currently_fetching, state);
    }

    fn on_fetch_failure(self: &Arc<Self>, state: &Arc<PriorityFetchState<F::State>>, error: FetchError) {
        self.remove_from_fetching(state);
        let attempts = state.attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
        let connect_attempts = if error.is_connect_error() {
            state.connect_attempt_count.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            state.connect_attempt_count.load(Ordering::SeqCst)
        };

        if self.should_retry(state, &error, attempts, connect_attempts) {
            debug!(
                request_id = state.fetch_state().id(),
                error = %error,
                attempts,
                "requeueing failed fetch"
            );
            self.requeue(state);
        } else {
            debug!(
                request_id = state.fetch_state().id(),
                error = %error,
                attempts,
                "fetch failed permanently"
            );
            if let Some(callback) = state.callback() {
                callback.on_failure(error);
            }
            self.dequeue_if_available_slots();
        }
    }

    fn should_retry(
        &self,
        state: &Arc<PriorityFetchState<F::State>>,
        error: &FetchError,
        attempts: u32,
        connect_attempts: u32,
    ) -> bool {
        if state.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        if self.config.non_recoverable_exception_prevents_requeue && error.is_non_recoverable() {
            return false;
        }
        if self.config.max_number_of_requeue >= 0
            && state.requeue_count.load(Ordering::SeqCst)
                >= self.config.max_number_of_requeue as u32
        {
            return false;
        }
        if error.is_connect_error() && connect_attempts >= self.config.max_connect_attempt_count {
            return false;
        }
        if attempts >= self.config.max_attempt_count {
            return false;
        }
        if error.is_marked_retriable() || error.matches_cancellation_pattern() {
            return true;
        }
        if is_hi_pri(state.fetch_state().context()) {
            return true;
        }
        // Low priority: the per-kind flags decide for their kind, the
        // catch-all flag decides for everything else.
        match error {
            FetchError::UnknownHost { .. } => self.config.retry_low_pri_unknown_host_exception,
            FetchError::Connection { .. } => self.config.retry_low_pri_connection_exception,
            _ => self.config.retry_low_pri_all,
        }
    }

    fn requeue(self: &Arc<Self>, state: &Arc<PriorityFetchState<F::State>>) {
        let requeues = state.requeue_count.fetch_add(1, Ordering::SeqCst) + 1;
        // Fresh delegate state per attempt: intermediate-result timing and
        // response bookkeeping from the failed attempt must not carry over.
        let fresh = self.delegate.create_fetch_state(
            state.fetch_state().consumer().clone(),
            state.fetch_state().context().clone(),
        );
        *state.delegated.lock() = Arc::new(fresh);
        let schedule_in = {
            let mut queues = self.queues.lock();
            if requeues <= self.config.immediate_requeue_count {
                let hi_pri = is_hi_pri(state.fetch_state().context());
                self.put_in_queue_locked(&mut queues, state.clone(), hi_pri);
                None
            } else {
                queues.delayed.push(state.clone());
                if queues.delayed_stamp_ms.is_none() {
                    queues.delayed_stamp_ms = Some(self.clock.now_ms());
                    Some(Duration::from_millis(self.config.requeue_delay_time_ms))
                } else {
                    // A timer is already pending for the shared stamp.
                    None
                }
            }
        };
        if let Some(delay) = schedule_in {
            let inner = self.clone();
            self.scheduled_executor
                .schedule(delay, Box::new(move || inner.dequeue_if_available_slots()));
        }
        self.dequeue_if_available_slots();
    }

    fn cancel(self: &Arc<Self>, state: &Arc<PriorityFetchState<F::State>>) {
        if self.config.do_not_cancel_requests {
            return;
        }
        {
            let mut queues = self.queues.lock();
            let in_flight = queues
                .currently_fetching
                .iter()
                .any(|s| Arc::ptr_eq(s, state));
            if in_flight && !self.config.inflight_fetches_can_be_cancelled {
                return;
            }
            if state.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            remove_state_deque(&mut queues.hi_pri, state);
            remove_state_deque(&mut queues.low_pri, state);
            remove_state(&mut queues.delayed, state);
            remove_state(&mut queues.currently_fetching, state);
        }
        if let Some(callback) = state.callback() {
            callback.on_cancellation();
        }
        self.dequeue_if_available_slots();
    }

    fn change_priority(self: &Arc<Self>, state: &Arc<PriorityFetchState<F::State>>) {
        let moved = {
            let mut queues = self.queues.lock();
            let removed = remove_state_deque(&mut queues.hi_pri, state)
                || remove_state_deque(&mut queues.low_pri, state)
                || remove_state(&mut queues.delayed, state);
            if removed {
                state.priority_change_count.fetch_add(1, Ordering::SeqCst);
                let hi_pri = is_hi_pri(state.fetch_state().context());
                self.put_in_queue_locked(&mut queues, state.clone(), hi_pri);
            }
            removed
        };
        // In-flight entries are left alone. A delayed entry moves to its new
        // lane right away instead of waiting out the backoff window.
        if moved {
            self.dequeue_if_available_slots();
        }
    }
}

/// Callback handed to the delegate; routes failures through the requeue
/// logic and drops signals for fetches that were cancelled meanwhile.
struct DelegateCallback<F: NetworkFetcher> {
    inner: Arc<PriorityInner<F>>,
    state: Arc<PriorityFetchState<F::State>>,
}

impl<F: NetworkFetcher> FetchCallback for DelegateCallback<F> {
    fn on_response(&self, body: Box<dyn Read + Send>, content_length: Option<u64>) {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = self.state.callback() {
            callback.on_response(body, content_length);
        }
    }

    fn on_failure(&self, error: FetchError) {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.inner.on_fetch_failure(&self.state, error);
    }

    fn on_cancellation(&self) {
        self.inner.remove_from_fetching(&self.state);
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            if let Some(callback) = self.state.callback() {
                callback.on_cancellation();
            }
        }
        self.inner.dequeue_if_available_slots();
    }
}

/// Context hooks for one queued fetch.
struct StateCallbacks<F: NetworkFetcher> {
    inner: Arc<PriorityInner<F>>,
    state: Arc<PriorityFetchState<F::State>>,
}

impl<F: NetworkFetcher> ContextCallbacks for StateCallbacks<F> {
    fn on_cancellation_requested(&self) {
        self.inner.cancel(&self.state);
    }

    fn on_priority_changed(&self) {
        self.inner.change_priority(&self.state);
    }
}

impl<F: NetworkFetcher> NetworkFetcher for PriorityNetworkFetcher<F> {
    type State = PriorityFetchState<F::State>;

    fn create_fetch_state(
        &self,
        consumer: Arc<dyn Consumer<EncodedImage>>,
        context: Arc<ProducerContext>,
    ) -> Self::State {
        let delegated = self
            .inner
            .delegate
            .create_fetch_state(consumer.clone(), context.clone());
        PriorityFetchState::new(FetchState::new(consumer, context), delegated)
    }

    fn fetch(&self, state: &Arc<Self::State>, callback: Arc<dyn FetchCallback>) {
        *state.callback.lock() = Some(callback);
        state
            .enqueued_time_ms
            .store(self.inner.clock.now_ms(), Ordering::SeqCst);

        let context = state.fetch_state().context().clone();
        context.add_callbacks(Arc::new(StateCallbacks {
            inner: self.inner.clone(),
            state: state.clone(),
        }));
        if state.cancelled.load(Ordering::SeqCst) {
            return;
        }

        let hi_pri = is_hi_pri(&context);
        {
            let mut queues = self.inner.queues.lock();
            if is_enqueued(&queues, state) {
                error!(
                    request_id = state.fetch_state().id(),
                    "fetch state is already enqueued, ignoring"
                );
                return;
            }
            state
                .hi_pri_count_at_enqueue
                .store(queues.hi_pri.len(), Ordering::SeqCst);
            state
                .low_pri_count_at_enqueue
                .store(queues.low_pri.len(), Ordering::SeqCst);
            self.inner
                .put_in_queue_locked(&mut queues, state.clone(), hi_pri);
        }
        debug!(
            request_id = state.fetch_state().id(),
            hi_pri, "enqueued fetch"
        );
        self.inner.dequeue_if_available_slots();
    }

    fn should_propagate_statuses(&self) -> bool {
        self.inner.delegate.should_propagate_statuses()
    }

    fn on_fetch_completion(&self, state: &Arc<Self::State>, byte_size: usize) {
        self.inner.remove_from_fetching(state);
        let delegated = state.delegated();
        self.inner.delegate.on_fetch_completion(&delegated, byte_size);
        self.inner.dequeue_if_available_slots();
    }

    fn extra_map(&self, state: &Arc<Self::State>, byte_size: usize) -> Option<ExtraMap> {
        let delegated = state.delegated();
        let mut extras = self
            .inner
            .delegate
            .extra_map(&delegated, byte_size)
            .unwrap_or_default();
        let queue_time = state
            .dequeued_time_ms
            .load(Ordering::SeqCst)
            .saturating_sub(state.enqueued_time_ms.load(Ordering::SeqCst));
        extras.insert("pri_queue_time".to_owned(), queue_time.to_string());
        extras.insert(
            "requeue_count".to_owned(),
            state.requeue_count().to_string(),
        );
        extras.insert(
            "priority_changed_count".to_owned(),
            state.priority_change_count().to_string(),
        );
        // Queue depths as seen when this fetch was first enqueued.
        extras.insert(
            "hi_pri_queue_size".to_owned(),
            state.hi_pri_count_at_enqueue.load(Ordering::SeqCst).to_string(),
        );
        extras.insert(
            "low_pri_queue_size".to_owned(),
            state.low_pri_count_at_enqueue.load(Ordering::SeqCst).to_string(),
        );
        Some(extras)
    }
}
