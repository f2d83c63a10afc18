//! Deduplication of identical in-flight requests.
//!
//! Requests that map to the same key share a single upstream fetch. The
//! first consumer starts the upstream pass; later consumers attach to the
//! running multiplexer, immediately receive the most recent intermediate
//! result, and every upstream signal fans out to all attached consumers.
//! The upstream runs under a synthetic aggregate context whose priority is
//! the maximum over the attached consumers, which is a prefetch only while
//! all of them are, and which expects intermediate results while any of
//! them does.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pipeline_core::context::{
    notify_is_intermediate_result_expected_changed, notify_is_prefetch_changed,
    notify_priority_changed,
};
use pipeline_core::{
    BaseConsumer, Consumer, ConsumerHandler, ConsumerStatus, ContextCallbacks, DynError, Priority,
    Producer, ProducerContext,
};
use tracing::debug;

/// Derives the deduplication key for a request.
pub type KeyFn = Box<dyn Fn(&ProducerContext) -> String + Send + Sync>;

/// Producer that multiplexes requests with equal keys onto one upstream pass.
pub struct MultiplexProducer<T: Clone + Send + Sync + 'static> {
    inner: Arc<MultiplexInner<T>>,
}

struct MultiplexInner<T: Clone + Send + Sync + 'static> {
    next: Arc<dyn Producer<T>>,
    key_of: KeyFn,
    multiplexers: Mutex<HashMap<String, Arc<Multiplexer<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> MultiplexProducer<T> {
    pub fn new(next: Arc<dyn Producer<T>>, key_of: KeyFn) -> MultiplexProducer<T> {
        MultiplexProducer {
            inner: Arc::new(MultiplexInner {
                next,
                key_of,
                multiplexers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Multiplexes on the request cache key, the usual configuration.
    pub fn by_cache_key(next: Arc<dyn Producer<T>>) -> MultiplexProducer<T> {
        MultiplexProducer::new(next, Box::new(|context| context.request().cache_key()))
    }

    #[cfg(test)]
    fn multiplexer_count(&self) -> usize {
        self.inner.multiplexers.lock().len()
    }
}

impl<T: Clone + Send + Sync + 'static> Producer<T> for MultiplexProducer<T> {
    fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>) {
        let key = (self.inner.key_of)(&context);
        loop {
            let (multiplexer, created) = {
                let mut map = self.inner.multiplexers.lock();
                match map.get(&key) {
                    Some(existing) => (existing.clone(), false),
                    None => {
                        let multiplexer = Arc::new(Multiplexer {
                            key: key.clone(),
                            parent: Arc::downgrade(&self.inner),
                            state: Mutex::new(MuxState {
                                pairs: Vec::new(),
                                multiplex_context: None,
                                generation: 0,
                                last_intermediate: None,
                                last_progress: None,
                                next_serial: 0,
                            }),
                        });
                        map.insert(key.clone(), multiplexer.clone());
                        (multiplexer, true)
                    }
                }
            };
            // A multiplexer can finish between the map lookup and the attach
            // attempt; a refused attach means try again with a fresh one.
            if multiplexer.add_new_consumer(consumer.clone(), context.clone()) {
                if created {
                    multiplexer.start_upstream_if_attached();
                }
                return;
            }
        }
    }
}

struct ConsumerPair<T: ?Sized> {
    consumer: Arc<dyn Consumer<T>>,
    context: Arc<ProducerContext>,
    /// Serializes deliveries to this consumer so the attach-time replay
    /// cannot interleave with a live upstream result.
    delivery: Mutex<()>,
}

struct StoredResult<T> {
    value: T,
    status: ConsumerStatus,
    serial: u64,
}

struct MuxState<T: Clone + Send + Sync + 'static> {
    pairs: Vec<Arc<ConsumerPair<T>>>,
    multiplex_context: Option<Arc<ProducerContext>>,
    /// Bumped for every upstream pass; stale forwarding consumers carry an
    /// old generation and their late callbacks are ignored.
    generation: u64,
    last_intermediate: Option<StoredResult<T>>,
    last_progress: Option<f32>,
    next_serial: u64,
}

struct Multiplexer<T: Clone + Send + Sync + 'static> {
    key: String,
    parent: Weak<MultiplexInner<T>>,
    state: Mutex<MuxState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Multiplexer<T> {
    /// Attaches a consumer. Returns false if this multiplexer already
    /// finished and was unregistered, in which case the caller must retry.
    fn add_new_consumer(
        self: &Arc<Self>,
        consumer: Arc<dyn Consumer<T>>,
        context: Arc<ProducerContext>,
    ) -> bool {
        let pair = Arc::new(ConsumerPair {
            consumer,
            context: context.clone(),
            delivery: Mutex::new(()),
        });

        let (replay_serial, last_progress, prefetch_cbs, priority_cbs, intermediate_cbs) = {
            let mut state = self.state.lock();
            let parent = match self.parent.upgrade() {
                Some(parent) => parent,
                None => return false,
            };
            {
                let map = parent.multiplexers.lock();
                if !map.get(&self.key).is_some_and(|m| Arc::ptr_eq(m, self)) {
                    return false;
                }
            }
            state.pairs.push(pair.clone());
            let prefetch_cbs = Self::update_is_prefetch_locked(&mut state);
            let priority_cbs = Self::update_priority_locked(&mut state);
            let intermediate_cbs = Self::update_is_intermediate_locked(&mut state);
            (
                state.last_intermediate.as_ref().map(|s| s.serial),
                state.last_progress,
                prefetch_cbs,
                priority_cbs,
                intermediate_cbs,
            )
        };
        notify_is_prefetch_changed(prefetch_cbs);
        notify_priority_changed(priority_cbs);
        notify_is_intermediate_result_expected_changed(intermediate_cbs);

        if let Some(serial) = replay_serial {
            let _delivery = pair.delivery.lock();
            // Re-check under the delivery lock: a newer result may have been
            // stored (and delivered to this pair) in the meantime, and the
            // replay must not resurrect the older one.
            let replay = {
                let state = self.state.lock();
                state
                    .last_intermediate
                    .as_ref()
                    .filter(|stored| stored.serial == serial)
                    .map(|stored| (stored.value.clone(), stored.status))
            };
            if let Some((value, status)) = replay {
                if let Some(progress) = last_progress {
                    pair.consumer.on_progress_update(progress);
                }
                pair.consumer.on_new_result(value, status);
            }
        }

        context.add_callbacks(Arc::new(PairCallbacks {
            multiplexer: self.clone(),
            pair,
        }));
        true
    }

    /// Starts an upstream pass, or unregisters the multiplexer if every
    /// consumer already left.
    fn start_upstream_if_attached(self: &Arc<Self>) {
        let started = {
            let mut state = self.state.lock();
            debug_assert!(state.multiplex_context.is_none());
            if state.pairs.is_empty() {
                if let Some(parent) = self.parent.upgrade() {
                    let mut map = parent.multiplexers.lock();
                    if map.get(&self.key).is_some_and(|m| Arc::ptr_eq(m, self)) {
                        map.remove(&self.key);
                    }
                }
                None
            } else {
                let seed = state.pairs[0].context.clone();
                let multiplex_context = Arc::new(ProducerContext::new(
                    seed.request().clone(),
                    seed.id(),
                    seed.listener().clone(),
                    Self::compute_is_prefetch(&state.pairs),
                    Self::compute_is_intermediate_expected(&state.pairs),
                    Self::compute_priority(&state.pairs),
                ));
                state.generation += 1;
                state.multiplex_context = Some(multiplex_context.clone());
                Some((multiplex_context, state.generation))
            }
        };
        if let Some((multiplex_context, generation)) = started {
            debug!(key = %self.key, generation, "starting multiplexed upstream pass");
            let forwarding: Arc<dyn Consumer<T>> = Arc::new(BaseConsumer::new(ForwardingHandler {
                multiplexer: self.clone(),
                generation,
            }));
            if let Some(parent) = self.parent.upgrade() {
                parent.next.produce_results(forwarding, multiplex_context);
            }
        }
    }

    fn compute_priority(pairs: &[Arc<ConsumerPair<T>>]) -> Priority {
        pairs
            .iter()
            .map(|pair| pair.context.priority())
            .max()
            .unwrap_or(Priority::Low)
    }

    fn compute_is_prefetch(pairs: &[Arc<ConsumerPair<T>>]) -> bool {
        pairs.iter().all(|pair| pair.context.is_prefetch())
    }

    fn compute_is_intermediate_expected(pairs: &[Arc<ConsumerPair<T>>]) -> bool {
        pairs
            .iter()
            .any(|pair| pair.context.is_intermediate_result_expected())
    }

    fn update_priority_locked(
        state: &mut MuxState<T>,
    ) -> Option<Vec<Arc<dyn ContextCallbacks>>> {
        let priority = Self::compute_priority(&state.pairs);
        state
            .multiplex_context
            .as_ref()
            .and_then(|context| context.set_priority_no_callbacks(priority))
    }

    fn update_is_prefetch_locked(
        state: &mut MuxState<T>,
    ) -> Option<Vec<Arc<dyn ContextCallbacks>>> {
        let is_prefetch = Self::compute_is_prefetch(&state.pairs);
        state
            .multiplex_context
            .as_ref()
            .and_then(|context| context.set_is_prefetch_no_callbacks(is_prefetch))
    }

    fn update_is_intermediate_locked(
        state: &mut MuxState<T>,
    ) -> Option<Vec<Arc<dyn ContextCallbacks>>> {
        let expected = Self::compute_is_intermediate_expected(&state.pairs);
        state
            .multiplex_context
            .as_ref()
            .and_then(|context| context.set_is_intermediate_result_expected_no_callbacks(expected))
    }

    /// Detaches a consumer whose own context was cancelled. The last
    /// consumer to leave cancels the aggregate context; otherwise the
    /// aggregate flags are recomputed over the remaining consumers.
    fn remove_pair(self: &Arc<Self>, pair: &Arc<ConsumerPair<T>>) {
        let mut context_to_cancel = None;
        let mut prefetch_cbs = None;
        let mut priority_cbs = None;
        let mut intermediate_cbs = None;
        let removed = {
            let mut state = self.state.lock();
            let before = state.pairs.len();
            state.pairs.retain(|p| !Arc::ptr_eq(p, pair));
            let removed = state.pairs.len() != before;
            if removed {
                if state.pairs.is_empty() {
                    context_to_cancel = state.multiplex_context.clone();
                } else {
                    prefetch_cbs = Self::update_is_prefetch_locked(&mut state);
                    priority_cbs = Self::update_priority_locked(&mut state);
                    intermediate_cbs = Self::update_is_intermediate_locked(&mut state);
                }
            }
            removed
        };
        notify_is_prefetch_changed(prefetch_cbs);
        notify_priority_changed(priority_cbs);
        notify_is_intermediate_result_expected_changed(intermediate_cbs);
        if let Some(context) = context_to_cancel {
            context.cancel();
        }
        if removed {
            pair.consumer.on_cancellation();
        }
    }

    fn on_next_result(self: &Arc<Self>, generation: u64, result: T, status: ConsumerStatus) {
        let pairs = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            if status.is_last() {
                if let Some(parent) = self.parent.upgrade() {
                    let mut map = parent.multiplexers.lock();
                    if map.get(&self.key).is_some_and(|m| Arc::ptr_eq(m, self)) {
                        map.remove(&self.key);
                    }
                }
                state.last_intermediate = None;
                state.multiplex_context = None;
                std::mem::take(&mut state.pairs)
            } else {
                state.next_serial += 1;
                state.last_intermediate = Some(StoredResult {
                    value: result.clone(),
                    status,
                    serial: state.next_serial,
                });
                state.pairs.clone()
            }
        };
        for pair in pairs {
            let _delivery = pair.delivery.lock();
            pair.consumer.on_new_result(result.clone(), status);
        }
    }

    fn on_upstream_failure(self: &Arc<Self>, generation: u64, error: DynError) {
        let pairs = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            if let Some(parent) = self.parent.upgrade() {
                let mut map = parent.multiplexers.lock();
                if map.get(&self.key).is_some_and(|m| Arc::ptr_eq(m, self)) {
                    map.remove(&self.key);
                }
            }
            state.last_intermediate = None;
            state.multiplex_context = None;
            std::mem::take(&mut state.pairs)
        };
        for pair in pairs {
            let _delivery = pair.delivery.lock();
            pair.consumer.on_failure(error.clone());
        }
    }

    /// Upstream cancellation is not terminal for attached consumers: it only
    /// means the aggregate context was cancelled, which can race with a new
    /// consumer attaching. Restart the upstream for whoever is still here.
    fn on_upstream_cancelled(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.multiplex_context = None;
            state.last_intermediate = None;
            state.last_progress = None;
        }
        self.start_upstream_if_attached();
    }

    fn on_progress(self: &Arc<Self>, generation: u64, progress: f32) {
        let pairs = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.last_progress = Some(progress);
            state.pairs.clone()
        };
        for pair in pairs {
            let _delivery = pair.delivery.lock();
            pair.consumer.on_progress_update(progress);
        }
    }
}

/// Consumer handed to the upstream producer; forwards everything into the
/// multiplexer tagged with the generation of the pass that created it.
struct ForwardingHandler<T: Clone + Send + Sync + 'static> {
    multiplexer: Arc<Multiplexer<T>>,
    generation: u64,
}

impl<T: Clone + Send + Sync + 'static> ConsumerHandler<T> for ForwardingHandler<T> {
    fn on_new_result_impl(&self, result: T, status: ConsumerStatus) {
        self.multiplexer
            .on_next_result(self.generation, result, status);
    }

    fn on_failure_impl(&self, error: DynError) {
        self.multiplexer.on_upstream_failure(self.generation, error);
    }

    fn on_cancellation_impl(&self) {
        self.multiplexer.on_upstream_cancelled(self.generation);
    }

    fn on_progress_update_impl(&self, progress: f32) {
        self.multiplexer.on_progress(self.generation, progress);
    }
}

/// Context callbacks wiring one attached consumer's context changes into
/// the multiplexer's aggregate bookkeeping.
struct PairCallbacks<T: Clone + Send + Sync + 'static> {
    multiplexer: Arc<Multiplexer<T>>,
    pair: Arc<ConsumerPair<T>>,
}

impl<T: Clone + Send + Sync + 'static> ContextCallbacks for PairCallbacks<T> {
    fn on_cancellation_requested(&self) {
        self.multiplexer.remove_pair(&self.pair);
    }

    fn on_priority_changed(&self) {
        let callbacks = {
            let mut state = self.multiplexer.state.lock();
            Multiplexer::update_priority_locked(&mut state)
        };
        notify_priority_changed(callbacks);
    }

    fn on_is_prefetch_changed(&self) {
        let callbacks = {
            let mut state = self.multiplexer.state.lock();
            Multiplexer::update_is_prefetch_locked(&mut state)
        };
        notify_is_prefetch_changed(callbacks);
    }

    fn on_is_intermediate_result_expected_changed(&self) {
        let callbacks = {
            let mut state = self.multiplexer.state.lock();
            Multiplexer::update_is_intermediate_locked(&mut state)
        };
        notify_is_intermediate_result_expected_changed(callbacks);
    }
}
