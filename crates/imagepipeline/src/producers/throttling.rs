//! Caps the number of requests running downstream of this stage.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use pipeline_core::{
    BaseConsumer, Consumer, ConsumerHandler, ConsumerStatus, DynError, Executor, Producer,
    ProducerContext,
};
use tracing::trace;

pub const PRODUCER_NAME: &str = "ThrottlingProducer";

/// Lets at most `max_simultaneous_requests` requests run below this stage;
/// the rest wait in FIFO order and start as running ones finish.
pub struct ThrottlingProducer<T: Send + Sync + 'static> {
    inner: Arc<ThrottleInner<T>>,
}

struct ThrottleInner<T: Send + Sync + 'static> {
    next: Arc<dyn Producer<T>>,
    executor: Arc<dyn Executor>,
    max_simultaneous_requests: usize,
    state: Mutex<ThrottleState<T>>,
}

struct ThrottleState<T: ?Sized> {
    num_current_requests: usize,
    pending: VecDeque<(Arc<dyn Consumer<T>>, Arc<ProducerContext>)>,
}

impl<T: Send + Sync + 'static> ThrottlingProducer<T> {
    pub fn new(
        next: Arc<dyn Producer<T>>,
        executor: Arc<dyn Executor>,
        max_simultaneous_requests: usize,
    ) -> ThrottlingProducer<T> {
        ThrottlingProducer {
            inner: Arc::new(ThrottleInner {
                next,
                executor,
                max_simultaneous_requests,
                state: Mutex::new(ThrottleState {
                    num_current_requests: 0,
                    pending: VecDeque::new(),
                }),
            }),
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl<T: Send + Sync + 'static> Producer<T> for ThrottlingProducer<T> {
    fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>) {
        context.listener().on_producer_start(&context, PRODUCER_NAME);
        let throttled = {
            let mut state = self.inner.state.lock();
            state.num_current_requests += 1;
            if state.num_current_requests > self.inner.max_simultaneous_requests {
                state.pending.push_back((consumer.clone(), context.clone()));
                true
            } else {
                false
            }
        };
        if throttled {
            trace!(request_id = context.id(), "request throttled");
        } else {
            self.inner.produce_results_internal(consumer, context);
        }
    }
}

impl<T: Send + Sync + 'static> ThrottleInner<T> {
    fn produce_results_internal(
        self: &Arc<Self>,
        consumer: Arc<dyn Consumer<T>>,
        context: Arc<ProducerContext>,
    ) {
        context
            .listener()
            .on_producer_finish_with_success(&context, PRODUCER_NAME, None);
        let wrapped = Arc::new(BaseConsumer::new(ThrottlerHandler {
            inner: self.clone(),
            downstream: consumer,
        }));
        self.next.produce_results(wrapped, context);
    }

    fn on_request_finished(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            match state.pending.pop_front() {
                Some(next) => Some(next),
                None => {
                    state.num_current_requests -= 1;
                    None
                }
            }
        };
        if let Some((consumer, context)) = next {
            let inner = self.clone();
            self.executor.execute(Box::new(move || {
                inner.produce_results_internal(consumer, context);
            }));
        }
    }
}

/// Forwards everything downstream and releases the slot on the terminal
/// signal.
struct ThrottlerHandler<T: Send + Sync + 'static> {
    inner: Arc<ThrottleInner<T>>,
    downstream: Arc<dyn Consumer<T>>,
}

impl<T: Send + Sync + 'static> ConsumerHandler<T> for ThrottlerHandler<T> {
    fn on_new_result_impl(&self, result: T, status: ConsumerStatus) {
        self.downstream.on_new_result(result, status);
        if status.is_last() {
            self.inner.on_request_finished();
        }
    }

    fn on_failure_impl(&self, error: DynError) {
        self.downstream.on_failure(error);
        self.inner.on_request_finished();
    }

    fn on_cancellation_impl(&self) {
        self.downstream.on_cancellation();
        self.inner.on_request_finished();
    }

    fn on_progress_update_impl(&self, progress: f32) {
        self.downstream.on_progress_update(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{CallerThreadExecutor, ImageRequest, NoopListener, Priority};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    #[derive(Default)]
    struct CountingConsumer {
        finals: AtomicUsize,
    }

    impl Consumer<u32> for CountingConsumer {
        fn on_new_result(&self, _result: u32, status: ConsumerStatus) {
            if status.is_last() {
                self.finals.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn on_failure(&self, _error: DynError) {}
        fn on_cancellation(&self) {}
        fn on_progress_update(&self, _progress: f32) {}
    }

    /// Upstream that holds onto its consumers until the test completes them.
    #[derive(Default)]
    struct ManualProducer {
        consumers: Mutex<Vec<Arc<dyn Consumer<u32>>>>,
    }

    impl ManualProducer {
        fn started(&self) -> usize {
            self.consumers.lock().len()
        }

        fn finish(&self, index: usize) {
            let consumer = self.consumers.lock()[index].clone();
            consumer.on_new_result(1, ConsumerStatus::IS_LAST);
        }
    }

    impl Producer<u32> for ManualProducer {
        fn produce_results(&self, consumer: Arc<dyn Consumer<u32>>, _context: Arc<ProducerContext>) {
            self.consumers.lock().push(consumer);
        }
    }

    fn context(id: &str) -> Arc<ProducerContext> {
        Arc::new(ProducerContext::new(
            ImageRequest::new(Url::parse("https://example.com/a.jpg").unwrap()),
            id,
            Arc::new(NoopListener),
            false,
            true,
            Priority::Medium,
        ))
    }

    #[test]
    fn requests_over_the_cap_wait_their_turn() {
        let upstream = Arc::new(ManualProducer::default());
        let producer = ThrottlingProducer::new(upstream.clone(), Arc::new(CallerThreadExecutor), 2);

        let consumers: Vec<_> = (0..4).map(|_| Arc::new(CountingConsumer::default())).collect();
        for (i, consumer) in consumers.iter().enumerate() {
            producer.produce_results(consumer.clone(), context(&format!("r{i}")));
        }
        assert_eq!(upstream.started(), 2);
        assert_eq!(producer.pending_count(), 2);

        upstream.finish(0);
        assert_eq!(consumers[0].finals.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.started(), 3);

        upstream.finish(1);
        upstream.finish(2);
        upstream.finish(3);
        assert_eq!(upstream.started(), 4);
        for consumer in &consumers {
            assert_eq!(consumer.finals.load(Ordering::SeqCst), 1);
        }
        assert_eq!(producer.pending_count(), 0);
    }

    #[test]
    fn failures_release_the_slot_too() {
        let upstream = Arc::new(ManualProducer::default());
        let producer = ThrottlingProducer::new(upstream.clone(), Arc::new(CallerThreadExecutor), 1);

        producer.produce_results(Arc::new(CountingConsumer::default()), context("r0"));
        producer.produce_results(Arc::new(CountingConsumer::default()), context("r1"));
        assert_eq!(upstream.started(), 1);

        let first = upstream.consumers.lock()[0].clone();
        first.on_failure(Arc::new(std::io::Error::other("boom")));
        assert_eq!(upstream.started(), 2);
    }
}
