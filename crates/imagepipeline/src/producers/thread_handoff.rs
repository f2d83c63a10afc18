//! Moves request processing off the calling thread.

use std::sync::Arc;

use pipeline_core::{Consumer, Executor, Producer, ProducerContext};

pub const PRODUCER_NAME: &str = "ThreadHandoffProducer";

/// First stage of every chain: hands the rest of the pipeline to the
/// background executor so the caller returns immediately.
pub struct ThreadHandoffProducer<T> {
    next: Arc<dyn Producer<T>>,
    executor: Arc<dyn Executor>,
}

impl<T: 'static> ThreadHandoffProducer<T> {
    pub fn new(next: Arc<dyn Producer<T>>, executor: Arc<dyn Executor>) -> ThreadHandoffProducer<T> {
        ThreadHandoffProducer { next, executor }
    }
}

impl<T: 'static> Producer<T> for ThreadHandoffProducer<T> {
    fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>) {
        context.listener().on_producer_start(&context, PRODUCER_NAME);
        let next = self.next.clone();
        self.executor.execute(Box::new(move || {
            // Cancellations racing the handoff are resolved here rather than
            // starting a pass nobody wants.
            if context.is_cancelled() {
                context
                    .listener()
                    .on_producer_finish_with_cancellation(&context, PRODUCER_NAME, None);
                consumer.on_cancellation();
                return;
            }
            context
                .listener()
                .on_producer_finish_with_success(&context, PRODUCER_NAME, None);
            next.produce_results(consumer, context);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{
        ConsumerStatus, DeferredExecutor, DynError, ImageRequest, NoopListener, Priority,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    #[derive(Default)]
    struct CountingConsumer {
        results: AtomicUsize,
        cancellations: AtomicUsize,
    }

    impl Consumer<u32> for CountingConsumer {
        fn on_new_result(&self, _result: u32, _status: ConsumerStatus) {
            self.results.fetch_add(1, Ordering::SeqCst);
        }
        fn on_failure(&self, _error: DynError) {}
        fn on_cancellation(&self) {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
        }
        fn on_progress_update(&self, _progress: f32) {}
    }

    struct ImmediateProducer;

    impl Producer<u32> for ImmediateProducer {
        fn produce_results(&self, consumer: Arc<dyn Consumer<u32>>, _context: Arc<ProducerContext>) {
            consumer.on_new_result(7, ConsumerStatus::IS_LAST);
        }
    }

    fn context() -> Arc<ProducerContext> {
        Arc::new(ProducerContext::new(
            ImageRequest::new(Url::parse("https://example.com/a.jpg").unwrap()),
            "r1",
            Arc::new(NoopListener),
            false,
            true,
            Priority::Medium,
        ))
    }

    #[test]
    fn work_happens_on_the_executor() {
        let executor = Arc::new(DeferredExecutor::new());
        let producer = ThreadHandoffProducer::new(Arc::new(ImmediateProducer), executor.clone());
        let consumer = Arc::new(CountingConsumer::default());

        producer.produce_results(consumer.clone(), context());
        assert_eq!(consumer.results.load(Ordering::SeqCst), 0);
        executor.run_pending();
        assert_eq!(consumer.results.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_before_the_handoff_runs_short_circuits() {
        let executor = Arc::new(DeferredExecutor::new());
        let downstream_started = Arc::new(AtomicUsize::new(0));

        struct TrackingProducer(Arc<AtomicUsize>);
        impl Producer<u32> for TrackingProducer {
            fn produce_results(
                &self,
                _consumer: Arc<dyn Consumer<u32>>,
                _context: Arc<ProducerContext>,
            ) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let producer = ThreadHandoffProducer::new(
            Arc::new(TrackingProducer(downstream_started.clone())),
            executor.clone(),
        );
        let consumer = Arc::new(CountingConsumer::default());
        let context = context();

        producer.produce_results(consumer.clone(), context.clone());
        context.cancel();
        executor.run_pending();

        assert_eq!(consumer.cancellations.load(Ordering::SeqCst), 1);
        assert_eq!(downstream_started.load(Ordering::SeqCst), 0);
    }
}
