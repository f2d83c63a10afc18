//! Decodes encoded bytes into bitmaps, progressively where possible.

use std::sync::Arc;

use pipeline_core::{
    BaseConsumer, Consumer, ConsumerHandler, ConsumerStatus, ContextCallbacks, DynError, Executor,
    ExtraMap, MonotonicClock, Producer, ProducerContext, ScheduledExecutor,
};
use tracing::warn;

use crate::error::PipelineError;
use crate::image::{DecodedImage, EncodedImage};
use crate::job_scheduler::JobScheduler;

pub const PRODUCER_NAME: &str = "DecodeProducer";

/// Decoding strategy. Partial inputs may legitimately fail; the stage
/// retries on the next intermediate result.
pub type DecodeFn = Arc<dyn Fn(&EncodedImage) -> Result<DecodedImage, PipelineError> + Send + Sync>;

/// Decode stage. Every intermediate result replaces the pending decode
/// input; a [`JobScheduler`] coalesces decode runs and enforces a minimum
/// interval between them, so a fast network cannot flood the decoder.
pub struct DecodeProducer {
    next: Arc<dyn Producer<EncodedImage>>,
    executor: Arc<dyn Executor>,
    scheduled_executor: Arc<dyn ScheduledExecutor>,
    clock: Arc<dyn MonotonicClock>,
    decode: DecodeFn,
    minimum_decode_interval_ms: u64,
}

impl DecodeProducer {
    pub fn new(
        next: Arc<dyn Producer<EncodedImage>>,
        executor: Arc<dyn Executor>,
        scheduled_executor: Arc<dyn ScheduledExecutor>,
        clock: Arc<dyn MonotonicClock>,
        decode: DecodeFn,
        minimum_decode_interval_ms: u64,
    ) -> DecodeProducer {
        DecodeProducer {
            next,
            executor,
            scheduled_executor,
            clock,
            decode,
            minimum_decode_interval_ms,
        }
    }
}

impl Producer<Arc<DecodedImage>> for DecodeProducer {
    fn produce_results(
        &self,
        consumer: Arc<dyn Consumer<Arc<DecodedImage>>>,
        context: Arc<ProducerContext>,
    ) {
        context.listener().on_producer_start(&context, PRODUCER_NAME);

        let decode = self.decode.clone();
        let job_context = context.clone();
        let job_consumer = consumer.clone();
        let scheduler = JobScheduler::new(
            self.executor.clone(),
            self.scheduled_executor.clone(),
            self.clock.clone(),
            Box::new(move |image, status| {
                run_decode(&decode, &job_consumer, &job_context, image, status);
            }),
            self.minimum_decode_interval_ms,
        );

        // A consumer that starts expecting only the final result may flip to
        // wanting intermediates (e.g. the image scrolled on screen); kick a
        // pending decode when that happens.
        context.add_callbacks(Arc::new(ScheduleOnIntermediateChange {
            scheduler: scheduler.clone(),
            context: context.clone(),
        }));

        let wrapped = Arc::new(BaseConsumer::new(ProgressiveDecodeHandler {
            scheduler,
            consumer,
            context: context.clone(),
        }));
        self.next.produce_results(wrapped, context);
    }
}

fn run_decode(
    decode: &DecodeFn,
    consumer: &Arc<dyn Consumer<Arc<DecodedImage>>>,
    context: &Arc<ProducerContext>,
    image: Option<EncodedImage>,
    status: ConsumerStatus,
) {
    let Some(image) = image else {
        return;
    };
    if context.is_cancelled() {
        return;
    }
    let is_last = status.is_last();
    let listener = context.listener();
    match decode(&image) {
        Ok(decoded) => {
            if is_last {
                let extra = listener.requires_extra_map(context).then(|| {
                    let mut extra = ExtraMap::new();
                    extra.insert("encoded_size".to_owned(), image.size().to_string());
                    extra.insert("width".to_owned(), decoded.width.to_string());
                    extra.insert("height".to_owned(), decoded.height.to_string());
                    extra
                });
                listener.on_producer_finish_with_success(context, PRODUCER_NAME, extra);
            }
            consumer.on_new_result(Arc::new(decoded), status);
        }
        Err(error) => {
            if is_last {
                let error: DynError = Arc::new(error);
                listener.on_producer_finish_with_failure(context, PRODUCER_NAME, &error, None);
                consumer.on_failure(error);
            } else {
                // Partial bytes frequently fail to decode; the next
                // intermediate result gets another chance.
                warn!(
                    request_id = context.id(),
                    error = %error,
                    "intermediate decode failed, waiting for more data"
                );
            }
        }
    }
}

struct ScheduleOnIntermediateChange {
    scheduler: Arc<JobScheduler>,
    context: Arc<ProducerContext>,
}

impl ContextCallbacks for ScheduleOnIntermediateChange {
    fn on_is_intermediate_result_expected_changed(&self) {
        if self.context.is_intermediate_result_expected() {
            self.scheduler.schedule_job();
        }
    }
}

struct ProgressiveDecodeHandler {
    scheduler: Arc<JobScheduler>,
    consumer: Arc<dyn Consumer<Arc<DecodedImage>>>,
    context: Arc<ProducerContext>,
}

impl ConsumerHandler<EncodedImage> for ProgressiveDecodeHandler {
    fn on_new_result_impl(&self, result: EncodedImage, status: ConsumerStatus) {
        if !self.scheduler.update_job(Some(result), status) {
            return;
        }
        if status.is_last() || self.context.is_intermediate_result_expected() {
            self.scheduler.schedule_job();
        }
    }

    fn on_failure_impl(&self, error: DynError) {
        self.scheduler.clear_job();
        self.consumer.on_failure(error);
    }

    fn on_cancellation_impl(&self) {
        self.scheduler.clear_job();
        self.consumer.on_cancellation();
    }

    fn on_progress_update_impl(&self, progress: f32) {
        self.consumer.on_progress_update(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use pipeline_core::{
        DeferredExecutor, ImageRequest, ManualClock, ManualScheduledExecutor, NoopListener,
        Priority,
    };
    use url::Url;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Decoded(u32, bool),
        Failure(String),
        Cancelled,
    }

    #[derive(Default)]
    struct RecordingConsumer {
        events: Mutex<Vec<Event>>,
    }

    impl Consumer<Arc<DecodedImage>> for RecordingConsumer {
        fn on_new_result(&self, result: Arc<DecodedImage>, status: ConsumerStatus) {
            self.events
                .lock()
                .push(Event::Decoded(result.width, status.is_last()));
        }
        fn on_failure(&self, error: DynError) {
            self.events.lock().push(Event::Failure(error.to_string()));
        }
        fn on_cancellation(&self) {
            self.events.lock().push(Event::Cancelled);
        }
        fn on_progress_update(&self, _progress: f32) {}
    }

    /// Upstream the test drives by hand.
    #[derive(Default)]
    struct ManualProducer {
        consumers: Mutex<Vec<Arc<dyn Consumer<EncodedImage>>>>,
    }

    impl Producer<EncodedImage> for ManualProducer {
        fn produce_results(
            &self,
            consumer: Arc<dyn Consumer<EncodedImage>>,
            _context: Arc<ProducerContext>,
        ) {
            self.consumers.lock().push(consumer);
        }
    }

    /// Treats the byte length as the image width; fails on short inputs so
    /// tests can simulate undecodable partial data.
    fn length_decoder(minimum: usize) -> DecodeFn {
        Arc::new(move |image: &EncodedImage| {
            if image.size() < minimum {
                return Err(PipelineError::decode("truncated input"));
            }
            Ok(DecodedImage {
                width: image.size() as u32,
                height: 1,
                pixels: image.bytes(),
            })
        })
    }

    struct Fixture {
        upstream: Arc<ManualProducer>,
        producer: DecodeProducer,
        executor: Arc<DeferredExecutor>,
        clock: Arc<ManualClock>,
        scheduled: Arc<ManualScheduledExecutor>,
    }

    fn fixture(decode: DecodeFn, minimum_interval_ms: u64) -> Fixture {
        let upstream = Arc::new(ManualProducer::default());
        let executor = Arc::new(DeferredExecutor::new());
        let clock = Arc::new(ManualClock::new());
        let scheduled = Arc::new(ManualScheduledExecutor::new(clock.clone()));
        let producer = DecodeProducer::new(
            upstream.clone(),
            executor.clone(),
            scheduled.clone(),
            clock.clone(),
            decode,
            minimum_interval_ms,
        );
        Fixture {
            upstream,
            producer,
            executor,
            clock,
            scheduled,
        }
    }

    fn context(expect_intermediate: bool) -> Arc<ProducerContext> {
        Arc::new(ProducerContext::new(
            ImageRequest::new(Url::parse("https://example.com/a.jpg").unwrap()),
            "r1",
            Arc::new(NoopListener),
            false,
            expect_intermediate,
            Priority::Medium,
        ))
    }

    fn encoded(size: usize) -> EncodedImage {
        EncodedImage::new(Bytes::from(vec![0u8; size]))
    }

    #[test]
    fn final_result_is_decoded_and_forwarded() {
        let f = fixture(length_decoder(0), 0);
        let consumer = Arc::new(RecordingConsumer::default());
        f.producer.produce_results(consumer.clone(), context(true));

        let upstream_consumer = f.upstream.consumers.lock()[0].clone();
        upstream_consumer.on_new_result(encoded(10), ConsumerStatus::IS_LAST);
        f.executor.run_until_idle();
        assert_eq!(*consumer.events.lock(), vec![Event::Decoded(10, true)]);
    }

    #[test]
    fn intermediates_coalesce_under_the_minimum_interval() {
        let f = fixture(length_decoder(0), 100);
        let consumer = Arc::new(RecordingConsumer::default());
        f.producer.produce_results(consumer.clone(), context(true));
        let upstream_consumer = f.upstream.consumers.lock()[0].clone();

        // First intermediate decodes immediately.
        upstream_consumer.on_new_result(encoded(10), ConsumerStatus::empty());
        f.executor.run_until_idle();
        assert_eq!(*consumer.events.lock(), vec![Event::Decoded(10, false)]);

        // Two more intermediates inside the interval: only the newest is
        // decoded, after the interval elapses.
        upstream_consumer.on_new_result(encoded(20), ConsumerStatus::empty());
        upstream_consumer.on_new_result(encoded(30), ConsumerStatus::empty());
        f.executor.run_until_idle();
        assert_eq!(consumer.events.lock().len(), 1);

        f.clock.advance_ms(100);
        f.scheduled.run_due();
        assert_eq!(
            *consumer.events.lock(),
            vec![Event::Decoded(10, false), Event::Decoded(30, false)]
        );
    }

    #[test]
    fn failed_intermediate_decode_is_not_terminal() {
        let f = fixture(length_decoder(15), 0);
        let consumer = Arc::new(RecordingConsumer::default());
        f.producer.produce_results(consumer.clone(), context(true));
        let upstream_consumer = f.upstream.consumers.lock()[0].clone();

        upstream_consumer.on_new_result(encoded(10), ConsumerStatus::empty());
        f.executor.run_until_idle();
        assert!(consumer.events.lock().is_empty());

        upstream_consumer.on_new_result(encoded(20), ConsumerStatus::IS_LAST);
        f.executor.run_until_idle();
        assert_eq!(*consumer.events.lock(), vec![Event::Decoded(20, true)]);
    }

    #[test]
    fn failed_final_decode_fails_the_request() {
        let f = fixture(length_decoder(100), 0);
        let consumer = Arc::new(RecordingConsumer::default());
        f.producer.produce_results(consumer.clone(), context(true));
        let upstream_consumer = f.upstream.consumers.lock()[0].clone();

        upstream_consumer.on_new_result(encoded(10), ConsumerStatus::IS_LAST);
        f.executor.run_until_idle();
        assert_eq!(
            *consumer.events.lock(),
            vec![Event::Failure("decode failed: truncated input".to_owned())]
        );
    }

    #[test]
    fn intermediates_are_held_until_they_are_expected() {
        let f = fixture(length_decoder(0), 0);
        let consumer = Arc::new(RecordingConsumer::default());
        let context = context(false);
        f.producer.produce_results(consumer.clone(), context.clone());
        let upstream_consumer = f.upstream.consumers.lock()[0].clone();

        upstream_consumer.on_new_result(encoded(10), ConsumerStatus::empty());
        f.executor.run_until_idle();
        assert!(consumer.events.lock().is_empty());

        // Flipping the expectation kicks the pending decode.
        context.set_is_intermediate_result_expected(true);
        f.executor.run_until_idle();
        assert_eq!(*consumer.events.lock(), vec![Event::Decoded(10, false)]);
    }

    #[test]
    fn upstream_failure_and_cancellation_pass_through() {
        let f = fixture(length_decoder(0), 0);
        let consumer = Arc::new(RecordingConsumer::default());
        f.producer.produce_results(consumer.clone(), context(true));
        let upstream_consumer = f.upstream.consumers.lock()[0].clone();
        upstream_consumer.on_failure(Arc::new(std::io::Error::other("boom")));
        assert_eq!(
            *consumer.events.lock(),
            vec![Event::Failure("boom".to_owned())]
        );

        let consumer = Arc::new(RecordingConsumer::default());
        f.producer.produce_results(consumer.clone(), context(true));
        let upstream_consumer = f.upstream.consumers.lock()[1].clone();
        upstream_consumer.on_cancellation();
        assert_eq!(*consumer.events.lock(), vec![Event::Cancelled]);
    }
}
