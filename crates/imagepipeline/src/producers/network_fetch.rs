//! Terminal stage: streams image bytes from a network fetcher.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use pipeline_core::{Consumer, ConsumerStatus, MonotonicClock, Producer, ProducerContext};
use tracing::trace;

use crate::error::FetchError;
use crate::image::EncodedImage;
use crate::network::{FetchCallback, FetchStateHolder, NetworkFetcher};

pub const PRODUCER_NAME: &str = "NetworkFetchProducer";
const INTERMEDIATE_RESULT_PRODUCER_EVENT: &str = "intermediate_result";

const READ_SIZE: usize = 16 * 1024;

/// Floor between successive intermediate deliveries; byte chunks arriving
/// faster than this are folded into the next delivery.
const TIME_BETWEEN_PARTIAL_RESULTS_MS: u64 = 100;

/// Progress for bodies with no declared length flattens out around 50 KiB.
fn calculate_progress(downloaded: usize, content_length: Option<u64>) -> f32 {
    match content_length {
        Some(total) if total > 0 => (downloaded as f64 / total as f64).min(1.0) as f32,
        _ => (1.0 - (-(downloaded as f64) / 50_000.0).exp()) as f32,
    }
}

pub struct NetworkFetchProducer<F: NetworkFetcher> {
    fetcher: Arc<F>,
    clock: Arc<dyn MonotonicClock>,
}

impl<F: NetworkFetcher> NetworkFetchProducer<F> {
    pub fn new(fetcher: Arc<F>, clock: Arc<dyn MonotonicClock>) -> NetworkFetchProducer<F> {
        NetworkFetchProducer { fetcher, clock }
    }
}

impl<F: NetworkFetcher> Producer<EncodedImage> for NetworkFetchProducer<F> {
    fn produce_results(
        &self,
        consumer: Arc<dyn Consumer<EncodedImage>>,
        context: Arc<ProducerContext>,
    ) {
        context.listener().on_producer_start(&context, PRODUCER_NAME);
        let state = Arc::new(self.fetcher.create_fetch_state(consumer, context));
        let callback = Arc::new(NetworkFetchCallback {
            fetcher: self.fetcher.clone(),
            clock: self.clock.clone(),
            state: state.clone(),
        });
        self.fetcher.fetch(&state, callback);
    }
}

struct NetworkFetchCallback<F: NetworkFetcher> {
    fetcher: Arc<F>,
    clock: Arc<dyn MonotonicClock>,
    state: Arc<F::State>,
}

impl<F: NetworkFetcher> NetworkFetchCallback<F> {
    fn extra_status(&self) -> ConsumerStatus {
        if self.fetcher.should_propagate_statuses() {
            *self.state.fetch_state().on_new_result_status.lock()
        } else {
            ConsumerStatus::empty()
        }
    }

    fn notify_consumer(&self, buffer: &[u8], status: ConsumerStatus) {
        let image = EncodedImage::new(Bytes::copy_from_slice(buffer));
        self.state.fetch_state().consumer().on_new_result(image, status);
    }

    fn should_propagate_intermediate_results(&self) -> bool {
        let context = self.state.fetch_state().context();
        context.request().progressive_rendering_enabled()
            && context.is_intermediate_result_expected()
    }

    fn maybe_handle_intermediate_result(&self, buffer: &[u8]) {
        if !self.should_propagate_intermediate_results() {
            return;
        }
        let fetch_state = self.state.fetch_state();
        let now = self.clock.now_ms();
        let last = fetch_state
            .last_intermediate_result_time_ms
            .load(Ordering::SeqCst);
        if now.saturating_sub(last) < TIME_BETWEEN_PARTIAL_RESULTS_MS {
            return;
        }
        fetch_state
            .last_intermediate_result_time_ms
            .store(now, Ordering::SeqCst);
        let context = fetch_state.context();
        context
            .listener()
            .on_producer_event(context, PRODUCER_NAME, INTERMEDIATE_RESULT_PRODUCER_EVENT);
        self.notify_consumer(buffer, self.extra_status());
    }

    fn handle_final_result(&self, buffer: &[u8]) {
        let fetch_state = self.state.fetch_state();
        let context = fetch_state.context();
        let listener = context.listener();
        let extra = if listener.requires_extra_map(context) {
            self.fetcher.extra_map(&self.state, buffer.len())
        } else {
            None
        };
        listener.on_producer_finish_with_success(context, PRODUCER_NAME, extra);
        listener.on_ultimate_producer_reached(context, PRODUCER_NAME, true);
        self.fetcher.on_fetch_completion(&self.state, buffer.len());
        self.notify_consumer(buffer, ConsumerStatus::IS_LAST | self.extra_status());
    }

    fn handle_failure(&self, error: FetchError) {
        let fetch_state = self.state.fetch_state();
        let context = fetch_state.context();
        let listener = context.listener();
        let error: pipeline_core::DynError = Arc::new(error);
        listener.on_producer_finish_with_failure(context, PRODUCER_NAME, &error, None);
        listener.on_ultimate_producer_reached(context, PRODUCER_NAME, false);
        fetch_state.consumer().on_failure(error);
    }
}

impl<F: NetworkFetcher> FetchCallback for NetworkFetchCallback<F> {
    fn on_response(&self, mut body: Box<dyn Read + Send>, content_length: Option<u64>) {
        trace!(
            request_id = self.state.fetch_state().id(),
            content_length, "response stream opened"
        );
        let mut buffer: Vec<u8> = Vec::with_capacity(
            content_length
                .and_then(|len| usize::try_from(len).ok())
                .unwrap_or(READ_SIZE),
        );
        let mut chunk = [0u8; READ_SIZE];
        loop {
            match body.read(&mut chunk) {
                Ok(0) => {
                    self.handle_final_result(&buffer);
                    return;
                }
                Ok(read) => {
                    buffer.extend_from_slice(&chunk[..read]);
                    self.maybe_handle_intermediate_result(&buffer);
                    let progress = calculate_progress(buffer.len(), content_length);
                    self.state
                        .fetch_state()
                        .consumer()
                        .on_progress_update(progress);
                }
                Err(error) => {
                    self.handle_failure(FetchError::io(&error));
                    return;
                }
            }
        }
    }

    fn on_failure(&self, error: FetchError) {
        self.handle_failure(error);
    }

    fn on_cancellation(&self) {
        let fetch_state = self.state.fetch_state();
        let context = fetch_state.context();
        context
            .listener()
            .on_producer_finish_with_cancellation(context, PRODUCER_NAME, None);
        fetch_state.consumer().on_cancellation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FetchState;
    use parking_lot::Mutex;
    use pipeline_core::{DynError, ImageRequest, ManualClock, NoopListener, Priority};
    use url::Url;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Result(usize, bool),
        Failure(String),
        Cancelled,
    }

    #[derive(Default)]
    struct RecordingConsumer {
        events: Mutex<Vec<Event>>,
        progress: Mutex<Vec<f32>>,
    }

    impl Consumer<EncodedImage> for RecordingConsumer {
        fn on_new_result(&self, result: EncodedImage, status: ConsumerStatus) {
            self.events
                .lock()
                .push(Event::Result(result.size(), status.is_last()));
        }
        fn on_failure(&self, error: DynError) {
            self.events.lock().push(Event::Failure(error.to_string()));
        }
        fn on_cancellation(&self) {
            self.events.lock().push(Event::Cancelled);
        }
        fn on_progress_update(&self, progress: f32) {
            self.progress.lock().push(progress);
        }
    }

    /// Fetcher that immediately serves a canned body on `fetch`.
    struct CannedFetcher {
        body: Vec<u8>,
        content_length: Option<u64>,
        /// Advanced on every read so intermediate throttling can be driven
        /// from inside the pump loop.
        clock: Arc<ManualClock>,
        advance_per_read_ms: u64,
        chunk_size: usize,
    }

    struct SteppingReader {
        data: Vec<u8>,
        position: usize,
        clock: Arc<ManualClock>,
        advance_per_read_ms: u64,
        chunk_size: usize,
    }

    impl Read for SteppingReader {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            self.clock.advance_ms(self.advance_per_read_ms);
            let remaining = self.data.len() - self.position;
            let take = remaining.min(self.chunk_size).min(out.len());
            out[..take].copy_from_slice(&self.data[self.position..self.position + take]);
            self.position += take;
            Ok(take)
        }
    }

    impl NetworkFetcher for CannedFetcher {
        type State = FetchState;

        fn create_fetch_state(
            &self,
            consumer: Arc<dyn Consumer<EncodedImage>>,
            context: Arc<ProducerContext>,
        ) -> FetchState {
            FetchState::new(consumer, context)
        }

        fn fetch(&self, _state: &Arc<FetchState>, callback: Arc<dyn FetchCallback>) {
            callback.on_response(
                Box::new(SteppingReader {
                    data: self.body.clone(),
                    position: 0,
                    clock: self.clock.clone(),
                    advance_per_read_ms: self.advance_per_read_ms,
                    chunk_size: self.chunk_size,
                }),
                self.content_length,
            );
        }
    }

    fn context(progressive: bool) -> Arc<ProducerContext> {
        let request = ImageRequest::new(Url::parse("https://example.com/a.jpg").unwrap())
            .with_progressive_rendering(progressive);
        Arc::new(ProducerContext::new(
            request,
            "r1",
            Arc::new(NoopListener),
            false,
            true,
            Priority::Medium,
        ))
    }

    #[test]
    fn full_body_is_delivered_as_the_final_result() {
        let clock = Arc::new(ManualClock::new());
        let fetcher = Arc::new(CannedFetcher {
            body: vec![7u8; 1000],
            content_length: Some(1000),
            clock: clock.clone(),
            advance_per_read_ms: 0,
            chunk_size: 400,
        });
        let producer = NetworkFetchProducer::new(fetcher, clock);
        let consumer = Arc::new(RecordingConsumer::default());

        producer.produce_results(consumer.clone(), context(false));
        assert_eq!(*consumer.events.lock(), vec![Event::Result(1000, true)]);
        let progress = consumer.progress.lock().clone();
        assert_eq!(progress, vec![0.4, 0.8, 1.0]);
    }

    #[test]
    fn intermediate_results_are_rate_limited() {
        let clock = Arc::new(ManualClock::new());
        // 5 chunks, 60ms apart: intermediates land at 120 and 240ms, the
        // other chunks fall inside the 100ms window.
        let fetcher = Arc::new(CannedFetcher {
            body: vec![7u8; 500],
            content_length: Some(500),
            clock: clock.clone(),
            advance_per_read_ms: 60,
            chunk_size: 100,
        });
        let producer = NetworkFetchProducer::new(fetcher, clock);
        let consumer = Arc::new(RecordingConsumer::default());

        producer.produce_results(consumer.clone(), context(true));
        assert_eq!(
            *consumer.events.lock(),
            vec![
                Event::Result(200, false),
                Event::Result(400, false),
                Event::Result(500, true),
            ]
        );
    }

    #[test]
    fn non_progressive_requests_get_no_intermediates() {
        let clock = Arc::new(ManualClock::new());
        let fetcher = Arc::new(CannedFetcher {
            body: vec![7u8; 500],
            content_length: Some(500),
            clock: clock.clone(),
            advance_per_read_ms: 200,
            chunk_size: 100,
        });
        let producer = NetworkFetchProducer::new(fetcher, clock);
        let consumer = Arc::new(RecordingConsumer::default());

        producer.produce_results(consumer.clone(), context(false));
        assert_eq!(*consumer.events.lock(), vec![Event::Result(500, true)]);
    }

    #[test]
    fn unknown_length_progress_is_monotonic_and_below_one() {
        let clock = Arc::new(ManualClock::new());
        let fetcher = Arc::new(CannedFetcher {
            body: vec![7u8; 100_000],
            content_length: None,
            clock: clock.clone(),
            advance_per_read_ms: 0,
            chunk_size: 25_000,
        });
        let producer = NetworkFetchProducer::new(fetcher, clock);
        let consumer = Arc::new(RecordingConsumer::default());

        producer.produce_results(consumer.clone(), context(false));
        let progress = consumer.progress.lock().clone();
        assert_eq!(progress.len(), 4);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert!(progress.iter().all(|p| *p > 0.0 && *p < 1.0));
    }

    #[test]
    fn fetch_failure_reaches_the_consumer() {
        struct FailingFetcher;
        impl NetworkFetcher for FailingFetcher {
            type State = FetchState;
            fn create_fetch_state(
                &self,
                consumer: Arc<dyn Consumer<EncodedImage>>,
                context: Arc<ProducerContext>,
            ) -> FetchState {
                FetchState::new(consumer, context)
            }
            fn fetch(&self, _state: &Arc<FetchState>, callback: Arc<dyn FetchCallback>) {
                callback.on_failure(FetchError::connection("refused"));
            }
        }

        let producer = NetworkFetchProducer::new(Arc::new(FailingFetcher), Arc::new(ManualClock::new()));
        let consumer = Arc::new(RecordingConsumer::default());
        producer.produce_results(consumer.clone(), context(false));
        assert_eq!(
            *consumer.events.lock(),
            vec![Event::Failure("connection failed: refused".to_owned())]
        );
    }
}
