//! Wires the stages into a working pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pipeline_core::{
    Consumer, ConsumerStatus, DynError, Executor, ImageRequest, MonotonicClock, Priority, Producer,
    ProducerContext, ProducerListener, ScheduledExecutor,
};
use tracing::debug;

use crate::cache::{EncodedMemoryCache, SharedMemoryCache};
use crate::config::{HttpFetcherConfig, PriorityFetcherConfig};
use crate::error::PipelineError;
use crate::image::{DecodedImage, EncodedImage};
use crate::multiplex::MultiplexProducer;
use crate::network::NetworkFetcher;
use crate::network::http::HttpNetworkFetcher;
use crate::network::priority::PriorityNetworkFetcher;
use crate::producers::{
    DecodeFn, DecodeProducer, EncodedMemoryCacheProducer, NetworkFetchProducer,
    ThreadHandoffProducer, ThrottlingProducer,
};

/// Pipeline-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct ImagePipelineConfig {
    /// Capacity of the encoded memory cache, in bytes.
    pub memory_cache_max_size_bytes: u64,

    /// Cap on requests running below the throttling stage.
    pub max_simultaneous_requests: usize,

    /// Floor between successive decode runs for one request.
    pub minimum_decode_interval_ms: u64,

    pub priority_fetcher: PriorityFetcherConfig,

    pub http: HttpFetcherConfig,
}

impl Default for ImagePipelineConfig {
    fn default() -> Self {
        Self {
            memory_cache_max_size_bytes: 16 * 1024 * 1024,
            max_simultaneous_requests: 5,
            minimum_decode_interval_ms: 100,
            priority_fetcher: PriorityFetcherConfig::default(),
            http: HttpFetcherConfig::default(),
        }
    }
}

/// The assembled pipeline.
///
/// The chain, from the caller inward: thread handoff, decode, encoded
/// memory cache, multiplexer, throttling, network fetch through the
/// priority fetcher. Prefetches run the same chain without the decode
/// stage, so they warm the encoded cache and stop there.
pub struct ImagePipeline<F: NetworkFetcher = HttpNetworkFetcher> {
    decoded_chain: Arc<dyn Producer<Arc<DecodedImage>>>,
    encoded_chain: Arc<dyn Producer<EncodedImage>>,
    fetcher: Arc<PriorityNetworkFetcher<F>>,
    cache: SharedMemoryCache,
    listener: Arc<dyn ProducerListener>,
    next_request_id: AtomicU64,
}

impl ImagePipeline<HttpNetworkFetcher> {
    /// Builds the production pipeline with an HTTP delegate fetcher.
    pub fn new(
        config: ImagePipelineConfig,
        decode: DecodeFn,
        executor: Arc<dyn Executor>,
        scheduled_executor: Arc<dyn ScheduledExecutor>,
        clock: Arc<dyn MonotonicClock>,
        listener: Arc<dyn ProducerListener>,
    ) -> Result<ImagePipeline<HttpNetworkFetcher>, PipelineError> {
        let http = Arc::new(HttpNetworkFetcher::new(&config.http, executor.clone())?);
        ImagePipeline::with_fetcher(
            http,
            config,
            decode,
            executor,
            scheduled_executor,
            clock,
            listener,
        )
    }
}

impl<F: NetworkFetcher> ImagePipeline<F> {
    /// Builds the pipeline around an arbitrary delegate fetcher.
    #[allow(clippy::too_many_arguments)]
    pub fn with_fetcher(
        delegate: Arc<F>,
        config: ImagePipelineConfig,
        decode: DecodeFn,
        executor: Arc<dyn Executor>,
        scheduled_executor: Arc<dyn ScheduledExecutor>,
        clock: Arc<dyn MonotonicClock>,
        listener: Arc<dyn ProducerListener>,
    ) -> Result<ImagePipeline<F>, PipelineError> {
        let fetcher = Arc::new(PriorityNetworkFetcher::new(
            delegate,
            config.priority_fetcher.clone(),
            clock.clone(),
            scheduled_executor.clone(),
        )?);
        let cache: SharedMemoryCache =
            Arc::new(EncodedMemoryCache::new(config.memory_cache_max_size_bytes));

        let network = Arc::new(NetworkFetchProducer::new(fetcher.clone(), clock.clone()));
        let throttled = Arc::new(ThrottlingProducer::new(
            network,
            executor.clone(),
            config.max_simultaneous_requests,
        ));
        let multiplexed = Arc::new(MultiplexProducer::by_cache_key(throttled));
        let cached = Arc::new(EncodedMemoryCacheProducer::new(multiplexed, cache.clone()));
        let decoded = Arc::new(DecodeProducer::new(
            cached.clone(),
            executor.clone(),
            scheduled_executor,
            clock,
            decode,
            config.minimum_decode_interval_ms,
        ));

        Ok(ImagePipeline {
            decoded_chain: Arc::new(ThreadHandoffProducer::new(decoded, executor.clone())),
            encoded_chain: Arc::new(ThreadHandoffProducer::new(cached, executor)),
            fetcher,
            cache,
            listener,
            next_request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> String {
        format!("req-{}", self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Starts fetching and decoding an image. Results stream into
    /// `consumer`; the returned context cancels the request or changes its
    /// priority.
    pub fn fetch_decoded(
        &self,
        request: ImageRequest,
        consumer: Arc<dyn Consumer<Arc<DecodedImage>>>,
        priority: Priority,
    ) -> Arc<ProducerContext> {
        let is_intermediate_result_expected = request.progressive_rendering_enabled();
        let context = Arc::new(ProducerContext::new(
            request,
            self.next_id(),
            self.listener.clone(),
            false,
            is_intermediate_result_expected,
            priority,
        ));
        debug!(request_id = context.id(), uri = %context.request().uri(), "image fetch submitted");
        self.decoded_chain.produce_results(consumer, context.clone());
        context
    }

    /// Warms the encoded memory cache at low priority without decoding.
    pub fn prefetch(&self, request: ImageRequest) -> Arc<ProducerContext> {
        let context = Arc::new(ProducerContext::new(
            request,
            self.next_id(),
            self.listener.clone(),
            true,
            false,
            Priority::Low,
        ));
        debug!(request_id = context.id(), uri = %context.request().uri(), "prefetch submitted");
        self.encoded_chain
            .produce_results(Arc::new(DiscardingConsumer), context.clone());
        context
    }

    /// Drops any cached encoded bytes for `request`.
    pub fn evict_from_memory_cache(&self, request: &ImageRequest) {
        self.cache.remove(&request.cache_key());
    }

    pub fn memory_cache(&self) -> &SharedMemoryCache {
        &self.cache
    }

    /// Stops dispatching network fetches; queued work resumes on
    /// [`resume_network`](ImagePipeline::resume_network).
    pub fn pause_network(&self) {
        self.fetcher.pause();
    }

    pub fn resume_network(&self) {
        self.fetcher.resume();
    }
}

/// Consumer for prefetches: the value is the cache side effect.
struct DiscardingConsumer;

impl Consumer<EncodedImage> for DiscardingConsumer {
    fn on_new_result(&self, _result: EncodedImage, _status: ConsumerStatus) {}
    fn on_failure(&self, error: DynError) {
        debug!(error = %error, "prefetch failed");
    }
    fn on_cancellation(&self) {}
    fn on_progress_update(&self, _progress: f32) {}
}
