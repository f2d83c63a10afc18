//! Encoded memory cache read/write stage.

use std::sync::Arc;

use pipeline_core::{Consumer, ConsumerStatus, DelegatingHandler, Producer, ProducerContext};
use tracing::trace;

use crate::cache::SharedMemoryCache;
use crate::image::EncodedImage;

pub const PRODUCER_NAME: &str = "EncodedMemoryCacheProducer";
const EXTRA_CACHED_VALUE_FOUND: &str = "cached_value_found";

/// Serves encoded bytes from the memory cache; on a miss, forwards the
/// request upstream and writes the final result back into the cache.
pub struct EncodedMemoryCacheProducer {
    next: Arc<dyn Producer<EncodedImage>>,
    cache: SharedMemoryCache,
}

impl EncodedMemoryCacheProducer {
    pub fn new(
        next: Arc<dyn Producer<EncodedImage>>,
        cache: SharedMemoryCache,
    ) -> EncodedMemoryCacheProducer {
        EncodedMemoryCacheProducer { next, cache }
    }
}

impl Producer<EncodedImage> for EncodedMemoryCacheProducer {
    fn produce_results(
        &self,
        consumer: Arc<dyn Consumer<EncodedImage>>,
        context: Arc<ProducerContext>,
    ) {
        let listener = context.listener().clone();
        listener.on_producer_start(&context, PRODUCER_NAME);
        let key = context.request().cache_key();

        if let Some(image) = self.cache.get(&key) {
            trace!(request_id = context.id(), "encoded memory cache hit");
            let extra = listener.requires_extra_map(&context).then(|| {
                [(EXTRA_CACHED_VALUE_FOUND.to_owned(), "true".to_owned())]
                    .into_iter()
                    .collect()
            });
            listener.on_producer_finish_with_success(&context, PRODUCER_NAME, extra);
            listener.on_ultimate_producer_reached(&context, PRODUCER_NAME, true);
            consumer.on_progress_update(1.0);
            consumer.on_new_result(image, ConsumerStatus::IS_LAST);
            return;
        }

        let extra = listener.requires_extra_map(&context).then(|| {
            [(EXTRA_CACHED_VALUE_FOUND.to_owned(), "false".to_owned())]
                .into_iter()
                .collect()
        });
        listener.on_producer_finish_with_success(&context, PRODUCER_NAME, extra);

        let cache = self.cache.clone();
        let wrapped = DelegatingHandler::new(
            consumer,
            move |image: EncodedImage, status: ConsumerStatus, downstream| {
                // Only the full final image is worth caching; partial bytes
                // and do-not-cache results pass straight through.
                if status.is_last()
                    && !status.contains(ConsumerStatus::DO_NOT_CACHE_ENCODED)
                    && !status.contains(ConsumerStatus::IS_PARTIAL_RESULT)
                {
                    cache.put(key.clone(), image.clone());
                }
                downstream.on_new_result(image, status);
            },
        )
        .into_consumer();
        self.next.produce_results(wrapped, context);
    }
}
