//! Network fetching abstractions.
//!
//! A [`NetworkFetcher`] turns a request into a byte stream and reports back
//! through a [`FetchCallback`]. Fetchers are layered: the priority fetcher
//! wraps a delegate fetcher and only reorders when work reaches it, the
//! HTTP fetcher at the bottom actually talks to the network.

pub mod http;
pub mod priority;

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;
use pipeline_core::{BytesRange, Consumer, ConsumerStatus, ExtraMap, ProducerContext};
use url::Url;

use crate::error::FetchError;
use crate::image::EncodedImage;

/// Per-fetch bookkeeping shared by every fetcher layer.
pub struct FetchState {
    consumer: Arc<dyn Consumer<EncodedImage>>,
    context: Arc<ProducerContext>,
    /// When the last intermediate result was pushed downstream, for
    /// throttling partial deliveries.
    pub last_intermediate_result_time_ms: AtomicU64,
    /// Extra status flags a fetcher wants stamped on delivered results.
    pub on_new_result_status: Mutex<ConsumerStatus>,
    /// Byte range the server actually honored, if any.
    pub response_bytes_range: Mutex<Option<BytesRange>>,
}

impl FetchState {
    pub fn new(consumer: Arc<dyn Consumer<EncodedImage>>, context: Arc<ProducerContext>) -> Self {
        FetchState {
            consumer,
            context,
            last_intermediate_result_time_ms: AtomicU64::new(0),
            on_new_result_status: Mutex::new(ConsumerStatus::empty()),
            response_bytes_range: Mutex::new(None),
        }
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer<EncodedImage>> {
        &self.consumer
    }

    pub fn context(&self) -> &Arc<ProducerContext> {
        &self.context
    }

    pub fn id(&self) -> &str {
        self.context.id()
    }

    pub fn uri(&self) -> &Url {
        self.context.request().uri()
    }
}

/// Access to the shared [`FetchState`] from any fetcher layer's state type.
pub trait FetchStateHolder {
    fn fetch_state(&self) -> &FetchState;
}

impl FetchStateHolder for FetchState {
    fn fetch_state(&self) -> &FetchState {
        self
    }
}

/// How a fetcher reports back. Exactly one of `on_failure` and
/// `on_cancellation` or a successful response terminates the fetch.
pub trait FetchCallback: Send + Sync {
    /// The response body is ready to be streamed. `content_length` is the
    /// total body size when the server declared one.
    fn on_response(&self, body: Box<dyn Read + Send>, content_length: Option<u64>);

    fn on_failure(&self, error: FetchError);

    fn on_cancellation(&self);
}

/// A source of image bytes.
pub trait NetworkFetcher: Send + Sync + 'static {
    /// Fetcher-specific per-request state.
    type State: FetchStateHolder + Send + Sync + 'static;

    fn create_fetch_state(
        &self,
        consumer: Arc<dyn Consumer<EncodedImage>>,
        context: Arc<ProducerContext>,
    ) -> Self::State;

    /// Starts the fetch. Must not block the caller; the callback fires on
    /// whatever thread the fetcher runs on.
    fn fetch(&self, state: &Arc<Self::State>, callback: Arc<dyn FetchCallback>);

    /// Whether result statuses carry fetcher-specific flags that the
    /// network producer should propagate.
    fn should_propagate_statuses(&self) -> bool {
        false
    }

    /// Notification that the full body was read. `byte_size` is the final
    /// image size.
    fn on_fetch_completion(&self, _state: &Arc<Self::State>, _byte_size: usize) {}

    /// Diagnostics attached to the listener's finish event.
    fn extra_map(&self, _state: &Arc<Self::State>, _byte_size: usize) -> Option<ExtraMap> {
        None
    }
}
