//! # Image Pipeline Engine
//!
//! Multi-stage streaming image pipeline: requests flow down a chain of
//! producers (thread handoff, decode, memory cache, multiplexing,
//! throttling, network fetch) and results stream back up through consumers,
//! with progressive intermediate results along the way.
//!
//! The building blocks live in [`pipeline_core`]; this crate provides the
//! concrete stages and the assembled [`ImagePipeline`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use imagepipeline_engine::{ImagePipeline, ImagePipelineConfig};
//! use pipeline_core::{ImageRequest, SystemClock, TokioExecutor, TracingListener};
//! use url::Url;
//!
//! # fn decode_fn() -> imagepipeline_engine::DecodeFn { unimplemented!() }
//! # fn consumer() -> Arc<dyn pipeline_core::Consumer<Arc<imagepipeline_engine::DecodedImage>>> { unimplemented!() }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let executor = Arc::new(TokioExecutor::new(runtime.handle().clone()));
//! let pipeline = ImagePipeline::new(
//!     ImagePipelineConfig::default(),
//!     decode_fn(),
//!     executor.clone(),
//!     executor,
//!     Arc::new(SystemClock::new()),
//!     Arc::new(TracingListener),
//! )?;
//! let request = ImageRequest::new(Url::parse("https://example.com/a.jpg")?)
//!     .with_progressive_rendering(true);
//! let context = pipeline.fetch_decoded(request, consumer(), pipeline_core::Priority::High);
//! # drop(context);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod image;
pub mod job_scheduler;
pub mod multiplex;
pub mod network;
pub mod pipeline;
pub mod producers;

pub use cache::{EncodedMemoryCache, MemoryCache, SharedMemoryCache};
pub use config::{HttpFetcherConfig, PriorityFetcherConfig};
pub use error::{FetchError, PipelineError};
pub use image::{DecodedImage, EncodedImage};
pub use job_scheduler::JobScheduler;
pub use multiplex::MultiplexProducer;
pub use network::http::HttpNetworkFetcher;
pub use network::priority::PriorityNetworkFetcher;
pub use network::{FetchCallback, FetchState, FetchStateHolder, NetworkFetcher};
pub use pipeline::{ImagePipeline, ImagePipelineConfig};
pub use producers::DecodeFn;
