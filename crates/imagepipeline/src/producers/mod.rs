//! The pipeline stages, each a [`Producer`] wrapping the next one.
//!
//! [`Producer`]: pipeline_core::Producer

pub mod decode;
pub mod memory_cache;
pub mod network_fetch;
pub mod thread_handoff;
pub mod throttling;

pub use decode::{DecodeFn, DecodeProducer};
pub use memory_cache::EncodedMemoryCacheProducer;
pub use network_fetch::NetworkFetchProducer;
pub use thread_handoff::ThreadHandoffProducer;
pub use throttling::ThrottlingProducer;
