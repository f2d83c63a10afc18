//! The producer side of the protocol.

use std::sync::Arc;

use crate::consumer::Consumer;
use crate::context::ProducerContext;

/// A pipeline stage that generates a stream of results for a consumer.
///
/// `produce_results` must return promptly: anything that may block or take
/// non-trivial time is handed to an executor, and results are delivered to
/// `consumer` from whatever thread produced them. The consumer contract
/// (zero or more intermediates, exactly one terminal signal) binds every
/// implementation.
pub trait Producer<T>: Send + Sync {
    fn produce_results(&self, consumer: Arc<dyn Consumer<T>>, context: Arc<ProducerContext>);
}
