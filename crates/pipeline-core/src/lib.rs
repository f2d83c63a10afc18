//! # Pipeline Core
//!
//! Leaf abstractions for building streaming image-processing pipelines.
//!
//! A pipeline is a chain of [`Producer`]s. Each producer generates a stream
//! of results for a [`Consumer`]: zero or more intermediate results followed
//! by exactly one terminal signal (final result, failure, or cancellation).
//! A shared [`ProducerContext`] threads priority, prefetch status and
//! cooperative cancellation through every stage of the chain.
//!
//! This crate deliberately contains no I/O. Anything that may block runs on
//! an injected [`Executor`], never on the thread that started the request.

use std::sync::Arc;

pub mod clock;
pub mod consumer;
pub mod context;
pub mod executor;
pub mod listener;
pub mod priority;
pub mod producer;
pub mod refs;
pub mod request;

pub use clock::{ManualClock, MonotonicClock, SystemClock};
pub use consumer::{BaseConsumer, Consumer, ConsumerHandler, ConsumerStatus, DelegatingHandler};
pub use context::{ContextCallbacks, ProducerContext};
pub use executor::{
    CallerThreadExecutor, DeferredExecutor, Executor, ManualScheduledExecutor, ScheduledExecutor,
    Task, TokioExecutor,
};
pub use listener::{ExtraMap, NoopListener, ProducerListener, TracingListener};
pub use priority::Priority;
pub use producer::Producer;
pub use refs::CloseableRef;
pub use request::{BytesRange, ImageRequest, SourceKind};

/// Shared failure payload delivered through [`Consumer::on_failure`].
///
/// Terminal failures fan out to every consumer attached to a multiplexed
/// request, so the causal error is reference counted rather than cloned.
pub type DynError = Arc<dyn std::error::Error + Send + Sync + 'static>;
