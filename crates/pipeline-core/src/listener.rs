//! Producer instrumentation.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::DynError;
use crate::context::ProducerContext;

/// Free-form string instrumentation attached to listener events.
pub type ExtraMap = HashMap<String, String>;

/// Receives lifecycle events from every producer in the chain.
///
/// Producers only build an [`ExtraMap`] when [`requires_extra_map`]
/// returns true, so listeners that do not care pay no allocation cost.
///
/// [`requires_extra_map`]: ProducerListener::requires_extra_map
pub trait ProducerListener: Send + Sync {
    fn on_producer_start(&self, context: &ProducerContext, producer_name: &str);

    fn on_producer_event(&self, context: &ProducerContext, producer_name: &str, event_name: &str);

    fn on_producer_finish_with_success(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        extra: Option<ExtraMap>,
    );

    fn on_producer_finish_with_failure(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        error: &DynError,
        extra: Option<ExtraMap>,
    );

    fn on_producer_finish_with_cancellation(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        extra: Option<ExtraMap>,
    );

    /// Reports that `producer_name` was the producer that ultimately
    /// fulfilled (or failed) the request.
    fn on_ultimate_producer_reached(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        success: bool,
    );

    /// Whether finish events for this request should carry an extras map.
    fn requires_extra_map(&self, _context: &ProducerContext) -> bool {
        false
    }
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ProducerListener for NoopListener {
    fn on_producer_start(&self, _context: &ProducerContext, _producer_name: &str) {}

    fn on_producer_event(
        &self,
        _context: &ProducerContext,
        _producer_name: &str,
        _event_name: &str,
    ) {
    }

    fn on_producer_finish_with_success(
        &self,
        _context: &ProducerContext,
        _producer_name: &str,
        _extra: Option<ExtraMap>,
    ) {
    }

    fn on_producer_finish_with_failure(
        &self,
        _context: &ProducerContext,
        _producer_name: &str,
        _error: &DynError,
        _extra: Option<ExtraMap>,
    ) {
    }

    fn on_producer_finish_with_cancellation(
        &self,
        _context: &ProducerContext,
        _producer_name: &str,
        _extra: Option<ExtraMap>,
    ) {
    }

    fn on_ultimate_producer_reached(
        &self,
        _context: &ProducerContext,
        _producer_name: &str,
        _success: bool,
    ) {
    }
}

/// Listener that emits structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl ProducerListener for TracingListener {
    fn on_producer_start(&self, context: &ProducerContext, producer_name: &str) {
        debug!(request_id = %context.id(), producer = producer_name, "producer start");
    }

    fn on_producer_event(&self, context: &ProducerContext, producer_name: &str, event_name: &str) {
        debug!(
            request_id = %context.id(),
            producer = producer_name,
            event = event_name,
            "producer event"
        );
    }

    fn on_producer_finish_with_success(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        extra: Option<ExtraMap>,
    ) {
        debug!(
            request_id = %context.id(),
            producer = producer_name,
            extra = ?extra,
            "producer finished"
        );
    }

    fn on_producer_finish_with_failure(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        error: &DynError,
        extra: Option<ExtraMap>,
    ) {
        warn!(
            request_id = %context.id(),
            producer = producer_name,
            error = %error,
            extra = ?extra,
            "producer failed"
        );
    }

    fn on_producer_finish_with_cancellation(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        extra: Option<ExtraMap>,
    ) {
        debug!(
            request_id = %context.id(),
            producer = producer_name,
            extra = ?extra,
            "producer cancelled"
        );
    }

    fn on_ultimate_producer_reached(
        &self,
        context: &ProducerContext,
        producer_name: &str,
        success: bool,
    ) {
        debug!(
            request_id = %context.id(),
            producer = producer_name,
            success,
            "ultimate producer reached"
        );
    }

    fn requires_extra_map(&self, _context: &ProducerContext) -> bool {
        true
    }
}
