//! Engine configuration.

use std::time::Duration;

use crate::error::PipelineError;

/// Configuration for the priority fetch queue.
#[derive(Debug, Clone)]
pub struct PriorityFetcherConfig {
    /// If true, high-priority requests are dequeued in the order they were
    /// enqueued; otherwise newest-first.
    pub is_hi_pri_fifo: bool,

    /// Concurrency cap while any high-priority work is admitted. Must be
    /// strictly greater than `max_outstanding_low_pri` so high-priority
    /// traffic always has exclusive headroom.
    pub max_outstanding_hi_pri: usize,

    /// Concurrency cap for admitting low-priority work.
    pub max_outstanding_low_pri: usize,

    /// If false, a cancellation request leaves an already-dispatched fetch
    /// running; the delegate keeps its connection instead of tearing it
    /// down only for a duplicate to re-open it.
    pub inflight_fetches_can_be_cancelled: bool,

    /// Total requeue budget per request; `-1` means unlimited. Exceeding it
    /// surfaces the failure to the original caller.
    pub max_number_of_requeue: i32,

    /// If true, cancellation requests are ignored entirely.
    pub do_not_cancel_requests: bool,

    /// Number of immediate requeues before a request is routed to the
    /// delayed queue instead, bounding retry storms.
    pub immediate_requeue_count: u32,

    /// Backoff window for the delayed queue. The window is shared: it is
    /// stamped when the first entry lands in an empty delayed queue and
    /// every entry waits for that same stamp to expire.
    pub requeue_delay_time_ms: u64,

    /// If true, one dequeue pass fills every free slot instead of
    /// dispatching a single request.
    pub multiple_dequeue: bool,

    /// If true, failures the delegate marked permanent are never requeued.
    pub non_recoverable_exception_prevents_requeue: bool,

    /// Retry threshold for connection-classified failures.
    pub max_connect_attempt_count: u32,

    /// Retry threshold across all failure kinds.
    pub max_attempt_count: u32,

    /// Retry every low-priority failure below the attempt thresholds,
    /// bypassing the allow-list (but not the per-kind flags below).
    pub retry_low_pri_all: bool,

    /// Whether unknown-host failures are retried at low priority. Takes
    /// precedence over `retry_low_pri_all` for that failure kind.
    pub retry_low_pri_unknown_host_exception: bool,

    /// Whether connection failures are retried at low priority. Takes
    /// precedence over `retry_low_pri_all` for that failure kind.
    pub retry_low_pri_connection_exception: bool,
}

impl Default for PriorityFetcherConfig {
    fn default() -> Self {
        Self {
            is_hi_pri_fifo: true,
            max_outstanding_hi_pri: 4,
            max_outstanding_low_pri: 2,
            inflight_fetches_can_be_cancelled: true,
            max_number_of_requeue: -1,
            do_not_cancel_requests: false,
            immediate_requeue_count: 4,
            requeue_delay_time_ms: 300,
            multiple_dequeue: false,
            non_recoverable_exception_prevents_requeue: true,
            max_connect_attempt_count: 3,
            max_attempt_count: 5,
            retry_low_pri_all: false,
            retry_low_pri_unknown_host_exception: false,
            retry_low_pri_connection_exception: true,
        }
    }
}

impl PriorityFetcherConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_outstanding_hi_pri <= self.max_outstanding_low_pri {
            return Err(PipelineError::configuration(format!(
                "max_outstanding_hi_pri ({}) must be > max_outstanding_low_pri ({})",
                self.max_outstanding_hi_pri, self.max_outstanding_low_pri
            )));
        }
        Ok(())
    }
}

/// Configuration for the HTTP delegate fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Time allowed to establish the connection.
    pub connect_timeout: Duration,

    /// Overall deadline for one request, response body included.
    pub request_timeout: Duration,

    pub user_agent: String,

    pub follow_redirects: bool,

    /// Idle connections kept per host for reuse across image fetches.
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("imagepipeline/", env!("CARGO_PKG_VERSION")).to_owned(),
            follow_redirects: true,
            pool_max_idle_per_host: 8,
        }
    }
}
