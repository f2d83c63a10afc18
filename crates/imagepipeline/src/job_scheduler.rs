//! Coalescing scheduler for decode jobs.
//!
//! A stage feeds every intermediate result into [`JobScheduler::update_job`];
//! the scheduler keeps only the newest payload and runs the job closure at
//! most once per minimum interval. Results that arrive while a job runs are
//! coalesced into a single follow-up run.

use std::sync::Arc;

use parking_lot::Mutex;
use pipeline_core::{ConsumerStatus, Executor, MonotonicClock, ScheduledExecutor};
use std::time::Duration;
use tracing::trace;

use crate::image::EncodedImage;

/// The closure a scheduler drives. Receives the latest pending payload and
/// its status; runs on the injected executor.
pub type JobFn = Box<dyn Fn(Option<EncodedImage>, ConsumerStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Idle,
    Queued,
    Running,
    RunningAndPending,
}

struct SchedulerState {
    job: Option<EncodedImage>,
    status: ConsumerStatus,
    job_state: JobState,
    /// When the most recent job actually started; `None` before the first
    /// run, so the first job is never held back by the minimum interval.
    job_start_time_ms: Option<u64>,
    /// When the most recent job was submitted for execution.
    job_submit_time_ms: u64,
}

/// Runs a job closure against the most recent payload, spacing consecutive
/// runs by at least a minimum interval.
///
/// State machine: `Idle` → `Queued` on schedule, `Queued` → `Running` when
/// the job starts, and a schedule request during `Running` moves to
/// `RunningAndPending` so exactly one more run follows. Payload updates in
/// any state just replace the stored payload; the freshest data always wins.
pub struct JobScheduler {
    executor: Arc<dyn Executor>,
    scheduled_executor: Arc<dyn ScheduledExecutor>,
    clock: Arc<dyn MonotonicClock>,
    job: JobFn,
    minimum_job_interval_ms: u64,
    state: Mutex<SchedulerState>,
}

impl JobScheduler {
    pub fn new(
        executor: Arc<dyn Executor>,
        scheduled_executor: Arc<dyn ScheduledExecutor>,
        clock: Arc<dyn MonotonicClock>,
        job: JobFn,
        minimum_job_interval_ms: u64,
    ) -> Arc<JobScheduler> {
        Arc::new(JobScheduler {
            executor,
            scheduled_executor,
            clock,
            job,
            minimum_job_interval_ms,
            state: Mutex::new(SchedulerState {
                job: None,
                status: ConsumerStatus::empty(),
                job_state: JobState::Idle,
                job_start_time_ms: None,
                job_submit_time_ms: 0,
            }),
        })
    }

    fn should_process(job: Option<&EncodedImage>, status: ConsumerStatus) -> bool {
        status.is_last() || status.contains(ConsumerStatus::IS_PLACEHOLDER) || job.is_some()
    }

    /// Stores a new payload, replacing whatever was pending. Returns false
    /// if the payload is not processable (no image, not last, not a
    /// placeholder), in which case nothing is stored.
    pub fn update_job(&self, job: Option<EncodedImage>, status: ConsumerStatus) -> bool {
        if !Self::should_process(job.as_ref(), status) {
            return false;
        }
        let mut state = self.state.lock();
        state.job = job;
        state.status = status;
        true
    }

    /// Requests a run of the job closure over the currently stored payload.
    ///
    /// Returns false if there is nothing processable to run. Otherwise the
    /// run happens as soon as the minimum interval since the previous run
    /// start allows, coalescing with an in-flight run if there is one.
    pub fn schedule_job(self: &Arc<Self>) -> bool {
        let now = self.clock.now_ms();
        let enqueue_delay_ms = {
            let mut state = self.state.lock();
            if !Self::should_process(state.job.as_ref(), state.status) {
                return false;
            }
            match state.job_state {
                JobState::Idle => {
                    let when = match state.job_start_time_ms {
                        Some(start) => now.max(start.saturating_add(self.minimum_job_interval_ms)),
                        None => now,
                    };
                    state.job_submit_time_ms = now;
                    state.job_state = JobState::Queued;
                    Some(when - now)
                }
                JobState::Running => {
                    state.job_state = JobState::RunningAndPending;
                    None
                }
                JobState::Queued | JobState::RunningAndPending => None,
            }
        };
        if let Some(delay_ms) = enqueue_delay_ms {
            self.enqueue_job(delay_ms);
        }
        true
    }

    /// Discards the stored payload without touching the state machine. A
    /// queued run still happens but sees an empty payload.
    pub fn clear_job(&self) {
        let mut state = self.state.lock();
        state.job = None;
        state.status = ConsumerStatus::empty();
    }

    /// How long the most recent run sat queued before starting.
    pub fn queued_time_ms(&self) -> u64 {
        let state = self.state.lock();
        state
            .job_start_time_ms
            .unwrap_or(0)
            .saturating_sub(state.job_submit_time_ms)
    }

    fn enqueue_job(self: &Arc<Self>, delay_ms: u64) {
        let scheduler = self.clone();
        let submit: pipeline_core::Task = Box::new(move || scheduler.do_job());
        if delay_ms > 0 {
            self.scheduled_executor
                .schedule(Duration::from_millis(delay_ms), submit);
        } else {
            self.executor.execute(submit);
        }
    }

    fn do_job(self: Arc<Self>) {
        let now = self.clock.now_ms();
        let (job, status) = {
            let mut state = self.state.lock();
            let job = state.job.take();
            let status = state.status;
            state.status = ConsumerStatus::empty();
            state.job_state = JobState::Running;
            state.job_start_time_ms = Some(now);
            (job, status)
        };

        if Self::should_process(job.as_ref(), status) {
            (self.job)(job, status);
        } else {
            trace!("skipping job run, payload was cleared");
        }
        self.on_job_finished();
    }

    fn on_job_finished(self: &Arc<Self>) {
        let now = self.clock.now_ms();
        let enqueue_delay_ms = {
            let mut state = self.state.lock();
            if state.job_state == JobState::RunningAndPending {
                let when = match state.job_start_time_ms {
                    Some(start) => now.max(start.saturating_add(self.minimum_job_interval_ms)),
                    None => now,
                };
                state.job_submit_time_ms = now;
                state.job_state = JobState::Queued;
                Some(when - now)
            } else {
                state.job_state = JobState::Idle;
                None
            }
        };
        if let Some(delay_ms) = enqueue_delay_ms {
            self.enqueue_job(delay_ms);
        }
    }
}
