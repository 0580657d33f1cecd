//! Priority task scheduling
//!
//! Two schedulers share one task model and one set of per-priority queues:
//!
//! - [`PriorityScheduler`] runs tasks on an elastic pool of worker threads.
//!   High work gets a thread right away, low work waits a bounded time for a
//!   thread to free up before the pool grows, starvable work only uses idle
//!   threads.
//! - [`TickScheduler`] has no threads. Tasks run on the caller's thread, one
//!   batch per [`TickScheduler::tick`].
//!
//! Both implement [`Scheduler`], so submitting code does not care which one it
//! talks to.

pub mod clock;
pub mod error;
pub mod failure;
pub mod priority;
pub mod queue;
pub mod task;
pub mod thread_factory;
pub mod tick;
pub mod worker_pool;

pub use clock::{Clock, ClockHold, ManualTimeSource, MonotonicSource, TimeSource};
pub use error::{InvariantViolation, SchedulerError, SchedulerResult};
pub use failure::{FailureHandler, FailureRouter, TaskFailure};
pub use priority::{PriorityScheduler, SchedulerStats, ShutdownMode, StatsSnapshot};
pub use queue::{QueueKind, QueueSet, QueueSets, QueueSlot};
pub use task::{
    RecurrenceMode, Task, TaskAction, TaskHandle, TaskId, TaskKind, TaskOptions, TaskPriority,
    TaskState,
};
pub use thread_factory::{ConfigurableThreadFactory, ThreadFactory};
pub use tick::TickScheduler;
pub use worker_pool::{is_interrupted, WorkerPool};

pub use crate::util::config::SchedulerConfig;

use std::sync::Arc;
use std::time::Duration;

use self::clock::duration_millis;

/// Common submission interface of both schedulers.
pub trait Scheduler: Send + Sync {
    /// Priority used when a submission does not name one.
    fn default_priority(&self) -> TaskPriority;

    /// Queue `action` to first run after `delay`.
    fn schedule(
        &self,
        action: TaskAction,
        delay: Duration,
        kind: TaskKind,
        options: TaskOptions,
    ) -> SchedulerResult<TaskHandle>;

    /// Cancel a task. Returns false if it already ran, is running as a
    /// one-time task, or was cancelled before.
    fn cancel(
        &self,
        handle: &TaskHandle,
    ) -> bool;

    /// Run `action` once, as soon as possible.
    fn submit<F>(
        &self,
        action: F,
        priority: Option<TaskPriority>,
    ) -> SchedulerResult<TaskHandle>
    where
        F: FnMut() + Send + 'static,
        Self: Sized,
    {
        self.schedule(Box::new(action), Duration::ZERO, TaskKind::OneTime, priority.into())
    }

    /// Run `action` once, `delay` from now.
    fn submit_after<F>(
        &self,
        action: F,
        delay: Duration,
        priority: Option<TaskPriority>,
    ) -> SchedulerResult<TaskHandle>
    where
        F: FnMut() + Send + 'static,
        Self: Sized,
    {
        self.schedule(Box::new(action), delay, TaskKind::OneTime, priority.into())
    }

    /// Run `action` every `period`, starting `initial_delay` from now.
    fn submit_recurring<F>(
        &self,
        action: F,
        initial_delay: Duration,
        period: Duration,
        mode: RecurrenceMode,
        priority: Option<TaskPriority>,
    ) -> SchedulerResult<TaskHandle>
    where
        F: FnMut() + Send + 'static,
        Self: Sized,
    {
        self.schedule(
            Box::new(action),
            initial_delay,
            TaskKind::Recurring { period, mode },
            priority.into(),
        )
    }

    /// Run `action` once, `delay` from now, with explicit options.
    fn submit_with<F>(
        &self,
        action: F,
        delay: Duration,
        options: TaskOptions,
    ) -> SchedulerResult<TaskHandle>
    where
        F: FnMut() + Send + 'static,
        Self: Sized,
    {
        self.schedule(Box::new(action), delay, TaskKind::OneTime, options)
    }
}

/// Validate a submission and build its task at `now`.
pub(crate) fn build_task(
    queues: &QueueSets,
    now: u64,
    action: TaskAction,
    delay: Duration,
    kind: TaskKind,
    priority: TaskPriority,
    failure_handler: Option<Arc<dyn FailureHandler>>,
) -> SchedulerResult<Arc<Task>> {
    if let TaskKind::Recurring { period, .. } = kind {
        if duration_millis(period) == 0 {
            return Err(SchedulerError::InvalidPeriod);
        }
    }
    let task = Task::new(queues.next_id(), priority, kind, delay, now, action)
        .with_failure_handler(failure_handler);
    Ok(Arc::new(task))
}

#[cfg(test)]
mod tests;
