//! Cooperative, tick-driven scheduler
//!
//! [`TickScheduler`] owns no threads. Each call to [`TickScheduler::tick`]
//! takes one clock snapshot and runs every task due at that snapshot on the
//! calling thread, in strict priority order. Only one thread may tick at a
//! time; submissions and cancellations are safe from any thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::clock::{Clock, ClockHold};
use super::error::{InvariantViolation, SchedulerError, SchedulerResult};
use super::failure::TaskFailure;
use super::queue::QueueSets;
use super::task::{TaskAction, TaskHandle, TaskKind, TaskOptions, TaskPriority};
use super::{build_task, Scheduler};

#[derive(Debug, Default)]
struct Signal {
    /// Bumped on every insertion.
    arrivals: u64,
    interrupted: bool,
}

/// Scheduler driven by an external loop.
///
/// # Example
///
/// ```
/// use priosched::runtime::scheduler::{Scheduler, TickScheduler};
///
/// let scheduler = TickScheduler::new(false);
/// scheduler.submit(|| println!("tick"), None).unwrap();
/// assert_eq!(scheduler.tick().unwrap(), 1);
/// ```
#[derive(Debug)]
pub struct TickScheduler {
    queues: QueueSets,
    clock: Clock,
    blocking: bool,
    default_priority: TaskPriority,
    signal: Mutex<Signal>,
    arrived: Condvar,
    ticking: AtomicUsize,
}

impl TickScheduler {
    /// Create a scheduler on the monotonic clock. A blocking scheduler's
    /// `tick` waits for work instead of returning 0.
    pub fn new(blocking: bool) -> Self {
        Self::with_clock(blocking, Clock::new())
    }

    pub fn with_clock(
        blocking: bool,
        clock: Clock,
    ) -> Self {
        Self {
            queues: QueueSets::new(),
            clock,
            blocking,
            default_priority: TaskPriority::default(),
            signal: Mutex::new(Signal::default()),
            arrived: Condvar::new(),
            ticking: AtomicUsize::new(0),
        }
    }

    /// Use `priority` for submissions that do not name one.
    pub fn with_default_priority(
        mut self,
        priority: TaskPriority,
    ) -> Self {
        self.default_priority = priority;
        self
    }

    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[inline]
    pub fn queues(&self) -> &QueueSets {
        &self.queues
    }

    /// Freeze the clock for a burst of submissions, so they are ordered
    /// against a single time snapshot.
    pub fn hold_clock(&self) -> ClockHold<'_> {
        self.clock.hold()
    }

    /// Run every task due now. Returns how many ran.
    ///
    /// A blocking scheduler waits until something is due. A panicking action
    /// ends the tick with [`SchedulerError::TaskFailed`]; it still counts as
    /// executed (a recurring task is already rescheduled) and the remaining
    /// due tasks stay queued for the next tick.
    pub fn tick(&self) -> SchedulerResult<usize> {
        let _entry = self.enter();
        loop {
            let ran = self.run_due()?;
            if ran > 0 || !self.blocking {
                return Ok(ran);
            }
            self.wait_for_work()?;
        }
    }

    /// Wake a tick blocked waiting for work; it fails with
    /// [`SchedulerError::Interrupted`]. If no tick is waiting, the next
    /// blocking wait is interrupted instead.
    pub fn interrupt(&self) {
        self.signal.lock().interrupted = true;
        self.arrived.notify_all();
    }

    /// Whether anything is due at the current time.
    pub fn has_due_tasks(&self) -> bool {
        self.queues.next_due(self.clock.now(), None).is_some()
    }

    pub fn queued_task_count(&self) -> usize {
        self.queues.len()
    }

    /// Cancel every queued task.
    pub fn clear(&self) -> Vec<TaskHandle> {
        self.queues.cancel_all()
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.queues.check_invariants()
    }

    fn run_due(&self) -> SchedulerResult<usize> {
        let now = self.clock.now();
        let mut ran = 0;

        while let Some(task) = self.queues.pop_due(now) {
            if !self.queues.begin_execution(&task) {
                continue;
            }
            tracing::trace!("tick running {}", task.id());
            let outcome = task.run();
            self.queues.complete_execution(&task, self.clock.now());
            ran += 1;

            if let Err(payload) = outcome {
                let failure = TaskFailure::from_panic(task.id(), payload.as_ref());
                tracing::debug!("tick stopped after {} tasks: {}", ran, failure);
                return Err(failure.into());
            }
        }

        Ok(ran)
    }

    fn wait_for_work(&self) -> SchedulerResult<()> {
        let mut signal = self.signal.lock();
        let seen = signal.arrivals;
        loop {
            if signal.interrupted {
                signal.interrupted = false;
                return Err(SchedulerError::Interrupted);
            }
            if signal.arrivals != seen {
                return Ok(());
            }

            // Same reading as `run_due`, so a held clock cannot make this
            // report work that the next pass will not find due.
            let now = self.clock.now();
            match self.queues.next_run_at() {
                Some(at) if at <= now => return Ok(()),
                Some(at) => {
                    self.arrived
                        .wait_for(&mut signal, Duration::from_millis(at - now));
                },
                None => self.arrived.wait(&mut signal),
            }
        }
    }

    fn enter(&self) -> TickEntry<'_> {
        let previous = self.ticking.fetch_add(1, Ordering::SeqCst);
        let entry = TickEntry {
            ticking: &self.ticking,
        };
        debug_assert_eq!(previous, 0, "TickScheduler::tick entered concurrently");
        entry
    }
}

impl Scheduler for TickScheduler {
    #[inline]
    fn default_priority(&self) -> TaskPriority {
        self.default_priority
    }

    fn schedule(
        &self,
        action: TaskAction,
        delay: Duration,
        kind: TaskKind,
        options: TaskOptions,
    ) -> SchedulerResult<TaskHandle> {
        let priority = options.priority.unwrap_or(self.default_priority);
        let task = {
            let hold = self.clock.hold();
            let task = build_task(
                &self.queues,
                hold.now(),
                action,
                delay,
                kind,
                priority,
                options.failure_handler,
            )?;
            self.queues.add(task.clone());
            task
        };

        self.signal.lock().arrivals += 1;
        self.arrived.notify_all();
        Ok(TaskHandle::new(task))
    }

    fn cancel(
        &self,
        handle: &TaskHandle,
    ) -> bool {
        self.queues.cancel(handle.task())
    }
}

/// Leaves the reentrancy counter on drop, even when a tick unwinds.
struct TickEntry<'a> {
    ticking: &'a AtomicUsize,
}

impl Drop for TickEntry<'_> {
    fn drop(&mut self) {
        self.ticking.fetch_sub(1, Ordering::SeqCst);
    }
}
