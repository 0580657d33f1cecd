//! Thread-pool backed priority scheduler
//!
//! Submissions land in the per-priority [`QueueSets`]. A single dispatcher
//! thread picks the next due task, asks the [`WorkerPool`] for a worker under
//! that task's growth policy and hands the task over. Workers run the action,
//! route panics through the [`FailureRouter`] and put recurring tasks back.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::sync::{Parker, Unparker};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::clock::{duration_millis, Clock};
use super::error::{InvariantViolation, SchedulerError, SchedulerResult};
use super::failure::{FailureRouter, TaskFailure};
use super::queue::QueueSets;
use super::task::{Task, TaskAction, TaskHandle, TaskKind, TaskOptions, TaskPriority, TaskState};
use super::thread_factory::ThreadFactory;
use super::worker_pool::{self, Acquire, Worker, WorkerHooks, WorkerPool};
use super::{build_task, Scheduler};
use crate::util::config::SchedulerConfig;

/// Back-off after the thread factory failed to start a worker.
const SPAWN_RETRY: Duration = Duration::from_millis(50);

/// What happens to queued work on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownMode {
    /// Cancel everything still queued.
    #[default]
    DiscardPending,
    /// Cancel recurring tasks but still run queued one-time tasks.
    DrainPending,
}

impl ShutdownMode {
    #[inline]
    fn as_u8(self) -> u8 {
        match self {
            ShutdownMode::DrainPending => 1,
            ShutdownMode::DiscardPending => 2,
        }
    }

    #[inline]
    fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => None,
            1 => Some(ShutdownMode::DrainPending),
            _ => Some(ShutdownMode::DiscardPending),
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Tasks accepted by the scheduler.
    pub tasks_submitted: AtomicUsize,
    /// Action invocations, failed ones included.
    pub tasks_executed: AtomicUsize,
    /// Action invocations that panicked.
    pub tasks_failed: AtomicUsize,
    /// Tasks cancelled by the caller or by shutdown.
    pub tasks_cancelled: AtomicUsize,
}

impl SchedulerStats {
    #[inline]
    pub fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_executed(&self) {
        self.tasks_executed.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_cancelled(
        &self,
        count: usize,
    ) {
        self.tasks_cancelled.fetch_add(count, Ordering::SeqCst);
    }
}

/// Point-in-time copy of the counters and pool gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub submitted: usize,
    pub executed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pool_size: usize,
    pub idle_workers: usize,
    pub queued: usize,
}

#[derive(Debug, Default)]
struct DispatcherState {
    unparker: Option<Unparker>,
    running: bool,
}

#[derive(Debug)]
struct Inner {
    queues: QueueSets,
    clock: Clock,
    pool: Arc<WorkerPool>,
    router: FailureRouter,
    default_priority: TaskPriority,
    low_wait_ms: AtomicU64,
    /// 0 while accepting work, else an encoded [`ShutdownMode`].
    shutdown: AtomicU8,
    dispatcher: Mutex<DispatcherState>,
    dispatcher_exited: Condvar,
    stats: SchedulerStats,
}

/// Priority scheduler backed by an elastic worker pool.
///
/// # Example
///
/// ```no_run
/// use priosched::runtime::scheduler::{PriorityScheduler, Scheduler, SchedulerConfig, TaskPriority};
///
/// let scheduler = PriorityScheduler::new(&SchedulerConfig::default());
/// scheduler.submit(|| println!("hello"), Some(TaskPriority::Low)).unwrap();
/// scheduler.shutdown();
/// ```
#[derive(Debug)]
pub struct PriorityScheduler {
    inner: Arc<Inner>,
}

impl PriorityScheduler {
    /// Create a scheduler with threads from the configured factory and
    /// failures written to stderr.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_parts(config, Arc::new(config.thread_factory()), FailureRouter::new())
    }

    /// Create a scheduler with an explicit thread factory and failure router.
    pub fn with_parts(
        config: &SchedulerConfig,
        factory: Arc<dyn ThreadFactory>,
        router: FailureRouter,
    ) -> Self {
        let pool = WorkerPool::new(config.pool_size, config.keep_alive(), factory);
        Self {
            inner: Arc::new(Inner {
                queues: QueueSets::new(),
                clock: Clock::new(),
                pool: Arc::new(pool),
                router,
                default_priority: config.default_priority,
                low_wait_ms: AtomicU64::new(config.max_wait_for_low_priority_ms),
                shutdown: AtomicU8::new(0),
                dispatcher: Mutex::new(DispatcherState::default()),
                dispatcher_exited: Condvar::new(),
                stats: SchedulerStats::default(),
            }),
        }
    }

    /// Get the scheduler clock.
    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Get the queues. Mostly useful for inspection in tests.
    #[inline]
    pub fn queues(&self) -> &QueueSets {
        &self.inner.queues
    }

    #[inline]
    pub fn failure_router(&self) -> &FailureRouter {
        &self.inner.router
    }

    /// Live worker threads, busy or idle.
    pub fn current_pool_size(&self) -> usize {
        self.inner.pool.current_size()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.inner.pool.idle_count()
    }

    pub fn max_pool_size(&self) -> usize {
        self.inner.pool.max_size()
    }

    /// Change the pool bound. Values below one are raised to one.
    pub fn set_max_pool_size(
        &self,
        max_size: usize,
    ) {
        self.inner.pool.set_max_size(max_size);
        self.inner.wake_dispatcher();
    }

    pub fn keep_alive(&self) -> Duration {
        self.inner.pool.keep_alive()
    }

    pub fn set_keep_alive(
        &self,
        keep_alive: Duration,
    ) {
        self.inner.pool.set_keep_alive(keep_alive);
    }

    /// How long due low-priority work waits for a free worker before the pool grows.
    pub fn max_wait_for_low_priority(&self) -> Duration {
        Duration::from_millis(self.inner.low_wait_ms())
    }

    pub fn set_max_wait_for_low_priority(
        &self,
        wait: Duration,
    ) {
        self.inner
            .low_wait_ms
            .store(duration_millis(wait), Ordering::SeqCst);
        self.inner.wake_dispatcher();
    }

    /// Queued tasks, of one priority or in total.
    pub fn queued_task_count(
        &self,
        priority: Option<TaskPriority>,
    ) -> usize {
        match priority {
            Some(priority) => self.inner.queues.queue_set(priority).len(),
            None => self.inner.queues.len(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        StatsSnapshot {
            submitted: stats.tasks_submitted.load(Ordering::SeqCst),
            executed: stats.tasks_executed.load(Ordering::SeqCst),
            failed: stats.tasks_failed.load(Ordering::SeqCst),
            cancelled: stats.tasks_cancelled.load(Ordering::SeqCst),
            pool_size: self.current_pool_size(),
            idle_workers: self.idle_worker_count(),
            queued: self.queued_task_count(None),
        }
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.inner.queues.check_invariants()
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub fn shutdown_mode(&self) -> Option<ShutdownMode> {
        self.inner.shutdown_mode()
    }

    /// Stop accepting work and cancel everything queued.
    pub fn shutdown(&self) -> Vec<TaskHandle> {
        self.shutdown_with(ShutdownMode::DiscardPending)
    }

    /// Stop accepting work. Returns the tasks cancelled by this call.
    ///
    /// A later `DiscardPending` call still discards what a `DrainPending`
    /// shutdown left queued.
    pub fn shutdown_with(
        &self,
        mode: ShutdownMode,
    ) -> Vec<TaskHandle> {
        let inner = &self.inner;
        let previous = inner.shutdown.fetch_max(mode.as_u8(), Ordering::SeqCst);
        let discarded = match mode {
            ShutdownMode::DiscardPending => inner.queues.cancel_all(),
            ShutdownMode::DrainPending => inner.queues.cancel_recurring(),
        };
        inner.stats.record_cancelled(discarded.len());
        if previous == 0 {
            tracing::info!("scheduler shutting down ({:?}), {} tasks discarded", mode, discarded.len());
        }

        let dispatcher = inner.dispatcher.lock();
        match dispatcher.unparker.as_ref() {
            Some(unparker) => unparker.unpark(),
            None => inner.pool.stop(),
        }
        discarded
    }

    /// Discard everything queued and interrupt running tasks.
    pub fn shutdown_now(&self) -> Vec<TaskHandle> {
        let discarded = self.shutdown_with(ShutdownMode::DiscardPending);
        self.inner.pool.interrupt_all();
        discarded
    }

    /// Wait for the dispatcher and every worker to exit after shutdown.
    /// Returns false on timeout.
    pub fn await_termination(
        &self,
        timeout: Duration,
    ) -> bool {
        self.inner.await_termination(Some(Instant::now() + timeout))
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown()
            && !self.inner.dispatcher.lock().running
            && self.inner.pool.is_stopping()
            && self.inner.pool.current_size() == 0
    }
}

impl Scheduler for PriorityScheduler {
    #[inline]
    fn default_priority(&self) -> TaskPriority {
        self.inner.default_priority
    }

    fn schedule(
        &self,
        action: TaskAction,
        delay: Duration,
        kind: TaskKind,
        options: TaskOptions,
    ) -> SchedulerResult<TaskHandle> {
        let inner = &self.inner;
        if inner.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }

        let priority = options.priority.unwrap_or(inner.default_priority);
        let task = build_task(
            &inner.queues,
            inner.clock.now(),
            action,
            delay,
            kind,
            priority,
            options.failure_handler,
        )?;
        inner.ensure_dispatcher()?;
        inner.queues.add(task.clone());

        // A shutdown that started after the check above may already have
        // drained the queues, and the dispatcher may be gone. Withdraw the
        // task unless it was dispatched in the meantime.
        if inner.is_shutdown() {
            let withdrawn = inner.queues.cancel(&task);
            if withdrawn || task.state() == TaskState::Cancelled {
                tracing::trace!("{} rejected by a concurrent shutdown", task.id());
                return Err(SchedulerError::Shutdown);
            }
        }
        inner.stats.record_submitted();
        tracing::trace!("submitted {} ({}) for {}", task.id(), priority, task.run_at());

        inner.wake_dispatcher();
        Ok(TaskHandle::new(task))
    }

    fn cancel(
        &self,
        handle: &TaskHandle,
    ) -> bool {
        let cancelled = self.inner.queues.cancel(handle.task());
        if cancelled {
            self.inner.stats.record_cancelled(1);
            tracing::trace!("cancelled {}", handle.id());
        }
        cancelled
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown();
        }
        if !self.inner.pool.factory().is_daemon() && !worker_pool::on_worker_thread() {
            self.inner.await_termination(None);
        }
    }
}

impl Inner {
    #[inline]
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) != 0
    }

    #[inline]
    fn shutdown_mode(&self) -> Option<ShutdownMode> {
        ShutdownMode::from_u8(self.shutdown.load(Ordering::SeqCst))
    }

    #[inline]
    fn low_wait_ms(&self) -> u64 {
        self.low_wait_ms.load(Ordering::SeqCst)
    }

    fn wake_dispatcher(&self) {
        if let Some(unparker) = self.dispatcher.lock().unparker.as_ref() {
            unparker.unpark();
        }
    }

    /// Start the dispatcher on first use.
    fn ensure_dispatcher(self: &Arc<Self>) -> SchedulerResult<()> {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.unparker.is_some() {
            return Ok(());
        }
        // Shutdown stopped the pool directly; nothing may restart it.
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }

        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let inner = self.clone();
        self.pool
            .factory()
            .spawn(Box::new(move || inner.dispatch(parker)))?;
        dispatcher.unparker = Some(unparker);
        dispatcher.running = true;
        Ok(())
    }

    fn dispatch(
        self: Arc<Self>,
        parker: Parker,
    ) {
        tracing::debug!("dispatcher started");
        loop {
            // Catches recurring tasks that were requeued while shutdown ran.
            let discarded = match self.shutdown_mode() {
                Some(ShutdownMode::DiscardPending) => self.queues.cancel_all(),
                Some(ShutdownMode::DrainPending) => self.queues.cancel_recurring(),
                None => Vec::new(),
            };
            self.stats.record_cancelled(discarded.len());
            if self.is_shutdown() && self.queues.is_empty() {
                break;
            }

            let now = self.clock.accurate_now();
            let low_wait = self.low_wait_ms();
            let Some(task) = self.queues.next_due(now, Some(low_wait)) else {
                Self::park_until(&parker, now, self.queues.next_run_at());
                continue;
            };

            match self.pool.acquire(task.priority(), task.run_at(), now, low_wait) {
                Acquire::Idle(worker) => self.hand_off(&worker, task),
                Acquire::Grow => {
                    let hooks = WorkerContext { inner: self.clone() };
                    match self.pool.start_worker(hooks) {
                        Ok(worker) => self.hand_off(&worker, task),
                        Err(err) => {
                            tracing::error!("failed to start worker thread: {}", err);
                            parker.park_timeout(SPAWN_RETRY);
                        },
                    }
                },
                Acquire::WaitUntil(deadline) => {
                    tracing::trace!("{} waits for a free worker until {}", task.id(), deadline);
                    let wake = self
                        .queues
                        .next_run_after(now)
                        .map_or(deadline, |next| next.min(deadline));
                    Self::park_until(&parker, now, Some(wake));
                },
                // Woken when a worker goes idle or the bound changes.
                Acquire::Wait => parker.park(),
            }
        }

        self.pool.stop();
        let mut dispatcher = self.dispatcher.lock();
        dispatcher.running = false;
        self.dispatcher_exited.notify_all();
        tracing::debug!("dispatcher exited");
    }

    fn park_until(
        parker: &Parker,
        now: u64,
        at: Option<u64>,
    ) {
        match at {
            Some(at) => parker.park_timeout(Duration::from_millis(at.saturating_sub(now).max(1))),
            None => parker.park(),
        }
    }

    /// Move `task` from its queue to a reserved worker.
    fn hand_off(
        &self,
        worker: &Arc<Worker>,
        task: Arc<Task>,
    ) {
        if !self.queues.remove(&task) || !self.queues.begin_execution(&task) {
            // Cancelled since it was picked.
            self.pool.release_unused(worker);
            return;
        }

        tracing::trace!(
            "dispatching {} ({}) to worker {}",
            task.id(),
            task.priority(),
            worker.id()
        );
        if let Err(task) = self.pool.hand(worker, task) {
            if task.transition(TaskState::Executing, TaskState::Pending) {
                self.queues.add(task);
            }
        }
    }

    fn await_termination(
        &self,
        deadline: Option<Instant>,
    ) -> bool {
        {
            let mut dispatcher = self.dispatcher.lock();
            while dispatcher.running {
                match deadline {
                    Some(deadline) => {
                        if self
                            .dispatcher_exited
                            .wait_until(&mut dispatcher, deadline)
                            .timed_out()
                            && dispatcher.running
                        {
                            return false;
                        }
                    },
                    None => self.dispatcher_exited.wait(&mut dispatcher),
                }
            }
        }

        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        self.pool.await_termination(remaining)
    }
}

/// What a pool worker calls back into.
struct WorkerContext {
    inner: Arc<Inner>,
}

impl WorkerHooks for WorkerContext {
    fn execute(
        &self,
        task: Arc<Task>,
    ) {
        let inner = &self.inner;
        tracing::trace!("running {}", task.id());

        if let Err(payload) = task.run() {
            inner.stats.record_failed();
            let failure = TaskFailure::from_panic(task.id(), payload.as_ref());
            let uncaught = inner.pool.factory().uncaught_handler();
            inner
                .router
                .route(&failure, task.failure_handler(), uncaught.as_ref());
        }
        inner.stats.record_executed();

        if task.is_recurring() && inner.is_shutdown() {
            if task.transition(TaskState::Executing, TaskState::Cancelled) {
                inner.stats.record_cancelled(1);
            }
            return;
        }
        if inner.queues.complete_execution(&task, inner.clock.accurate_now()) {
            inner.wake_dispatcher();
        }
    }

    fn became_idle(&self) {
        self.inner.wake_dispatcher();
    }
}
