//! Task definitions for the scheduler.
//!
//! A task is a unit of work with a priority, a target run-time and a lifecycle
//! state. Tasks come in two closed variants: one-time and recurring. Queue
//! membership is tracked on the task as a [`QueueSlot`], which only the owning
//! [`QueueSet`](super::queue::QueueSet) writes.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::clock::duration_millis;
use super::failure::FailureHandler;
use super::queue::QueueSlot;

/// The work a task performs.
pub type TaskAction = Box<dyn FnMut() + Send + 'static>;

/// Payload of a panicking task action.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl From<usize> for TaskId {
    fn from(val: usize) -> Self {
        Self(val)
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task priority levels, most urgent first.
///
/// `High` work grabs a worker immediately, `Low` work waits a bounded time for
/// a worker to free up before the pool grows, and `Starvable` work only runs
/// when nothing more urgent is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Latency sensitive work.
    #[default]
    High = 0,
    /// Work that tolerates a delay before the pool grows for it.
    Low = 1,
    /// Work that only runs on otherwise idle workers.
    Starvable = 2,
}

impl TaskPriority {
    /// All priorities in dispatch order.
    pub const ALL: [TaskPriority; 3] = [TaskPriority::High, TaskPriority::Low, TaskPriority::Starvable];

    /// Position in dispatch order (0 is the most urgent).
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`TaskPriority::index`].
    #[inline]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Lowercase name, as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::High => "high",
            TaskPriority::Low => "low",
            TaskPriority::Starvable => "starvable",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(TaskPriority::High),
            "low" => Ok(TaskPriority::Low),
            "starvable" => Ok(TaskPriority::Starvable),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued and waiting for its run-time.
    Pending,
    /// Currently running on a worker or inside a tick.
    Executing,
    /// A one-time task that has run.
    Done,
    /// Removed before it could run (again).
    Cancelled,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Pending,
            1 => TaskState::Executing,
            2 => TaskState::Done,
            _ => TaskState::Cancelled,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Executing => 1,
            TaskState::Done => 2,
            TaskState::Cancelled => 3,
        }
    }
}

/// How a recurring task computes its next run-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecurrenceMode {
    /// Next run-time is the completion time plus the period.
    FixedDelay,
    /// Next run-time is the previous scheduled time plus the period.
    FixedRate,
}

/// The closed set of task variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Runs exactly once.
    OneTime,
    /// Runs every `period` until cancelled.
    Recurring {
        /// Time between runs.
        period: Duration,
        /// Whether the period counts from completion or from the schedule.
        mode: RecurrenceMode,
    },
}

/// Per-submission settings.
///
/// Converts from a bare `Option<TaskPriority>`, so `None.into()` means the
/// scheduler's default priority and no task failure handler.
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Queue to use; the scheduler's default priority when unset.
    pub priority: Option<TaskPriority>,
    /// First handler consulted when the action panics on a pool worker.
    /// A [`TickScheduler`](super::tick::TickScheduler) returns failures to
    /// its caller instead.
    pub failure_handler: Option<Arc<dyn FailureHandler>>,
}

impl TaskOptions {
    pub fn with_priority(
        mut self,
        priority: TaskPriority,
    ) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_failure_handler(
        mut self,
        handler: Arc<dyn FailureHandler>,
    ) -> Self {
        self.failure_handler = Some(handler);
        self
    }
}

impl From<Option<TaskPriority>> for TaskOptions {
    fn from(priority: Option<TaskPriority>) -> Self {
        Self {
            priority,
            failure_handler: None,
        }
    }
}

impl From<TaskPriority> for TaskOptions {
    fn from(priority: TaskPriority) -> Self {
        Some(priority).into()
    }
}

impl fmt::Debug for TaskOptions {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("priority", &self.priority)
            .field("failure_handler", &self.failure_handler.is_some())
            .finish()
    }
}

/// A schedulable unit of work.
pub struct Task {
    id: TaskId,
    priority: TaskPriority,
    kind: TaskKind,
    /// Zero-delay one-time task, lives in a ready-queue.
    immediate: bool,
    /// Target run-time in clock milliseconds. Only changed while unqueued.
    run_at: AtomicU64,
    state: AtomicU8,
    /// Encoded [`QueueSlot`], written by the owning queue set only.
    slot: AtomicU8,
    run_count: AtomicUsize,
    action: Mutex<TaskAction>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("run_at", &self.run_at())
            .field("state", &self.state())
            .field("slot", &self.queue_slot())
            .field("failure_handler", &self.failure_handler.is_some())
            .finish()
    }
}

impl Task {
    /// Create a task that first runs `delay` after `now`.
    pub fn new(
        id: TaskId,
        priority: TaskPriority,
        kind: TaskKind,
        delay: Duration,
        now: u64,
        action: TaskAction,
    ) -> Self {
        Self {
            id,
            priority,
            kind,
            immediate: kind == TaskKind::OneTime && delay.is_zero(),
            run_at: AtomicU64::new(now.saturating_add(duration_millis(delay))),
            state: AtomicU8::new(TaskState::Pending.as_u8()),
            slot: AtomicU8::new(QueueSlot::encode(None)),
            run_count: AtomicUsize::new(0),
            action: Mutex::new(action),
            failure_handler: None,
        }
    }

    /// Attach the handler that gets this task's failures ahead of the
    /// scheduler's own handlers.
    pub fn with_failure_handler(
        mut self,
        handler: Option<Arc<dyn FailureHandler>>,
    ) -> Self {
        self.failure_handler = handler;
        self
    }

    #[inline]
    pub fn failure_handler(&self) -> Option<&Arc<dyn FailureHandler>> {
        self.failure_handler.as_ref()
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the priority.
    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Get the task variant.
    #[inline]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    #[inline]
    pub fn is_recurring(&self) -> bool {
        matches!(self.kind, TaskKind::Recurring { .. })
    }

    /// Whether this is a zero-delay one-time task.
    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// Target run-time in clock milliseconds.
    #[inline]
    pub fn run_at(&self) -> u64 {
        self.run_at.load(Ordering::SeqCst)
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// How many times the action has been invoked.
    #[inline]
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    /// The queue currently holding this task, if any.
    #[inline]
    pub fn queue_slot(&self) -> Option<QueueSlot> {
        QueueSlot::decode(self.slot.load(Ordering::SeqCst))
    }

    /// Only called by a queue set while it holds the queue lock.
    #[inline]
    pub(super) fn set_queue_slot(
        &self,
        slot: Option<QueueSlot>,
    ) {
        self.slot.store(QueueSlot::encode(slot), Ordering::SeqCst);
    }

    /// Atomically move from `from` to `to`. Returns false if the task was not in `from`.
    #[inline]
    pub(crate) fn transition(
        &self,
        from: TaskState,
        to: TaskState,
    ) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Run the action once, capturing a panic instead of unwinding.
    pub(crate) fn run(&self) -> Result<(), PanicPayload> {
        self.run_count.fetch_add(1, Ordering::SeqCst);
        let mut action = self.action.lock();
        catch_unwind(AssertUnwindSafe(|| (*action)()))
    }

    /// Recompute the next run-time of a recurring task that finished at
    /// `completed_at`. This is the only mutation allowed on a dispatched task.
    pub(crate) fn advance_run_at(
        &self,
        completed_at: u64,
    ) -> u64 {
        let next = match self.kind {
            TaskKind::OneTime => {
                debug_assert!(false, "one-time task {} rescheduled", self.id);
                self.run_at()
            },
            TaskKind::Recurring {
                period,
                mode: RecurrenceMode::FixedDelay,
            } => completed_at.saturating_add(duration_millis(period)),
            TaskKind::Recurring {
                period,
                mode: RecurrenceMode::FixedRate,
            } => self.run_at().saturating_add(duration_millis(period)),
        };
        self.run_at.store(next, Ordering::SeqCst);
        next
    }
}

/// Caller-side reference to a submitted task, used to observe or cancel it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
}

impl TaskHandle {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task }
    }

    pub(crate) fn task(&self) -> &Arc<Task> {
        &self.task
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.task.priority()
    }

    #[inline]
    pub fn kind(&self) -> TaskKind {
        self.task.kind()
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Scheduled run-time (next run-time for recurring tasks).
    #[inline]
    pub fn run_at(&self) -> u64 {
        self.task.run_at()
    }

    #[inline]
    pub fn run_count(&self) -> usize {
        self.task.run_count()
    }

    #[inline]
    pub fn queue_slot(&self) -> Option<QueueSlot> {
        self.task.queue_slot()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }
}

impl PartialEq for TaskHandle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.task, &other.task)
    }
}

impl Eq for TaskHandle {}

/// Generator for task IDs, shared by all submitters of one scheduler.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    next_id: AtomicUsize,
}

impl TaskIdGenerator {
    /// Create a new task ID generator.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next task ID.
    #[inline]
    pub fn generate(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}
