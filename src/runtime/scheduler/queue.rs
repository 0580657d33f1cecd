//! Per-priority task queues
//!
//! Every priority level owns a [`QueueSet`]: an unordered ready-queue for
//! zero-delay one-time tasks and a future-queue, sorted by run-time, for
//! delayed and recurring tasks. A task records which queue holds it as a
//! [`QueueSlot`]; only the queue set writes that slot, while holding the lock
//! of the queue it is inserting into or removing from.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::InvariantViolation;
use super::task::{Task, TaskHandle, TaskId, TaskIdGenerator, TaskPriority, TaskState};

/// Which of the two queues of a set holds a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Zero-delay one-time tasks, FIFO.
    Ready,
    /// Delayed and recurring tasks, ordered by run-time.
    Future,
}

/// Back-reference from a task to the queue currently holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueSlot {
    pub priority: TaskPriority,
    pub kind: QueueKind,
}

impl QueueSlot {
    const EMPTY: u8 = u8::MAX;

    pub(super) fn encode(slot: Option<Self>) -> u8 {
        match slot {
            None => Self::EMPTY,
            Some(slot) => {
                let kind = match slot.kind {
                    QueueKind::Ready => 0,
                    QueueKind::Future => 1,
                };
                ((slot.priority.index() as u8) << 1) | kind
            },
        }
    }

    pub(super) fn decode(raw: u8) -> Option<Self> {
        if raw == Self::EMPTY {
            return None;
        }
        let priority = TaskPriority::from_index((raw >> 1) as usize)?;
        let kind = if raw & 1 == 0 {
            QueueKind::Ready
        } else {
            QueueKind::Future
        };
        Some(Self { priority, kind })
    }
}

/// Ready-queue and future-queue of one priority level.
#[derive(Debug)]
pub struct QueueSet {
    priority: TaskPriority,
    ready: Mutex<VecDeque<Arc<Task>>>,
    future: Mutex<VecDeque<Arc<Task>>>,
}

impl QueueSet {
    pub fn new(priority: TaskPriority) -> Self {
        Self {
            priority,
            ready: Mutex::new(VecDeque::new()),
            future: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    #[inline]
    fn slot(
        &self,
        kind: QueueKind,
    ) -> QueueSlot {
        QueueSlot {
            priority: self.priority,
            kind,
        }
    }

    /// Insert a task: immediate tasks append to the ready-queue, everything
    /// else goes into the future-queue after all tasks with the same run-time.
    pub(crate) fn add(
        &self,
        task: Arc<Task>,
    ) {
        debug_assert_eq!(
            task.priority(),
            self.priority,
            "{} routed to the {} queue set",
            task.id(),
            self.priority
        );
        debug_assert!(
            task.queue_slot().is_none(),
            "{} inserted while still queued",
            task.id()
        );

        if task.is_immediate() {
            let mut ready = self.ready.lock();
            task.set_queue_slot(Some(self.slot(QueueKind::Ready)));
            ready.push_back(task);
        } else {
            let mut future = self.future.lock();
            let run_at = task.run_at();
            let index = future.partition_point(|queued| queued.run_at() <= run_at);
            task.set_queue_slot(Some(self.slot(QueueKind::Future)));
            future.insert(index, task);
        }

        self.strict_check();
    }

    /// Remove a specific task. Returns false if this set does not hold it.
    pub(crate) fn remove(
        &self,
        task: &Arc<Task>,
    ) -> bool {
        let kind = match task.queue_slot() {
            Some(slot) if slot.priority == self.priority => slot.kind,
            _ => return false,
        };
        let queue = match kind {
            QueueKind::Ready => &self.ready,
            QueueKind::Future => &self.future,
        };

        let removed = {
            let mut queue = queue.lock();
            match queue.iter().position(|queued| Arc::ptr_eq(queued, task)) {
                Some(index) => {
                    queue.remove(index);
                    task.set_queue_slot(None);
                    true
                },
                None => false,
            }
        };

        if removed {
            self.strict_check();
        }
        removed
    }

    /// The task this set would run next at `now`: the earlier of the ready
    /// head and the due future head, the ready head winning ties.
    pub fn peek_due(
        &self,
        now: u64,
    ) -> Option<Arc<Task>> {
        let ready = self.ready.lock().front().cloned();
        let future = self
            .future
            .lock()
            .front()
            .filter(|task| task.run_at() <= now)
            .cloned();

        match (ready, future) {
            (Some(ready), Some(future)) => {
                if future.run_at() < ready.run_at() {
                    Some(future)
                } else {
                    Some(ready)
                }
            },
            (ready, future) => ready.or(future),
        }
    }

    /// Remove and return the next due task.
    pub(crate) fn pop_due(
        &self,
        now: u64,
    ) -> Option<Arc<Task>> {
        loop {
            let candidate = self.peek_due(now)?;
            if self.remove(&candidate) {
                return Some(candidate);
            }
        }
    }

    /// Earliest run-time of anything queued in this set.
    pub fn next_run_at(&self) -> Option<u64> {
        let ready = self.ready.lock().front().map(|task| task.run_at());
        let future = self.future.lock().front().map(|task| task.run_at());
        match (ready, future) {
            (Some(ready), Some(future)) => Some(ready.min(future)),
            (ready, future) => ready.or(future),
        }
    }

    /// Earliest run-time strictly after `now`, ignoring work already due.
    pub fn next_run_after(
        &self,
        now: u64,
    ) -> Option<u64> {
        let future = self.future.lock();
        let index = future.partition_point(|task| task.run_at() <= now);
        future.get(index).map(|task| task.run_at())
    }

    #[inline]
    pub fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    #[inline]
    pub fn future_len(&self) -> usize {
        self.future.lock().len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ready_len() + self.future_len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of the ready-queue contents, in FIFO order.
    pub fn ready_snapshot(&self) -> Vec<TaskHandle> {
        self.ready
            .lock()
            .iter()
            .cloned()
            .map(TaskHandle::new)
            .collect()
    }

    /// Handles of the future-queue contents, in run-time order.
    pub fn future_snapshot(&self) -> Vec<TaskHandle> {
        self.future
            .lock()
            .iter()
            .cloned()
            .map(TaskHandle::new)
            .collect()
    }

    /// Remove every task, clearing their slots.
    pub(crate) fn drain(&self) -> Vec<Arc<Task>> {
        let mut drained = Vec::new();
        for queue in [&self.ready, &self.future] {
            let mut queue = queue.lock();
            for task in queue.drain(..) {
                task.set_queue_slot(None);
                drained.push(task);
            }
        }
        drained
    }

    /// Remove only the recurring tasks.
    pub(crate) fn drain_recurring(&self) -> Vec<Arc<Task>> {
        let mut future = self.future.lock();
        let (recurring, rest): (VecDeque<_>, VecDeque<_>) =
            future.drain(..).partition(|task| task.is_recurring());
        *future = rest;
        recurring
            .into_iter()
            .inspect(|task| task.set_queue_slot(None))
            .collect()
    }

    /// Verify slot bookkeeping, queue typing and future-queue ordering.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let violation = |detail: String| InvariantViolation {
            priority: self.priority,
            detail,
        };

        let ready = self.ready.lock();
        let future = self.future.lock();
        let mut seen = HashSet::new();

        for (kind, queue) in [(QueueKind::Ready, &*ready), (QueueKind::Future, &*future)] {
            for task in queue {
                if !seen.insert(Arc::as_ptr(task)) {
                    return Err(violation(format!("{} queued twice", task.id())));
                }
                if task.priority() != self.priority {
                    return Err(violation(format!(
                        "{} has priority {}",
                        task.id(),
                        task.priority()
                    )));
                }
                if task.queue_slot() != Some(self.slot(kind)) {
                    return Err(violation(format!(
                        "{} in {:?} queue but slot is {:?}",
                        task.id(),
                        kind,
                        task.queue_slot()
                    )));
                }
                if task.is_immediate() != (kind == QueueKind::Ready) {
                    return Err(violation(format!(
                        "{} ({:?}) placed in the {:?} queue",
                        task.id(),
                        task.kind(),
                        kind
                    )));
                }
            }
        }

        if let Some(index) = (1..future.len()).find(|&i| future[i - 1].run_at() > future[i].run_at()) {
            return Err(violation(format!(
                "future queue out of order at position {}",
                index
            )));
        }

        Ok(())
    }

    #[inline]
    fn strict_check(&self) {
        #[cfg(feature = "strict")]
        {
            if let Err(violation) = self.check_invariants() {
                panic!("{}", violation);
            }
        }
    }
}

/// One [`QueueSet`] per priority level plus the task id sequence.
#[derive(Debug)]
pub struct QueueSets {
    sets: [QueueSet; 3],
    ids: TaskIdGenerator,
}

impl QueueSets {
    pub fn new() -> Self {
        Self {
            sets: TaskPriority::ALL.map(QueueSet::new),
            ids: TaskIdGenerator::new(),
        }
    }

    /// The set a task of `priority` lives in.
    #[inline]
    pub fn queue_set(
        &self,
        priority: TaskPriority,
    ) -> &QueueSet {
        &self.sets[priority.index()]
    }

    /// Sets in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueSet> {
        self.sets.iter()
    }

    #[inline]
    pub(crate) fn next_id(&self) -> TaskId {
        self.ids.generate()
    }

    #[inline]
    pub(crate) fn add(
        &self,
        task: Arc<Task>,
    ) {
        self.queue_set(task.priority()).add(task);
    }

    pub(crate) fn remove(
        &self,
        task: &Arc<Task>,
    ) -> bool {
        match task.queue_slot() {
            Some(slot) => self.queue_set(slot.priority).remove(task),
            None => false,
        }
    }

    /// Next task to dispatch at `now`.
    ///
    /// With `low_wait` set, a due low-priority task goes ahead of a due
    /// high-priority one once it has been waiting `low_wait` milliseconds
    /// longer. Starvable work is only offered when nothing else is due.
    pub fn next_due(
        &self,
        now: u64,
        low_wait: Option<u64>,
    ) -> Option<Arc<Task>> {
        let high = self.queue_set(TaskPriority::High).peek_due(now);
        let low = self.queue_set(TaskPriority::Low).peek_due(now);

        match (high, low) {
            (Some(high), Some(low)) => match low_wait {
                Some(wait) if low.run_at().saturating_add(wait) < high.run_at() => Some(low),
                _ => Some(high),
            },
            (Some(high), None) => Some(high),
            (None, Some(low)) => Some(low),
            (None, None) => self.queue_set(TaskPriority::Starvable).peek_due(now),
        }
    }

    /// Remove and return the next due task in strict priority order.
    pub(crate) fn pop_due(
        &self,
        now: u64,
    ) -> Option<Arc<Task>> {
        self.sets.iter().find_map(|set| set.pop_due(now))
    }

    /// Earliest run-time across all sets.
    pub fn next_run_at(&self) -> Option<u64> {
        self.sets.iter().filter_map(QueueSet::next_run_at).min()
    }

    /// Earliest run-time strictly after `now` across all sets.
    pub fn next_run_after(
        &self,
        now: u64,
    ) -> Option<u64> {
        self.sets
            .iter()
            .filter_map(|set| set.next_run_after(now))
            .min()
    }

    pub fn len(&self) -> usize {
        self.sets.iter().map(QueueSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(QueueSet::is_empty)
    }

    pub(crate) fn drain_all(&self) -> Vec<Arc<Task>> {
        self.sets.iter().flat_map(QueueSet::drain).collect()
    }

    pub(crate) fn drain_recurring(&self) -> Vec<Arc<Task>> {
        self.sets.iter().flat_map(QueueSet::drain_recurring).collect()
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.sets.iter().try_for_each(QueueSet::check_invariants)
    }

    /// Claim a dequeued task for execution. Fails if it was cancelled.
    #[inline]
    pub(crate) fn begin_execution(
        &self,
        task: &Task,
    ) -> bool {
        task.transition(TaskState::Pending, TaskState::Executing)
    }

    /// Settle a task after its action ran. One-time tasks become `Done`;
    /// recurring tasks get their next run-time and return to their own set.
    /// Returns true if the task is queued again.
    pub(crate) fn complete_execution(
        &self,
        task: &Arc<Task>,
        completed_at: u64,
    ) -> bool {
        if !task.is_recurring() {
            task.transition(TaskState::Executing, TaskState::Done);
            return false;
        }

        task.advance_run_at(completed_at);
        if !task.transition(TaskState::Executing, TaskState::Pending) {
            return false;
        }
        self.add(task.clone());
        // A cancel that raced the reinsertion may have missed the queue.
        if task.state() == TaskState::Cancelled {
            self.remove(task);
            return false;
        }
        true
    }

    /// Cancel a task. Pending tasks leave their queue; an executing recurring
    /// task only loses its next recurrence. Returns true if this call
    /// cancelled the task, false if it was already settled.
    pub(crate) fn cancel(
        &self,
        task: &Arc<Task>,
    ) -> bool {
        loop {
            match task.state() {
                TaskState::Pending => {
                    if task.transition(TaskState::Pending, TaskState::Cancelled) {
                        self.remove(task);
                        return true;
                    }
                },
                TaskState::Executing => {
                    if !task.is_recurring() {
                        return false;
                    }
                    if task.transition(TaskState::Executing, TaskState::Cancelled) {
                        return true;
                    }
                },
                TaskState::Done | TaskState::Cancelled => return false,
            }
        }
    }

    /// Drain every queue and mark the drained tasks cancelled.
    pub(crate) fn cancel_all(&self) -> Vec<TaskHandle> {
        Self::mark_cancelled(self.drain_all())
    }

    /// Drain only recurring tasks and mark them cancelled.
    pub(crate) fn cancel_recurring(&self) -> Vec<TaskHandle> {
        Self::mark_cancelled(self.drain_recurring())
    }

    fn mark_cancelled(tasks: Vec<Arc<Task>>) -> Vec<TaskHandle> {
        tasks
            .into_iter()
            .filter(|task| task.transition(TaskState::Pending, TaskState::Cancelled))
            .map(TaskHandle::new)
            .collect()
    }
}

impl Default for QueueSets {
    fn default() -> Self {
        Self::new()
    }
}
