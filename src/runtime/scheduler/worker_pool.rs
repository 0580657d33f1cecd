//! Elastic pool of worker threads
//!
//! Workers are created on demand through a [`ThreadFactory`], bounded by a
//! maximum size, and retire after sitting idle for the keep-alive window.
//! Idle workers sit on a LIFO stack so the most recently used thread is
//! reused first and the others age out.
//!
//! The pool does not pick tasks. The dispatcher asks [`WorkerPool::acquire`]
//! for a worker, which applies the growth policy of the task's priority, and
//! then hands the task over with [`WorkerPool::hand`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::sync::{Parker, Unparker};
use parking_lot::{Condvar, Mutex};

use super::clock::duration_millis;
use super::task::{Task, TaskPriority};
use super::thread_factory::ThreadFactory;

thread_local! {
    static CURRENT_INTERRUPT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// Whether the worker running the current task has been asked to stop.
///
/// Long running actions should poll this and return early. Always false
/// outside of pool worker threads.
pub fn is_interrupted() -> bool {
    CURRENT_INTERRUPT.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    })
}

/// Whether the current thread is a pool worker.
pub(crate) fn on_worker_thread() -> bool {
    CURRENT_INTERRUPT.with(|slot| slot.borrow().is_some())
}

/// Callbacks a worker thread makes into its scheduler.
pub(crate) trait WorkerHooks: Send + 'static {
    /// Run one task to completion, including failure handling.
    fn execute(
        &self,
        task: Arc<Task>,
    );

    /// The worker is back on the idle stack.
    fn became_idle(&self);
}

/// A single pool thread as seen from the outside.
#[derive(Debug)]
pub(crate) struct Worker {
    id: usize,
    next_task: Mutex<Option<Arc<Task>>>,
    unparker: Unparker,
    interrupted: Arc<AtomicBool>,
    dismissed: AtomicBool,
}

impl Worker {
    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    fn take_task(&self) -> Option<Arc<Task>> {
        self.next_task.lock().take()
    }

    fn has_task(&self) -> bool {
        self.next_task.lock().is_some()
    }

    fn dismiss(&self) {
        self.dismissed.store(true, Ordering::SeqCst);
        self.unparker.unpark();
    }
}

/// Outcome of asking the pool for a worker.
#[derive(Debug)]
pub(crate) enum Acquire {
    /// An idle worker, now reserved for the caller.
    Idle(Arc<Worker>),
    /// A slot was reserved; the caller must call [`WorkerPool::start_worker`].
    Grow,
    /// Low-priority work: ask again at this clock time.
    WaitUntil(u64),
    /// No worker until one frees up.
    Wait,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Live workers plus reserved slots.
    size: usize,
    idle: Vec<Arc<Worker>>,
    workers: HashMap<usize, Arc<Worker>>,
    next_id: usize,
    stopping: bool,
}

impl PoolState {
    fn remove_worker(
        &mut self,
        worker: &Worker,
    ) {
        if self.workers.remove(&worker.id).is_some() {
            self.size -= 1;
        }
        self.idle.retain(|idle| idle.id != worker.id);
    }
}

/// Bounded set of reusable worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    state: Mutex<PoolState>,
    terminated: Condvar,
    max_size: AtomicUsize,
    keep_alive_ms: AtomicU64,
    factory: Arc<dyn ThreadFactory>,
}

impl WorkerPool {
    pub fn new(
        max_size: usize,
        keep_alive: Duration,
        factory: Arc<dyn ThreadFactory>,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            terminated: Condvar::new(),
            max_size: AtomicUsize::new(max_size.max(1)),
            keep_alive_ms: AtomicU64::new(duration_millis(keep_alive)),
            factory,
        }
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::SeqCst)
    }

    /// Change the bound. Idle workers above the new bound retire right away,
    /// busy ones when they finish their task.
    pub fn set_max_size(
        &self,
        max_size: usize,
    ) {
        let max_size = max_size.max(1);
        self.max_size.store(max_size, Ordering::SeqCst);

        let state = self.state.lock();
        let excess = state.size.saturating_sub(max_size);
        for worker in state.idle.iter().rev().take(excess) {
            worker.dismiss();
        }
    }

    #[inline]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms.load(Ordering::SeqCst))
    }

    pub fn set_keep_alive(
        &self,
        keep_alive: Duration,
    ) {
        self.keep_alive_ms
            .store(duration_millis(keep_alive), Ordering::SeqCst);
    }

    /// Live workers, busy or idle.
    pub fn current_size(&self) -> usize {
        self.state.lock().size
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    #[inline]
    pub(crate) fn factory(&self) -> &Arc<dyn ThreadFactory> {
        &self.factory
    }

    /// Find a worker for a task of `priority` that has been due since `due_since`.
    ///
    /// High work takes an idle worker or grows the pool at once. Low work
    /// takes an idle worker, and only grows the pool once it has waited
    /// `low_wait` milliseconds. Starvable work never grows a non-empty pool.
    pub(crate) fn acquire(
        &self,
        priority: TaskPriority,
        due_since: u64,
        now: u64,
        low_wait: u64,
    ) -> Acquire {
        let mut state = self.state.lock();
        if state.stopping {
            return Acquire::Wait;
        }
        if let Some(worker) = state.idle.pop() {
            return Acquire::Idle(worker);
        }

        let can_grow = state.size < self.max_size();
        let grow = match priority {
            TaskPriority::High => can_grow,
            TaskPriority::Low => {
                let deadline = due_since.saturating_add(low_wait);
                if can_grow && now < deadline {
                    return Acquire::WaitUntil(deadline);
                }
                can_grow
            },
            TaskPriority::Starvable => can_grow && state.size == 0,
        };

        if grow {
            state.size += 1;
            Acquire::Grow
        } else {
            Acquire::Wait
        }
    }

    /// Start a worker in a slot reserved by [`Acquire::Grow`]. The new
    /// worker is reserved for the caller, as if taken from the idle stack.
    pub(crate) fn start_worker<H>(
        self: &Arc<Self>,
        hooks: H,
    ) -> io::Result<Arc<Worker>>
    where
        H: WorkerHooks,
    {
        let parker = Parker::new();
        let worker = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let worker = Arc::new(Worker {
                id,
                next_task: Mutex::new(None),
                unparker: parker.unparker().clone(),
                interrupted: Arc::new(AtomicBool::new(false)),
                dismissed: AtomicBool::new(false),
            });
            state.workers.insert(id, worker.clone());
            worker
        };

        let pool = self.clone();
        let thread_worker = worker.clone();
        let spawned = self
            .factory
            .spawn(Box::new(move || pool.run_worker(thread_worker, parker, hooks)));

        match spawned {
            Ok(_detached) => {
                tracing::debug!("started worker {}", worker.id);
                Ok(worker)
            },
            Err(err) => {
                let mut state = self.state.lock();
                state.remove_worker(&worker);
                self.terminated.notify_all();
                Err(err)
            },
        }
    }

    /// Give a reserved worker its next task. Hands the task back if the
    /// worker has already exited.
    pub(crate) fn hand(
        &self,
        worker: &Arc<Worker>,
        task: Arc<Task>,
    ) -> Result<(), Arc<Task>> {
        let state = self.state.lock();
        if !state.workers.contains_key(&worker.id) {
            return Err(task);
        }
        *worker.next_task.lock() = Some(task);
        worker.unparker.unpark();
        Ok(())
    }

    /// Return a reserved worker that did not get a task.
    pub(crate) fn release_unused(
        &self,
        worker: &Arc<Worker>,
    ) {
        let mut state = self.state.lock();
        if state.workers.contains_key(&worker.id) && !state.stopping {
            state.idle.push(worker.clone());
        }
        worker.unparker.unpark();
    }

    /// Flag every worker as interrupted, see [`is_interrupted`].
    pub(crate) fn interrupt_all(&self) {
        let state = self.state.lock();
        for worker in state.workers.values() {
            worker.interrupted.store(true, Ordering::SeqCst);
            worker.unparker.unpark();
        }
    }

    /// Stop accepting work: idle workers exit now, busy ones after their task.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        for worker in state.idle.drain(..) {
            worker.dismiss();
        }
        self.terminated.notify_all();
    }

    /// Wait until every worker has exited after [`WorkerPool::stop`].
    /// Returns false on timeout.
    pub fn await_termination(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        while !(state.stopping && state.size == 0) {
            match deadline {
                Some(deadline) => {
                    if self.terminated.wait_until(&mut state, deadline).timed_out() {
                        return state.stopping && state.size == 0;
                    }
                },
                None => self.terminated.wait(&mut state),
            }
        }
        true
    }

    /// Put a worker that finished its task back on the idle stack. Returns
    /// false when the worker should exit instead.
    fn release(
        &self,
        worker: &Arc<Worker>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.stopping || worker.dismissed.load(Ordering::SeqCst) || state.size > self.max_size() {
            state.remove_worker(worker);
            self.terminated.notify_all();
            return false;
        }
        state.idle.push(worker.clone());
        true
    }

    /// Remove an idle worker from the pool. Fails if the worker has been
    /// reserved by the dispatcher in the meantime.
    fn retire(
        &self,
        worker: &Arc<Worker>,
    ) -> bool {
        let mut state = self.state.lock();
        let idle = state.idle.iter().any(|idle| idle.id == worker.id);
        let leaving = state.stopping || worker.dismissed.load(Ordering::SeqCst);
        if !idle && !(leaving && !worker.has_task()) {
            return false;
        }
        state.remove_worker(worker);
        self.terminated.notify_all();
        true
    }

    fn run_worker<H>(
        self: Arc<Self>,
        worker: Arc<Worker>,
        parker: Parker,
        hooks: H,
    ) where
        H: WorkerHooks,
    {
        CURRENT_INTERRUPT.with(|slot| *slot.borrow_mut() = Some(worker.interrupted.clone()));

        let mut idle_since = Instant::now();
        loop {
            if let Some(task) = worker.take_task() {
                hooks.execute(task);
                worker.interrupted.store(false, Ordering::SeqCst);
                if !self.release(&worker) {
                    break;
                }
                hooks.became_idle();
                idle_since = Instant::now();
                continue;
            }

            let keep_alive = self.keep_alive();
            let idle_for = idle_since.elapsed();
            let leaving = worker.dismissed.load(Ordering::SeqCst) || self.is_stopping();
            if leaving || idle_for >= keep_alive {
                if self.retire(&worker) {
                    break;
                }
                // Reserved while timing out; the task is on its way.
                parker.park();
            } else {
                parker.park_timeout(keep_alive - idle_for);
            }
        }

        CURRENT_INTERRUPT.with(|slot| *slot.borrow_mut() = None);
        tracing::debug!("worker {} retired", worker.id);
    }
}
