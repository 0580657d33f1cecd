//! Worker pool growth under the priority policy

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use priosched::runtime::scheduler::TaskState;
use priosched::{PriorityScheduler, Scheduler, TaskHandle, TaskPriority};

use crate::common::{config, wait_until, TIMEOUT};

/// Occupy one worker until `release` is set.
fn block_worker(
    scheduler: &PriorityScheduler,
    release: &Arc<AtomicBool>,
) -> TaskHandle {
    let release = release.clone();
    let handle = scheduler
        .submit(
            move || {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
            Some(TaskPriority::High),
        )
        .unwrap();
    assert!(wait_until(TIMEOUT, || handle.state() == TaskState::Executing));
    handle
}

/// Submit a task that records when it started.
fn timed(
    scheduler: &PriorityScheduler,
    priority: TaskPriority,
) -> (TaskHandle, Arc<Mutex<Option<Instant>>>) {
    let started = Arc::new(Mutex::new(None));
    let mark = started.clone();
    let handle = scheduler
        .submit(
            move || {
                *mark.lock() = Some(Instant::now());
            },
            Some(priority),
        )
        .unwrap();
    (handle, started)
}

#[test]
fn test_low_priority_waits_before_pool_grows() {
    let scheduler = PriorityScheduler::new(&config(2, 100));
    let release = Arc::new(AtomicBool::new(false));
    let blocker = block_worker(&scheduler, &release);
    assert_eq!(scheduler.current_pool_size(), 1);

    let submitted = Instant::now();
    let (low, started) = timed(&scheduler, TaskPriority::Low);

    thread::sleep(Duration::from_millis(40));
    assert_eq!(low.state(), TaskState::Pending);
    assert_eq!(scheduler.current_pool_size(), 1);

    assert!(wait_until(TIMEOUT, || low.is_done()));
    let waited = started.lock().unwrap().duration_since(submitted);
    assert!(waited >= Duration::from_millis(90), "started after {:?}", waited);
    assert_eq!(scheduler.current_pool_size(), 2);
    assert_eq!(blocker.state(), TaskState::Executing);

    release.store(true, Ordering::SeqCst);
}

#[test]
fn test_low_priority_takes_idle_worker_at_once() {
    let scheduler = PriorityScheduler::new(&config(2, 2_000));
    let warmup = scheduler.submit(|| {}, Some(TaskPriority::High)).unwrap();
    assert!(wait_until(TIMEOUT, || warmup.is_done()));
    assert!(wait_until(TIMEOUT, || scheduler.idle_worker_count() == 1));

    let submitted = Instant::now();
    let (low, started) = timed(&scheduler, TaskPriority::Low);
    assert!(wait_until(TIMEOUT, || low.is_done()));

    let waited = started.lock().unwrap().duration_since(submitted);
    assert!(waited < Duration::from_millis(1_000), "started after {:?}", waited);
    assert_eq!(scheduler.current_pool_size(), 1);
}

#[test]
fn test_high_priority_grows_pool_at_once() {
    let scheduler = PriorityScheduler::new(&config(2, 2_000));
    let release = Arc::new(AtomicBool::new(false));
    block_worker(&scheduler, &release);

    let submitted = Instant::now();
    let (high, started) = timed(&scheduler, TaskPriority::High);
    assert!(wait_until(TIMEOUT, || high.is_done()));

    let waited = started.lock().unwrap().duration_since(submitted);
    assert!(waited < Duration::from_millis(1_000), "started after {:?}", waited);
    assert_eq!(scheduler.current_pool_size(), 2);

    release.store(true, Ordering::SeqCst);
}

#[test]
fn test_full_pool_queues_low_priority_work() {
    let scheduler = PriorityScheduler::new(&config(1, 10));
    let release = Arc::new(AtomicBool::new(false));
    block_worker(&scheduler, &release);

    let (low, _) = timed(&scheduler, TaskPriority::Low);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(low.state(), TaskState::Pending);
    assert_eq!(scheduler.queued_task_count(Some(TaskPriority::Low)), 1);

    release.store(true, Ordering::SeqCst);
    assert!(wait_until(TIMEOUT, || low.is_done()));
    assert!(scheduler.check_invariants().is_ok());
}
