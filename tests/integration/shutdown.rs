//! Shutdown and termination

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use priosched::runtime::scheduler::TaskState;
use priosched::{PriorityScheduler, RecurrenceMode, Scheduler, SchedulerConfig, TaskPriority};

use crate::common::{config, wait_until, TIMEOUT};

fn slow_task(
    scheduler: &PriorityScheduler,
    duration: Duration,
) -> Arc<AtomicBool> {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let handle = scheduler
        .submit(
            move || {
                thread::sleep(duration);
                flag.store(true, Ordering::SeqCst);
            },
            None,
        )
        .unwrap();
    assert!(wait_until(TIMEOUT, || handle.state() == TaskState::Executing));
    finished
}

#[test]
fn test_drop_waits_for_non_daemon_workers() {
    let config = SchedulerConfig {
        daemon_threads: false,
        ..config(1, 100)
    };
    let scheduler = PriorityScheduler::new(&config);
    let finished = slow_task(&scheduler, Duration::from_millis(100));

    drop(scheduler);
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_drop_does_not_wait_for_daemon_workers() {
    let scheduler = PriorityScheduler::new(&config(1, 100));
    let finished = slow_task(&scheduler, Duration::from_millis(500));

    let dropping = Instant::now();
    drop(scheduler);
    assert!(dropping.elapsed() < Duration::from_millis(400));
    assert!(!finished.load(Ordering::SeqCst));
    assert!(wait_until(TIMEOUT, || finished.load(Ordering::SeqCst)));
}

#[test]
fn test_await_termination_times_out_while_busy() {
    let scheduler = PriorityScheduler::new(&config(1, 100));
    slow_task(&scheduler, Duration::from_millis(150));

    scheduler.shutdown();
    assert!(!scheduler.await_termination(Duration::from_millis(20)));
    assert!(!scheduler.is_terminated());
    assert!(scheduler.await_termination(TIMEOUT));
    assert!(scheduler.is_terminated());
    assert_eq!(scheduler.current_pool_size(), 0);
}

#[test]
fn test_shutdown_cancels_every_priority() {
    let scheduler = PriorityScheduler::new(&config(2, 100));
    let far = Duration::from_secs(60);
    let handles = vec![
        scheduler.submit_after(|| {}, far, Some(TaskPriority::High)).unwrap(),
        scheduler.submit_after(|| {}, far, Some(TaskPriority::Low)).unwrap(),
        scheduler
            .submit_recurring(|| {}, far, far, RecurrenceMode::FixedDelay, Some(TaskPriority::Starvable))
            .unwrap(),
    ];

    let discarded = scheduler.shutdown();
    assert_eq!(discarded.len(), 3);
    assert!(handles.iter().all(|h| h.is_cancelled()));
    assert_eq!(scheduler.queued_task_count(None), 0);
    assert_eq!(scheduler.stats().cancelled, 3);
    assert!(scheduler.await_termination(TIMEOUT));
}

#[test]
fn test_shutdown_is_idempotent() {
    let scheduler = PriorityScheduler::new(&config(1, 100));
    assert!(scheduler.shutdown().is_empty());
    assert!(scheduler.shutdown().is_empty());
    assert!(scheduler.await_termination(TIMEOUT));
}
