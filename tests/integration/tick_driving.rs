//! Driving a TickScheduler from an external loop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use priosched::{Scheduler, SchedulerError, TaskPriority, TickScheduler};

use crate::common::{wait_until, TIMEOUT};

#[test]
fn test_tick_runs_in_strict_priority_order() {
    let scheduler = TickScheduler::new(false);
    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let _hold = scheduler.hold_clock();
        for priority in [TaskPriority::Starvable, TaskPriority::Low, TaskPriority::High] {
            let order = order.clone();
            scheduler
                .submit(move || order.lock().push(priority), Some(priority))
                .unwrap();
        }
    }

    assert_eq!(scheduler.tick().unwrap(), 3);
    assert_eq!(
        *order.lock(),
        vec![TaskPriority::High, TaskPriority::Low, TaskPriority::Starvable]
    );
}

#[test]
fn test_blocking_loop_serves_other_threads() {
    let scheduler = Arc::new(TickScheduler::new(true));
    let runs = Arc::new(AtomicUsize::new(0));

    let driver = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            let mut ticks = 0;
            loop {
                match scheduler.tick() {
                    Ok(_) => ticks += 1,
                    Err(SchedulerError::Interrupted) => return ticks,
                    Err(err) => panic!("unexpected tick error: {}", err),
                }
            }
        })
    };

    for _ in 0..10 {
        let runs = runs.clone();
        scheduler
            .submit(
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .unwrap();
    }

    assert!(wait_until(TIMEOUT, || runs.load(Ordering::SeqCst) == 10));
    scheduler.interrupt();
    let ticks = driver.join().unwrap();
    assert!((1..=10).contains(&ticks));
    assert_eq!(scheduler.queued_task_count(), 0);
}
