//! Concurrent submitters and cancellers against one pool

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use priosched::runtime::scheduler::{RecurrenceMode, TaskKind, TaskState};
use priosched::{PriorityScheduler, Scheduler, TaskHandle, TaskPriority};

use crate::common::{config, wait_until, TIMEOUT};

const SUBMITTERS: usize = 4;
const CANCELLERS: usize = 2;
const PER_SUBMITTER: usize = 150;

fn submit_mixed(
    scheduler: &PriorityScheduler,
    seq: usize,
) -> TaskHandle {
    let priority = TaskPriority::ALL[seq % 3];
    let result = match seq % 4 {
        0 => scheduler.submit(|| {}, Some(priority)),
        1 => scheduler.submit_after(|| {}, Duration::from_millis((seq % 20) as u64 + 1), Some(priority)),
        2 => scheduler.submit_recurring(
            || {},
            Duration::ZERO,
            Duration::from_millis(3),
            RecurrenceMode::FixedRate,
            Some(priority),
        ),
        _ => scheduler.submit_recurring(
            || thread::sleep(Duration::from_micros(200)),
            Duration::from_millis(2),
            Duration::from_millis(4),
            RecurrenceMode::FixedDelay,
            Some(priority),
        ),
    };
    result.unwrap()
}

#[test]
fn test_concurrent_submit_and_cancel_settle_cleanly() {
    let scheduler = Arc::new(PriorityScheduler::new(&config(3, 20)));
    let handles = Arc::new(Mutex::new(Vec::new()));
    let start = Arc::new(Barrier::new(SUBMITTERS + CANCELLERS));

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|t| {
            let (scheduler, handles, start) = (scheduler.clone(), handles.clone(), start.clone());
            thread::spawn(move || {
                start.wait();
                for i in 0..PER_SUBMITTER {
                    let handle = submit_mixed(&scheduler, t * PER_SUBMITTER + i);
                    handles.lock().push(handle);
                }
            })
        })
        .collect();

    let cancellers: Vec<_> = (0..CANCELLERS)
        .map(|t| {
            let (scheduler, handles, start) = (scheduler.clone(), handles.clone(), start.clone());
            thread::spawn(move || {
                start.wait();
                for round in 0..300 {
                    let picked = {
                        let handles = handles.lock();
                        handles.get((round * 11 + t * 5) % handles.len().max(1)).cloned()
                    };
                    if let Some(handle) = picked {
                        scheduler.cancel(&handle);
                    }
                    if round % 50 == 0 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for worker in submitters.into_iter().chain(cancellers) {
        worker.join().unwrap();
    }
    assert!(scheduler.check_invariants().is_ok());

    let handles = handles.lock().clone();
    assert_eq!(handles.len(), SUBMITTERS * PER_SUBMITTER);
    assert!(wait_until(TIMEOUT, || {
        handles
            .iter()
            .filter(|h| h.kind() == TaskKind::OneTime)
            .all(|h| matches!(h.state(), TaskState::Done | TaskState::Cancelled))
    }));
    assert!(scheduler.check_invariants().is_ok());

    for handle in handles.iter().filter(|h| h.kind() != TaskKind::OneTime) {
        let state = handle.state();
        assert!(
            matches!(state, TaskState::Pending | TaskState::Executing | TaskState::Cancelled),
            "{} is recurring but {:?}",
            handle.id(),
            state
        );
        scheduler.cancel(handle);
    }

    assert!(wait_until(TIMEOUT, || scheduler.queued_task_count(None) == 0));
    assert!(wait_until(TIMEOUT, || {
        handles
            .iter()
            .all(|h| matches!(h.state(), TaskState::Done | TaskState::Cancelled))
    }));
    assert!(scheduler.check_invariants().is_ok());
}
