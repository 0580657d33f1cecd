//! Failure routing from pool workers

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use priosched::runtime::scheduler::{FailureHandler, FailureRouter, TaskFailure, TaskOptions};
use priosched::{PriorityScheduler, Scheduler};

use crate::common::{config, wait_until, TIMEOUT};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(
        &mut self,
        buf: &[u8],
    ) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn collector() -> (Arc<Mutex<Vec<TaskFailure>>>, Arc<dyn FailureHandler>) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let seen = failures.clone();
    let handler: Arc<dyn FailureHandler> = Arc::new(move |failure: &TaskFailure| {
        seen.lock().push(failure.clone());
    });
    (failures, handler)
}

fn fail_once(scheduler: &PriorityScheduler) {
    let handle = scheduler.submit(|| panic!("task failed"), None).unwrap();
    assert!(wait_until(TIMEOUT, || handle.is_done()));
    assert!(wait_until(TIMEOUT, || scheduler.stats().failed == 1));
}

#[test]
fn test_factory_uncaught_handler_is_last_resort() {
    let (failures, handler) = collector();
    let config = config(1, 100);
    let factory = config.thread_factory().with_uncaught_handler(handler);
    let scheduler = PriorityScheduler::with_parts(&config, Arc::new(factory), FailureRouter::new());

    fail_once(&scheduler);
    assert!(wait_until(TIMEOUT, || failures.lock().len() == 1));
    let failures = failures.lock();
    assert_eq!(failures[0].message(), "task failed");
}

#[test]
fn test_inheritable_handler_beats_uncaught() {
    let (inherited, inheritable) = collector();
    let (uncaught_seen, uncaught) = collector();
    let config = config(1, 100);
    let factory = config.thread_factory().with_uncaught_handler(uncaught);
    let router = FailureRouter::new().with_inheritable(inheritable);
    let scheduler = PriorityScheduler::with_parts(&config, Arc::new(factory), router);

    fail_once(&scheduler);
    assert!(wait_until(TIMEOUT, || inherited.lock().len() == 1));
    assert!(uncaught_seen.lock().is_empty());
}

#[test]
fn test_unhandled_failure_is_written_to_sink() {
    let sink = Capture::default();
    let config = config(1, 100);
    let router = FailureRouter::new().with_sink(sink.clone());
    let scheduler = PriorityScheduler::with_parts(&config, Arc::new(config.thread_factory()), router);

    fail_once(&scheduler);
    assert!(wait_until(TIMEOUT, || !sink.0.lock().is_empty()));
    let text = String::from_utf8_lossy(&sink.0.lock()).into_owned();
    assert!(text.contains("Uncaught task failure"));
    assert!(text.contains("task failed"));
}

#[test]
fn test_task_handler_receives_its_own_failure() {
    let (own_seen, own) = collector();
    let (inherited, inheritable) = collector();
    let sink = Capture::default();
    let config = config(2, 100);
    let router = FailureRouter::new().with_inheritable(inheritable).with_sink(sink.clone());
    let scheduler = PriorityScheduler::with_parts(&config, Arc::new(config.thread_factory()), router);

    let with_handler = scheduler
        .submit_with(
            || panic!("own failure"),
            Duration::ZERO,
            TaskOptions::default().with_failure_handler(own),
        )
        .unwrap();
    let without = scheduler.submit(|| panic!("shared failure"), None).unwrap();

    assert!(wait_until(TIMEOUT, || own_seen.lock().len() == 1));
    assert!(wait_until(TIMEOUT, || inherited.lock().len() == 1));
    assert!(wait_until(TIMEOUT, || scheduler.stats().failed == 2));

    let own_seen = own_seen.lock();
    assert_eq!(own_seen[0].task_id(), with_handler.id());
    assert_eq!(own_seen[0].message(), "own failure");
    let inherited = inherited.lock();
    assert_eq!(inherited[0].task_id(), without.id());
    assert!(sink.0.lock().is_empty());
}
