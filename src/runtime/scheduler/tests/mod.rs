//! Scheduler 单元测试
//!
//! 测试任务模型、时钟、队列、失败路由和两种调度器


use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::runtime::scheduler::{Clock, ManualTimeSource, TickScheduler};

/// Tick scheduler on a manual clock starting at 0.
pub(super) fn manual_tick_scheduler(blocking: bool) -> (TickScheduler, Arc<ManualTimeSource>) {
    let source = Arc::new(ManualTimeSource::new(0));
    let scheduler = TickScheduler::with_clock(blocking, Clock::with_source(source.clone()));
    (scheduler, source)
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub(super) fn wait_until<F>(
    timeout: Duration,
    mut condition: F,
) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[cfg(test)]
mod scheduler_trait_tests {
    use super::*;
    use crate::runtime::scheduler::{
        RecurrenceMode, Scheduler, SchedulerError, TaskKind, TaskOptions, TaskPriority,
    };

    #[test]
    fn test_zero_period_rejected() {
        let (scheduler, _) = manual_tick_scheduler(false);
        let result = scheduler.submit_recurring(
            || {},
            Duration::ZERO,
            Duration::ZERO,
            RecurrenceMode::FixedRate,
            None,
        );
        assert!(matches!(result, Err(SchedulerError::InvalidPeriod)));
        assert_eq!(scheduler.queued_task_count(), 0);
    }

    #[test]
    fn test_sub_millisecond_period_rejected() {
        let (scheduler, _) = manual_tick_scheduler(false);
        let result = scheduler.submit_recurring(
            || {},
            Duration::ZERO,
            Duration::from_micros(500),
            RecurrenceMode::FixedDelay,
            None,
        );
        assert!(matches!(result, Err(SchedulerError::InvalidPeriod)));
    }

    #[test]
    fn test_default_priority_applies() {
        let (scheduler, _) = manual_tick_scheduler(false);
        let scheduler = scheduler.with_default_priority(TaskPriority::Low);
        let handle = scheduler.submit(|| {}, None).unwrap();
        assert_eq!(handle.priority(), TaskPriority::Low);

        let handle = scheduler.submit(|| {}, Some(TaskPriority::Starvable)).unwrap();
        assert_eq!(handle.priority(), TaskPriority::Starvable);
    }

    #[test]
    fn test_schedule_through_trait_object() {
        let (scheduler, _) = manual_tick_scheduler(false);
        let dynamic: &dyn Scheduler = &scheduler;
        let handle = dynamic
            .schedule(Box::new(|| {}), Duration::ZERO, TaskKind::OneTime, TaskOptions::default())
            .unwrap();
        assert_eq!(dynamic.default_priority(), TaskPriority::High);
        assert!(dynamic.cancel(&handle));
        assert!(!dynamic.cancel(&handle));
    }
}
