//! Shared helpers for the integration tests

use std::thread;
use std::time::{Duration, Instant};

use priosched::SchedulerConfig;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until<F>(
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

/// Small pool with a short low-priority wait.
pub fn config(
    pool_size: usize,
    low_wait_ms: u64,
) -> SchedulerConfig {
    SchedulerConfig {
        pool_size,
        max_wait_for_low_priority_ms: low_wait_ms,
        keep_alive_ms: 2_000,
        thread_name_prefix: "it".to_string(),
        ..SchedulerConfig::default()
    }
}
