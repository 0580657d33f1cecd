//! Cached, semi-accurate clock
//!
//! Scheduler time is a `u64` count of milliseconds on a monotonic source.
//! Reads normally refresh the cached value; while a [`ClockHold`] is alive the
//! clock stops refreshing, so a burst of insertions is ordered against one
//! snapshot instead of racing an advancing clock.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Process-wide origin of [`MonotonicSource`] time.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Convert a duration to whole milliseconds, saturating.
#[inline]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Source of monotonic milliseconds.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Current time in milliseconds. Must never go backwards.
    fn now_millis(&self) -> u64;
}

/// Wall-independent time based on [`Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicSource;

impl TimeSource for MonotonicSource {
    fn now_millis(&self) -> u64 {
        duration_millis(EPOCH.elapsed())
    }
}

/// Time that only moves when told to. Useful for driving a
/// [`TickScheduler`](super::tick::TickScheduler) deterministically.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    /// Create a source starting at `start` milliseconds.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move time forward by `duration`.
    pub fn advance(
        &self,
        duration: Duration,
    ) -> u64 {
        let step = duration_millis(duration);
        self.now.fetch_add(step, Ordering::SeqCst) + step
    }

    /// Jump to `millis`. Ignored if that would move time backwards.
    pub fn set(
        &self,
        millis: u64,
    ) {
        self.now.fetch_max(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Clock with a cached last-known time and a hold window.
pub struct Clock {
    source: Arc<dyn TimeSource>,
    cached: AtomicU64,
    holds: AtomicUsize,
}

impl fmt::Debug for Clock {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Clock")
            .field("source", &self.source)
            .field("last_known", &self.last_known())
            .field("held", &self.is_held())
            .finish()
    }
}

impl Clock {
    /// Clock backed by [`MonotonicSource`].
    pub fn new() -> Self {
        Self::with_source(Arc::new(MonotonicSource))
    }

    pub fn with_source(source: Arc<dyn TimeSource>) -> Self {
        let start = source.now_millis();
        Self {
            source,
            cached: AtomicU64::new(start),
            holds: AtomicUsize::new(0),
        }
    }

    /// Semi-accurate time: refreshed unless a hold is active.
    #[inline]
    pub fn now(&self) -> u64 {
        if self.is_held() {
            self.last_known()
        } else {
            self.accurate_now()
        }
    }

    /// Read the source, ignoring any hold. The cache is only refreshed
    /// while no hold is active, so held readers keep their snapshot.
    #[inline]
    pub fn accurate_now(&self) -> u64 {
        let now = self.source.now_millis();
        if self.is_held() {
            return now.max(self.last_known());
        }
        let previous = self.cached.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    /// Cached time from the last refresh.
    #[inline]
    pub fn last_known(&self) -> u64 {
        self.cached.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.holds.load(Ordering::SeqCst) > 0
    }

    /// Suspend auto-refresh until the returned guard drops. Holds nest.
    pub fn hold(&self) -> ClockHold<'_> {
        if self.holds.fetch_add(1, Ordering::SeqCst) == 0 {
            self.cached
                .fetch_max(self.source.now_millis(), Ordering::SeqCst);
        }
        ClockHold { clock: self }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped hold on a [`Clock`]; releasing it resumes auto-refresh.
#[derive(Debug)]
#[must_use = "the hold is released as soon as the guard is dropped"]
pub struct ClockHold<'a> {
    clock: &'a Clock,
}

impl ClockHold<'_> {
    /// The snapshot every read observes while held.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.last_known()
    }
}

impl Drop for ClockHold<'_> {
    fn drop(&mut self) {
        if self.clock.holds.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.clock.accurate_now();
        }
    }
}
