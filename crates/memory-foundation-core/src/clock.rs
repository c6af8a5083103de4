use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use time::{Duration, OffsetDateTime};

/// Source of timestamps for every store. Stores never read wall-clock time
/// directly, so a test can replay the exact same sequence of hashes.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub type SharedClock = Arc<dyn Clock>;

impl<F> Clock for F
where
    F: Fn() -> OffsetDateTime + Send + Sync,
{
    fn now(&self) -> OffsetDateTime {
        self()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Logical clock that returns `start`, `start + step`, `start + 2 * step`, ...
/// on successive reads.
pub struct SteppingClock {
    start: OffsetDateTime,
    step: Duration,
    ticks: AtomicU32,
}

impl SteppingClock {
    #[must_use]
    pub fn new(start: OffsetDateTime, step: Duration) -> Self {
        Self { start, step, ticks: AtomicU32::new(0) }
    }

    /// Number of timestamps handed out so far.
    #[must_use]
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Debug for SteppingClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SteppingClock")
            .field("start", &self.start)
            .field("step", &self.step)
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> OffsetDateTime {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        self.start.checked_add(self.step * tick).unwrap_or(self.start)
    }
}
