//! Time primitives
//!
//! Timestamps are monotonic nanoseconds since a process-wide epoch fixed on
//! first use. They order events within one process and measure latency; they
//! are never compared across processes.

use std::ops::{Add, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic timestamp in nanoseconds since the process epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Current time relative to the process epoch
    pub fn now() -> Self {
        let epoch = *EPOCH.get_or_init(Instant::now);
        let nanos = Instant::now().duration_since(epoch).as_nanos();
        Timestamp(nanos.min(u64::MAX as u128) as u64)
    }

    #[inline]
    pub fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros.saturating_mul(1_000))
    }

    #[inline]
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[inline]
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_nanos().min(u64::MAX as u128) as u64))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.since(rhs)
    }
}

/// Deadline for a budgeted operation
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Deadline {
            started: Instant::now(),
            budget,
        }
    }

    #[inline]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// A zero budget is expired from the start
    #[inline]
    pub fn expired(&self) -> bool {
        self.elapsed() >= self.budget
    }
}
