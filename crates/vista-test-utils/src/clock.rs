//! Simulated clock for deterministic time control.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use vista_core::clock::Clock;

/// Clock that only moves when a test advances it.
#[derive(Debug)]
pub struct SimulatedClock {
    base: DateTime<Utc>,
    elapsed_ms: AtomicI64,
}

impl SimulatedClock {
    /// Creates a clock starting at `base`.
    #[must_use]
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicI64::new(0),
        }
    }

    /// Creates a clock anchored at a fixed, recent instant (2024-06-15T12:00:00Z).
    #[must_use]
    pub fn deterministic() -> Self {
        let base = Utc
            .with_ymd_and_hms(2024, 6, 15, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        Self::new(base)
    }

    /// Advances the clock.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).expect("duration fits in i64 ms");
        self.elapsed_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Advances the clock by whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Time elapsed since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let ms = self.elapsed_ms.load(Ordering::SeqCst);
        Duration::from_millis(u64::try_from(ms).unwrap_or(0))
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::deterministic()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::milliseconds(self.elapsed_ms.load(Ordering::SeqCst))
    }
}
