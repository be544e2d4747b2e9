/// Wall-clock sources.
///
/// Presence liveness, completion stamps and deadline checks all read "now"
/// through a `Clock` so that timers and timestamps can be driven together
/// in tests.
use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Plain system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored to the tokio runtime clock.
///
/// Reads the system time once at construction and then advances with
/// `tokio::time::Instant`, so a paused runtime (`start_paused`) moves both
/// the timers and the timestamps written into presence records.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    wall_base: DateTime<Utc>,
    instant_base: tokio::time::Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall_base: DateTime<Utc>) -> Self {
        Self {
            wall_base,
            instant_base: tokio::time::Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.instant_base);
        self.wall_base + chrono::Duration::milliseconds(elapsed.as_millis() as i64)
    }
}
