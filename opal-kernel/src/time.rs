//! Kernel time, backed by a registered clock source.

use spinning_top::RwSpinlock;

pub trait ClockSource: Send + Sync {
    /// Monotonic time since boot, in microseconds.
    fn uptime_us(&self) -> u64;

    /// Wall-clock time in seconds since the epoch.
    fn wall_clock_s(&self) -> u64 {
        0
    }
}

static CLOCK: RwSpinlock<Option<&'static dyn ClockSource>> = RwSpinlock::new(None);

pub fn init(source: &'static dyn ClockSource) {
    *CLOCK.write() = Some(source);
}

pub fn uptime_us() -> u64 {
    (*CLOCK.read()).map(|c| c.uptime_us()).unwrap_or(0)
}

pub fn uptime_s() -> u64 {
    uptime_us() / 1_000_000
}

pub fn wall_clock_s() -> u64 {
    (*CLOCK.read()).map(|c| c.wall_clock_s()).unwrap_or(0)
}
