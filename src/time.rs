//! Monotonic nanosecond timestamps shared by every component.
//!
//! All deadlines and latencies are absolute nanosecond values on the host's
//! monotonic clock, so headers can carry them as plain `u64`s. A [`Clock`]
//! wraps the raw reading with an injectable offset; experiments use it to
//! skew one node's view of time without touching the others.

pub type Timestamp = u64;

/// Signed nanosecond interval. Slack values go negative once a deadline has
/// passed.
pub type DurationNs = i64;

/// Current monotonic time in nanoseconds.
#[cfg(target_os = "linux")]
pub fn now_ns() -> Timestamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(target_os = "linux"))]
pub fn now_ns() -> Timestamp {
    use std::sync::OnceLock;
    use std::time::Instant;
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as u64
}

pub const fn us_to_ns(us: u64) -> Timestamp {
    us * 1_000
}

pub const fn ms_to_ns(ms: u64) -> Timestamp {
    ms * 1_000_000
}

pub fn ns_to_us(ns: Timestamp) -> f64 {
    ns as f64 / 1_000.0
}

pub fn ns_to_ms(ns: Timestamp) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Clock view with a fixed signed offset from the host monotonic clock.
///
/// Components stamp and judge time exclusively through their own `Clock`, so
/// a skewed worker really does live in a different time domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock {
    skew_ns: i64,
}

impl Clock {
    pub fn new() -> Self {
        Clock { skew_ns: 0 }
    }

    /// Clock whose readings lead (positive) or trail (negative) the host
    /// clock by `skew_ns`.
    pub fn with_skew(skew_ns: i64) -> Self {
        Clock { skew_ns }
    }

    pub fn now(&self) -> Timestamp {
        let raw = now_ns();
        if self.skew_ns >= 0 {
            raw.saturating_add(self.skew_ns as u64)
        } else {
            raw.saturating_sub(self.skew_ns.unsigned_abs())
        }
    }

    /// Signed slack of `deadline` relative to this clock's current reading.
    pub fn slack(&self, deadline: Timestamp) -> DurationNs {
        deadline as i64 - self.now() as i64
    }
}

/// Busy-wait on the monotonic clock until `target`, checking `keep_going`
/// between spins so shutdown is never blocked on a long wait.
pub fn spin_until(target: Timestamp, keep_going: impl Fn() -> bool) {
    while now_ns() < target {
        if !keep_going() {
            return;
        }
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let mut prev = now_ns();
        for _ in 0..1000 {
            let next = now_ns();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn skewed_clock_leads_host() {
        let skewed = Clock::with_skew(ms_to_ns(100) as i64);
        let host = Clock::new();
        let diff = skewed.now() as i64 - host.now() as i64;
        assert!(diff >= ms_to_ns(99) as i64);
    }

    #[test]
    fn slack_sign_tracks_deadline() {
        let clock = Clock::new();
        let future = clock.now() + ms_to_ns(10);
        assert!(clock.slack(future) > 0);
        let past = clock.now().saturating_sub(ms_to_ns(10));
        assert!(clock.slack(past) <= 0);
    }

    #[test]
    fn spin_until_honours_stop() {
        let start = now_ns();
        spin_until(start + ms_to_ns(500), || false);
        assert!(now_ns() - start < ms_to_ns(100));
    }
}
