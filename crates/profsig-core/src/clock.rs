//! Monotonic clock used by the driver thread's harvest loop.
//!
//! A thin seam over `std::time`/`std::thread::sleep` so the harvest cadence
//! can be reasoned about without depending on wall-clock time, matching the
//! host environment's `clock_nanosleep`-equivalent contract.

use std::time::{Duration, Instant};

pub fn now() -> Instant {
    Instant::now()
}

pub fn sleep_for(duration: Duration) {
    std::thread::sleep(duration);
}

/// Sleep until `deadline`, returning immediately if it has already passed.
pub fn sleep_until(deadline: Instant) {
    let n = now();
    if deadline > n {
        sleep_for(deadline - n);
    }
}
