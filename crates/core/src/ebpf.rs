//! Shared eBPF host utilities: memlock limits and kernel clock conversion.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Lift RLIMIT_MEMLOCK so map creation works on kernels that still charge
/// BPF memory against it (< 5.11).
pub fn raise_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &raw const rlim) };
    if ret != 0 {
        debug!(
            "failed to remove memlock limit: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Current CLOCK_MONOTONIC in nanoseconds, the clock behind
/// `bpf_ktime_get_ns()`.
#[must_use]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts);
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// A paired monotonic/wall-clock reading used to place kernel timestamps
/// on the wall clock. Take one per snapshot so every record shares it.
#[derive(Debug, Clone, Copy)]
pub struct ClockAnchor {
    mono_ns: u64,
    wall: DateTime<Utc>,
}

impl ClockAnchor {
    pub fn now() -> Self {
        Self {
            mono_ns: monotonic_ns(),
            wall: Utc::now(),
        }
    }

    pub fn new(mono_ns: u64, wall: DateTime<Utc>) -> Self {
        Self { mono_ns, wall }
    }

    /// Timestamps from the future (clock skew between reads) clamp to the
    /// anchor.
    pub fn to_wall(&self, ktime_ns: u64) -> DateTime<Utc> {
        let age = self.mono_ns.saturating_sub(ktime_ns);
        let age = TimeDelta::nanoseconds(i64::try_from(age).unwrap_or(i64::MAX));
        self.wall
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
