//! Cached wall-clock time with an optional CPU-tick fast path.
//!
//! The reactor reads the clock at least twice per iteration, and busy servers
//! iterate tens of thousands of times per second. Reading a CPU tick counter
//! and extrapolating from a calibrated anchor is much cheaper than a system
//! call, so [`current_time`] calibrates the counter against the OS clock once
//! at startup and afterwards only re-queries the OS about once per second.

use std::sync::Mutex;
use std::time::Duration;

/// Seconds and microseconds since the Unix epoch.
///
/// The derived ordering is field order (seconds, then microseconds), which is
/// the chronological order as long as `usec` stays normalized to
/// `0..1_000_000`. All constructors and arithmetic here maintain that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i32,
}

pub(crate) const USEC_PER_SEC: i32 = 1_000_000;

impl TimeVal {
    pub fn new(sec: i64, usec: i32) -> Self {
        let mut tv = TimeVal { sec, usec };
        tv.normalize();
        tv
    }

    /// Advance by a millisecond count. Exact for every `u64` input; the
    /// microsecond column is normalized into seconds.
    pub fn add_millis(&mut self, millis: u64) {
        self.sec += (millis / 1000) as i64;
        self.usec += (millis % 1000) as i32 * 1000;
        if self.usec >= USEC_PER_SEC {
            self.usec -= USEC_PER_SEC;
            self.sec += 1;
        }
    }

    /// Advance by a duration (sub-microsecond precision is dropped).
    pub fn add_duration(&mut self, d: Duration) {
        self.sec += d.as_secs() as i64;
        self.usec += d.subsec_micros() as i32;
        if self.usec >= USEC_PER_SEC {
            self.usec -= USEC_PER_SEC;
            self.sec += 1;
        }
    }

    /// Milliseconds from `now` until this instant, rounded *up* to a whole
    /// millisecond. Returns 0 when the instant is not in the future.
    ///
    /// Rounding upward matters for timer waits: rounding down would wake the
    /// poll a fraction of a millisecond early and spin until the timer is
    /// actually due.
    pub fn millis_until_ceil(&self, now: &TimeVal) -> u64 {
        if *self <= *now {
            return 0;
        }
        let mut sec = self.sec - now.sec;
        let mut usec = self.usec - now.usec;
        if usec < 0 {
            usec += USEC_PER_SEC;
            sec -= 1;
        }
        sec as u64 * 1000 + (usec as u64).div_ceil(1000)
    }

    /// Whole milliseconds elapsed from `earlier` to this instant
    /// (truncating; negative when this instant is earlier).
    pub fn millis_since(&self, earlier: &TimeVal) -> i64 {
        (self.sec - earlier.sec) * 1000 + (self.usec - earlier.usec) as i64 / 1000
    }

    fn normalize(&mut self) {
        while self.usec >= USEC_PER_SEC {
            self.usec -= USEC_PER_SEC;
            self.sec += 1;
        }
        while self.usec < 0 {
            self.usec += USEC_PER_SEC;
            self.sec -= 1;
        }
    }
}

/// Read the OS wall clock.
pub(crate) fn wall_clock() -> TimeVal {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    // SAFETY: gettimeofday with a valid timeval pointer and a null timezone
    // never fails on any platform we support.
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
    }
    TimeVal {
        sec: tv.tv_sec as i64,
        usec: tv.tv_usec as i32,
    }
}

// ---------------------------------------------------------------------------
// CPU tick counter
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn read_ticks() -> u64 {
    // SAFETY: RDTSC is unprivileged and side-effect free.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn read_ticks() -> u64 {
    let val: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0; read-only system register.
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) val, options(nostack, nomem));
    }
    val
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
const HAS_TICK_COUNTER: bool = true;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const HAS_TICK_COUNTER: bool = false;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn read_ticks() -> u64 {
    0
}

// ---------------------------------------------------------------------------
// Calibrated clock
// ---------------------------------------------------------------------------

/// Number of seconds the calibration phase observes before trusting the
/// measured tick rate.
const CALIBRATION_SECS: i64 = 3;

/// `usecs_per_tick` is stored as a fixed-point value with this shift so the
/// per-call extrapolation is a multiply and a shift.
const USECS_PER_TICK_SHIFT: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickState {
    /// No anchor recorded yet.
    Init,
    /// Anchor recorded; measuring the tick rate.
    HasLastTick,
    /// Rate known (e.g. configured ahead of time) but no anchor yet.
    HasTickRate,
    /// Calibrated; extrapolating from the anchor.
    Ready,
    /// Counter unusable; always ask the OS.
    Fallback,
}

struct Clock {
    state: TickState,
    last_tick: u64,
    last_tick_time: TimeVal,
    usecs_per_tick: u64,
    /// Tick deltas above this (about one second) force a resync against the
    /// OS clock, bounding extrapolation drift.
    max_tick_delta: u64,
}

static CLOCK: Mutex<Clock> = Mutex::new(Clock {
    state: TickState::Init,
    last_tick: 0,
    last_tick_time: TimeVal { sec: 0, usec: 0 },
    usecs_per_tick: 0,
    max_tick_delta: 0,
});

impl Clock {
    fn read(&mut self) -> TimeVal {
        match self.state {
            TickState::Init => {
                self.last_tick_time = wall_clock();
                self.last_tick = read_ticks();
                self.state = TickState::HasLastTick;
                self.last_tick_time
            }
            TickState::HasLastTick => {
                let tv = wall_clock();
                if tv.sec > self.last_tick_time.sec + CALIBRATION_SECS {
                    self.finish_calibration(tv);
                }
                tv
            }
            TickState::HasTickRate => {
                self.last_tick_time = wall_clock();
                self.last_tick = read_ticks();
                self.state = TickState::Ready;
                self.last_tick_time
            }
            TickState::Ready => {
                let this_tick = read_ticks();
                let delta = this_tick.wrapping_sub(self.last_tick);
                if delta > self.max_tick_delta {
                    self.last_tick = this_tick;
                    self.last_tick_time = wall_clock();
                    self.last_tick_time
                } else {
                    let usecs = (delta * self.usecs_per_tick) >> USECS_PER_TICK_SHIFT;
                    let mut tv = self.last_tick_time;
                    tv.sec += (usecs / USEC_PER_SEC as u64) as i64;
                    tv.usec += (usecs % USEC_PER_SEC as u64) as i32;
                    if tv.usec >= USEC_PER_SEC {
                        tv.usec -= USEC_PER_SEC;
                        tv.sec += 1;
                    }
                    tv
                }
            }
            TickState::Fallback => wall_clock(),
        }
    }

    fn finish_calibration(&mut self, tv: TimeVal) {
        let dusec = (tv.usec - self.last_tick_time.usec) as f64
            + 1e6 * (tv.sec - self.last_tick_time.sec) as f64;
        let this_tick = read_ticks();
        let dticks = this_tick.wrapping_sub(self.last_tick) as f64;
        let ticks_per_usec = dticks / dusec;
        if ticks_per_usec <= 1.0 {
            log::debug!("tick counter slower than 1 tick/us; using the OS clock");
            self.state = TickState::Fallback;
            return;
        }
        self.usecs_per_tick = ((1u64 << USECS_PER_TICK_SHIFT) as f64 / ticks_per_usec) as u64;
        if self.usecs_per_tick == 0 {
            log::debug!("tick rate calibration underflowed; using the OS clock");
            self.state = TickState::Fallback;
            return;
        }
        self.max_tick_delta = (1e6 * ticks_per_usec) as u64;
        self.last_tick = this_tick;
        self.last_tick_time = tv;
        self.state = TickState::Ready;
    }
}

/// Current time, from the calibrated tick counter when one is available and
/// from the OS clock otherwise.
pub fn current_time() -> TimeVal {
    if !HAS_TICK_COUNTER {
        return wall_clock();
    }
    CLOCK.lock().expect("clock mutex poisoned").read()
}
