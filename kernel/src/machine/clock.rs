//! The clock: a host timer thread standing in for the periodic interrupt.
//!
//! Every period the clock advances `ticks`, lets the scheduler preempt the
//! running thread if its quantum expired, and fires due alarms. Alarm
//! callbacks run on this thread with interrupts enabled; they must not
//! block (the canonical callback is `Semaphore::v`).

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

/// Ticks since the clock started.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Tick period in milliseconds, fixed at clock start.
static PERIOD_MS: AtomicU64 = AtomicU64::new(10);

static STARTED: Once = Once::new();

/// Current tick count.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Tick period in milliseconds.
#[inline]
pub fn period_ms() -> u64 {
    PERIOD_MS.load(Ordering::Relaxed)
}

/// Convert a millisecond delay to a tick count, rounding up; a zero delay
/// still takes one tick (an alarm never fires on the tick that set it).
pub fn ticks_for_ms(ms: u64) -> u64 {
    ms.div_ceil(period_ms()).max(1)
}

/// Start the clock thread. Idempotent; the period is fixed by the first
/// caller.
pub(crate) fn start(tick_ms: u64) {
    STARTED.call_once(|| {
        PERIOD_MS.store(tick_ms.max(1), Ordering::Relaxed);
        std::thread::Builder::new()
            .name("clock".into())
            .spawn(clock_loop)
            .expect("clock: failed to start timer thread");
    });
}

fn clock_loop() {
    let period = Duration::from_millis(period_ms());
    loop {
        std::thread::sleep(period);
        TICKS.fetch_add(1, Ordering::Relaxed);
        crate::task::quantum_tick();
        // Outside the interrupt gate: a callback's V may spin on a TAS
        // lock whose holder needs the gate to make progress.
        crate::alarm::fire_due();
    }
}
