//! The process-wide interrupt level.
//!
//! On a real single CPU, masking interrupts is enough to serialise
//! handlers against kernel code. Here the level is a reentrant gate:
//! DISABLED means some thread owns it, ENABLED means it is free. The gate
//! guards the scheduler state (thread slab, ready/exited/wait queues,
//! running/expire) and masks preemption: the preemption handler only
//! fires when the gate is free. Lock order is fixed: a thread may acquire
//! the gate while holding a test-and-set lock, never the other way
//! around, and nothing blocks on a semaphore while the gate is held.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

/// 0 = ENABLED (no owner); otherwise the owner thread's token.
static GATE: AtomicU32 = AtomicU32::new(0);

static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static TOKEN: Cell<u32> = const { Cell::new(0) };
    /// Nesting depth of `disable()` on this thread.
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

#[inline]
fn my_token() -> u32 {
    TOKEN.with(|t| {
        let mut v = t.get();
        if v == 0 {
            v = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
            t.set(v);
        }
        v
    })
}

/// Opaque saved interrupt level, in the style of
/// `oldlevel = set_interrupt_level(DISABLED)`.
#[must_use]
pub struct Level {
    outermost: bool,
}

/// Disable interrupts: acquire the gate, reentrantly.
pub fn disable() -> Level {
    let token = my_token();
    if GATE.load(Ordering::Relaxed) == token {
        DEPTH.with(|d| d.set(d.get() + 1));
        return Level { outermost: false };
    }
    while GATE
        .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        crate::machine::cpu_relax();
    }
    DEPTH.with(|d| d.set(1));
    Level { outermost: true }
}

/// Restore the level saved by the matching [`disable`].
pub fn restore(level: Level) {
    DEPTH.with(|d| d.set(d.get() - 1));
    if level.outermost {
        debug_assert_eq!(DEPTH.with(|d| d.get()), 0);
        GATE.store(0, Ordering::Release);
    }
}

/// True when the calling thread owns the gate.
pub fn owned_by_me() -> bool {
    GATE.load(Ordering::Relaxed) == my_token() && TOKEN.with(|t| t.get() != 0)
}

/// Non-blocking acquire for the preemption signal handler. Returns `None`
/// when interrupts are disabled (the preemption is dropped for this tick).
pub(crate) fn try_disable_from_signal() -> Option<Level> {
    let token = my_token();
    if GATE.load(Ordering::Relaxed) == token {
        // The signal interrupted our own disabled section.
        return None;
    }
    if GATE
        .compare_exchange(0, token, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        DEPTH.with(|d| d.set(1));
        Some(Level { outermost: true })
    } else {
        None
    }
}

/// Release the gate entirely and report the nesting depth, so the
/// scheduler can block with interrupts conceptually still disabled and
/// re-establish the same depth when the thread is dispatched again.
pub(crate) fn release_all() -> u32 {
    debug_assert!(owned_by_me());
    let depth = DEPTH.with(|d| {
        let v = d.get();
        d.set(0);
        v
    });
    GATE.store(0, Ordering::Release);
    depth
}

/// Re-acquire the gate at a saved depth.
pub(crate) fn reacquire(depth: u32) {
    let token = my_token();
    while GATE
        .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        crate::machine::cpu_relax();
    }
    DEPTH.with(|d| d.set(depth));
}

/// Run `f` with interrupts disabled. The entry point for external event
/// sources delivering work into the kernel.
pub fn with_disabled<R>(f: impl FnOnce() -> R) -> R {
    let level = disable();
    let r = f();
    restore(level);
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting() {
        let a = disable();
        assert!(owned_by_me());
        let b = disable();
        restore(b);
        assert!(owned_by_me());
        restore(a);
        assert!(!owned_by_me());
    }

    #[test]
    fn release_and_reacquire() {
        let a = disable();
        let b = disable();
        let depth = release_all();
        assert_eq!(depth, 2);
        assert!(!owned_by_me());
        reacquire(depth);
        assert!(owned_by_me());
        restore(b);
        restore(a);
    }
}
