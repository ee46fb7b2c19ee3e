//! Thread parking: the context-switch primitive.
//!
//! Each minithread's host thread owns a `ParkToken`. Handing the virtual
//! CPU to a thread means `unpark`ing it; giving the CPU up means `park`ing.
//! The token is a single futex word so that both operations are
//! allocation-free and usable from the preemption signal handler.

use core::sync::atomic::{AtomicU32, Ordering};

const EMPTY: u32 = 0;
const NOTIFIED: u32 = 1;

/// One-slot wakeup token. `unpark` before `park` is remembered.
pub struct ParkToken {
    state: AtomicU32,
}

impl ParkToken {
    pub const fn new() -> Self {
        ParkToken { state: AtomicU32::new(EMPTY) }
    }

    /// Block until notified. Consumes the notification.
    pub fn park(&self) {
        loop {
            if self
                .state
                .compare_exchange(NOTIFIED, EMPTY, Ordering::Acquire, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            futex_wait(&self.state, EMPTY);
        }
    }

    /// Notify the owning thread, waking it if parked.
    pub fn unpark(&self) {
        if self.state.swap(NOTIFIED, Ordering::Release) == EMPTY {
            futex_wake(&self.state);
        }
    }
}

fn futex_wait(word: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

fn futex_wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn unpark_before_park_is_remembered() {
        let t = ParkToken::new();
        t.unpark();
        t.park(); // must not block
    }

    #[test]
    fn park_wakes_on_unpark() {
        let t = Arc::new(ParkToken::new());
        let t2 = t.clone();
        let h = std::thread::spawn(move || t2.park());
        std::thread::sleep(Duration::from_millis(20));
        t.unpark();
        h.join().unwrap();
    }
}
