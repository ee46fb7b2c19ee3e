//! Machine layer: the "hardware" of the user-space kernel.
//!
//! Everything the rest of the kernel treats as given by the machine lives
//! here: the test-and-set lock, the parking primitive that stands in for a
//! context switch, the process-wide interrupt level, the clock, and the
//! preemption signal. Each minithread owns a dedicated host thread (its
//! stack); at any instant at most one of them is unparked, which is what
//! makes this a single virtual CPU.

pub mod clock;
pub mod interrupts;
pub mod park;
pub mod tas;

use std::sync::Once;

/// Signal used to preempt the running thread when its quantum expires.
pub(crate) const PREEMPT_SIGNAL: libc::c_int = libc::SIGURG;

static INIT: Once = Once::new();

/// Install the preemption signal handler. Idempotent.
pub(crate) fn init() {
    INIT.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = preempt_handler as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(PREEMPT_SIGNAL, &sa, std::ptr::null_mut()) != 0 {
            panic!("machine: failed to install preemption handler");
        }
    });
}

/// Preemption entry point. Runs on the interrupted thread's host thread.
///
/// Everything reachable from here must be allocation-free: the interrupted
/// code may be suspended inside the allocator.
extern "C" fn preempt_handler(_sig: libc::c_int) {
    let errno = unsafe { *libc::__errno_location() };
    crate::task::preempt_from_signal();
    unsafe { *libc::__errno_location() = errno };
}

/// Hint the host CPU that we are spinning. The idle thread lives here.
#[inline(always)]
pub fn cpu_relax() {
    std::hint::spin_loop();
}
