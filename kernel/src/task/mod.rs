//! Minithreads: create/fork/yield/exit and the cleanup thread.
//!
//! A minithread is a dedicated host thread whose stack is its thread
//! stack; the scheduler in [`scheduler`] decides which single one of them
//! is unparked. Exited threads queue up for a long-running cleanup thread
//! that joins the host thread and releases the TCB slot.

pub(crate) mod scheduler;
pub mod thread;

use std::sync::Arc;

use crate::machine::park::ParkToken;
use crate::machine::{clock, interrupts};
use crate::machine::tas::TasGuard;
use crate::sync::Semaphore;
use thread::{Status, Tcb, Tid};

pub(crate) use scheduler::{current, preempt_from_signal, quantum_tick};

/// Counts threads sitting in the exited queue.
static EXIT_COUNT: Semaphore = Semaphore::new(0);
/// Serialises access to the exited queue.
static EXIT_MUTEX: Semaphore = Semaphore::new(1);

/// Create a thread in INITIAL state; its first dispatch runs `f` and on
/// return the thread exits. Returns `None` if the host thread cannot be
/// spawned.
pub fn create<F>(f: F) -> Option<Tid>
where
    F: FnOnce() + Send + 'static,
{
    let park = Arc::new(ParkToken::new());
    let sleep_sem = Arc::new(Semaphore::new(0));

    let level = interrupts::disable();
    let (slot, id) = scheduler::with_cpu(|cpu| {
        let id = cpu.next_id;
        cpu.next_id += 1;
        cpu.thread_count += 1;
        (cpu.threads.insert(Tcb::new(id, park.clone(), sleep_sem)), id)
    });
    interrupts::restore(level);

    let child_park = park;
    let spawned = std::thread::Builder::new()
        .name(format!("minithread-{id}"))
        .stack_size(crate::config::stack_size())
        .spawn(move || {
            scheduler::set_current(slot);
            child_park.park();
            // A panicking thread must still exit through the trampoline,
            // or the virtual CPU would never be handed on.
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                let msg = e
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| e.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic".into());
                log::error!("[task] thread {id} panicked: {msg}");
            }
            exit_current();
        });

    let level = interrupts::disable();
    match spawned {
        Ok(handle) => {
            scheduler::with_cpu(|cpu| {
                let t = cpu.threads.get_mut(slot);
                t.pthread = std::os::unix::thread::JoinHandleExt::as_pthread_t(&handle);
                t.join = Some(handle);
            });
            interrupts::restore(level);
            Some(slot)
        }
        Err(e) => {
            scheduler::with_cpu(|cpu| {
                cpu.threads.remove(slot);
                cpu.thread_count -= 1;
            });
            interrupts::restore(level);
            log::warn!("[task] thread spawn failed: {e}");
            None
        }
    }
}

/// Make `t` runnable. Does not preempt the caller.
pub fn start(t: Tid) {
    let level = interrupts::disable();
    scheduler::make_ready_locked(t);
    interrupts::restore(level);
}

/// Create and start a thread.
pub fn fork<F>(f: F) -> Option<Tid>
where
    F: FnOnce() + Send + 'static,
{
    let t = create(f)?;
    start(t);
    Some(t)
}

/// Put the caller at the tail of its priority's ready queue and schedule;
/// demotes the caller one level when its quantum has expired.
pub fn yield_now() {
    let level = interrupts::disable();
    scheduler::yield_locked();
    interrupts::restore(level);
}

/// External id of the running thread.
pub fn current_id() -> u32 {
    interrupts::with_disabled(|| {
        scheduler::with_cpu(|cpu| cpu.threads.get(current()).id)
    })
}

/// Number of live threads (idle included).
pub fn thread_count() -> u32 {
    interrupts::with_disabled(|| scheduler::with_cpu(|cpu| cpu.thread_count))
}

/// Atomically clear `guard`'s test-and-set lock and block the caller.
/// The gate must be held; the caller must already be enqueued.
pub(crate) fn unlock_and_stop<T>(guard: TasGuard<'_, T>) {
    debug_assert!(interrupts::owned_by_me());
    let me = current();
    scheduler::with_cpu(|cpu| cpu.threads.get_mut(me).status = Status::Blocked);
    guard.release();
    scheduler::schedule_and_park();
}

/// Sleep for at least `delay` milliseconds without blocking other threads.
pub fn sleep_ms(delay: u64) {
    let sem = interrupts::with_disabled(|| {
        scheduler::with_cpu(|cpu| cpu.threads.get(current()).sleep_sem.clone())
    });
    let waker = sem.clone();
    crate::alarm::register(delay, move || waker.v());
    sem.p();
}

/// Exit trampoline: runs after a thread's procedure returns.
fn exit_current() {
    let me = current();
    EXIT_MUTEX.p();
    interrupts::with_disabled(|| {
        scheduler::with_cpu(|cpu| cpu.exited.push_back(&mut cpu.threads, me));
    });
    EXIT_MUTEX.v();
    EXIT_COUNT.v();
    let level = interrupts::disable();
    scheduler::with_cpu(|cpu| cpu.threads.get_mut(me).status = Status::Exited);
    scheduler::schedule_exit(level);
    // The switch above dispatched another thread; this host thread now
    // unwinds and is joined by the cleanup thread.
}

/// Long-running thread releasing the resources of exited threads.
fn cleanup_loop() {
    loop {
        EXIT_COUNT.p();
        EXIT_MUTEX.p();
        let tcb = interrupts::with_disabled(|| {
            scheduler::with_cpu(|cpu| {
                cpu.exited.pop_front(&mut cpu.threads).map(|t| {
                    cpu.thread_count -= 1;
                    cpu.threads.remove(t)
                })
            })
        });
        EXIT_MUTEX.v();
        if let Some(mut tcb) = tcb {
            if let Some(cwd) = tcb.cwd_inode.take() {
                crate::fs::release_cwd(cwd);
            }
            if let Some(handle) = tcb.join.take() {
                let _ = handle.join();
            }
            log::trace!("[task] reclaimed thread {}", tcb.id);
        }
    }
}

/// Bring up the scheduler, idle thread, and cleanup thread.
pub(crate) fn init(stack_size: usize) {
    scheduler::init(stack_size);
    fork(cleanup_loop).expect("failed to start cleanup thread");
}

/// Working directory of the running thread (inode number).
pub(crate) fn cwd() -> u64 {
    interrupts::with_disabled(|| scheduler::with_cpu(|cpu| cpu.threads.get(current()).cwd))
}

/// Replace the running thread's working directory, returning the
/// previously cached inode (if any) for the caller to release.
pub(crate) fn swap_cwd(
    inum: u64,
    inode: Option<crate::fs::inode::InodeHandle>,
) -> Option<crate::fs::inode::InodeHandle> {
    interrupts::with_disabled(|| {
        scheduler::with_cpu(|cpu| {
            let t = cpu.threads.get_mut(current());
            t.cwd = inum;
            std::mem::replace(&mut t.cwd_inode, inode)
        })
    })
}

/// Ticks since boot; re-exported here because the quantum lives with the
/// scheduler conceptually.
pub fn ticks() -> u64 {
    clock::ticks()
}
