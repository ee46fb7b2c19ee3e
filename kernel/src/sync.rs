//! Counting semaphores, integrated with the scheduler.
//!
//! P spins on the semaphore's test-and-set lock, decrements, and if the
//! count went negative appends the caller to the wait queue and atomically
//! releases the lock while blocking. V increments and starts the longest
//! waiter. Waiters are released in FIFO order.
//!
//! V is safe from any host thread (interrupt context included); P may only
//! be called from a minithread. Never call either while holding the
//! interrupt gate: the semaphore takes its own lock first, then the gate.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::machine::interrupts;
use crate::machine::tas::TasLock;
use crate::queue::Fifo;
use crate::task;

struct SemInner {
    count: i64,
    wait: Fifo,
}

/// Counting semaphore. Destroying one with waiters present is undefined
/// (caller responsibility), as in any kernel.
pub struct Semaphore {
    inner: TasLock<SemInner>,
}

impl Semaphore {
    pub const fn new(count: i64) -> Self {
        Semaphore { inner: TasLock::new(SemInner { count, wait: Fifo::new() }) }
    }

    /// Decrement; block until the count permits entry.
    pub fn p(&self) {
        let mut g = self.inner.lock();
        g.count -= 1;
        if g.count < 0 {
            let level = interrupts::disable();
            let me = task::current();
            task::scheduler::with_cpu(|cpu| g.wait.push_back(&mut cpu.threads, me));
            task::unlock_and_stop(g);
            interrupts::restore(level);
        }
    }

    /// Increment; wake the longest waiter if any.
    pub fn v(&self) {
        let mut g = self.inner.lock();
        g.count += 1;
        if g.count <= 0 {
            let level = interrupts::disable();
            let woken = task::scheduler::with_cpu(|cpu| g.wait.pop_front(&mut cpu.threads));
            if let Some(t) = woken {
                task::scheduler::make_ready_locked(t);
            }
            interrupts::restore(level);
        }
    }

    /// Decrement without blocking. Returns false if it would have blocked.
    pub fn try_p(&self) -> bool {
        let mut g = self.inner.lock();
        if g.count > 0 {
            g.count -= 1;
            true
        } else {
            false
        }
    }
}

/// Mutual exclusion over `T`, built on a binary semaphore.
///
/// Unlike a spin lock, holders may block (on the disk, on the network, on
/// another semaphore) while waiters queue FIFO behind them.
pub struct Mutex<T> {
    sem: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Mutex { sem: Semaphore::new(1), data: UnsafeCell::new(data) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.sem.p();
        MutexGuard { mutex: self }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.sem.v();
    }
}
