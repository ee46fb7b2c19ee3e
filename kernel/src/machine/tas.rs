//! Test-and-set spin lock.
//!
//! The classic single-word lock the semaphore layer is built on. Acquiring
//! a `TasLock` also suppresses preemption on the holding thread until the
//! guard drops: the clock may signal a running thread at any point, and a
//! thread parked while holding a spin lock would stall every other spinner
//! until its next quantum.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    /// Number of TAS locks held by this thread. The preemption handler
    /// refuses to switch while this is non-zero.
    static HELD: Cell<u32> = const { Cell::new(0) };
}

/// True when the calling thread holds at least one TAS lock.
#[inline]
pub(crate) fn spinning_region() -> bool {
    HELD.with(|h| h.get() != 0)
}

/// A spin lock protecting data of type `T`, acquired via atomic
/// test-and-set and cleared via atomic store.
pub struct TasLock<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for TasLock<T> {}
unsafe impl<T: Send> Send for TasLock<T> {}

/// RAII guard for a held [`TasLock`]. Releases the lock on drop.
pub struct TasGuard<'a, T> {
    lock: &'a TasLock<T>,
}

impl<T> TasLock<T> {
    pub const fn new(data: T) -> Self {
        TasLock { lock: AtomicBool::new(false), data: UnsafeCell::new(data) }
    }

    /// Spin until the lock is acquired.
    pub fn lock(&self) -> TasGuard<'_, T> {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                crate::machine::cpu_relax();
            }
        }
        HELD.with(|h| h.set(h.get() + 1));
        TasGuard { lock: self }
    }

    /// Clear the lock without a guard in scope.
    ///
    /// Only meaningful together with [`TasGuard::forget`]; used by
    /// `unlock_and_stop` to release the word before blocking.
    pub(crate) fn raw_unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<'a, T> TasGuard<'a, T> {
    /// Release the lock word and the preemption suppression, but keep the
    /// borrow alive. The caller must not touch the data afterwards.
    pub(crate) fn release(self) -> &'a TasLock<T> {
        let lock = self.lock;
        core::mem::forget(self);
        HELD.with(|h| h.set(h.get() - 1));
        lock.raw_unlock();
        lock
    }
}

impl<T> Deref for TasGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TasGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TasGuard<'_, T> {
    fn drop(&mut self) {
        HELD.with(|h| h.set(h.get() - 1));
        self.lock.lock.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let l = TasLock::new(5u32);
        {
            let mut g = l.lock();
            *g += 1;
        }
        assert_eq!(*l.lock(), 6);
    }

    #[test]
    fn release_unlocks() {
        let l = TasLock::new(());
        let g = l.lock();
        let l2 = g.release();
        // Re-acquiring immediately must not spin.
        drop(l2.lock());
    }

    #[test]
    fn contention() {
        use std::sync::Arc;
        let l = Arc::new(TasLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = l.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *l.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*l.lock(), 40_000);
    }
}
