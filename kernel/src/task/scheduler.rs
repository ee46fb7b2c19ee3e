//! The single virtual CPU and the multilevel-feedback scheduler.
//!
//! All scheduler state lives in one `Cpu` structure guarded by the
//! interrupt gate; every function here expects the gate to be held unless
//! noted. Dispatching a thread means unparking its host thread; giving up
//! the CPU means parking. The handoff window where the outgoing thread
//! executes only its own `park()` call is the one tolerated overlap.

use core::cell::{Cell, UnsafeCell};
use std::sync::Arc;

use super::thread::{Status, Tcb, ThreadSlab, Tid, IDLE, MAX_PRIORITY, QUANTA};
use crate::machine::park::ParkToken;
use crate::machine::{clock, interrupts};
use crate::multilevel::MultilevelQueue;
use crate::queue::Fifo;
use crate::sync::Semaphore;

pub(crate) struct Cpu {
    pub threads: ThreadSlab,
    pub ready: MultilevelQueue,
    pub exited: Fifo,
    pub running: Tid,
    /// Tick at which the running thread's quantum ends.
    pub expire: u64,
    pub thread_count: u32,
    pub next_id: u32,
}

struct CpuCell(UnsafeCell<Option<Cpu>>);

// Access is serialised by the interrupt gate.
unsafe impl Sync for CpuCell {}

static CPU: CpuCell = CpuCell(UnsafeCell::new(None));

thread_local! {
    /// Slot of the minithread bound to this host thread, if any.
    static CURRENT: Cell<Tid> = const { Cell::new(Tid::MAX) };
}

/// Run `f` against the CPU state. The caller must hold the interrupt gate.
pub(crate) fn with_cpu<R>(f: impl FnOnce(&mut Cpu) -> R) -> R {
    debug_assert!(interrupts::owned_by_me());
    unsafe { f((*CPU.0.get()).as_mut().expect("scheduler not initialized")) }
}

fn with_cpu_opt<R>(f: impl FnOnce(&mut Cpu) -> R) -> Option<R> {
    debug_assert!(interrupts::owned_by_me());
    unsafe { (*CPU.0.get()).as_mut().map(f) }
}

pub(crate) fn set_current(t: Tid) {
    CURRENT.with(|c| c.set(t));
}

/// Slot of the calling minithread. Panics on a host thread that is not a
/// minithread.
pub(crate) fn current() -> Tid {
    let t = CURRENT.with(|c| c.get());
    assert!(t != Tid::MAX, "not called from a minithread");
    t
}

pub(crate) fn is_minithread() -> bool {
    CURRENT.with(|c| c.get()) != Tid::MAX
}

/// Bring up the scheduler: the CPU state and the idle thread (slot 0).
pub(crate) fn init(stack_size: usize) {
    let level = interrupts::disable();
    unsafe {
        let cpu = &mut *CPU.0.get();
        assert!(cpu.is_none(), "scheduler already initialized");
        *cpu = Some(Cpu {
            threads: ThreadSlab::new(),
            ready: MultilevelQueue::new(MAX_PRIORITY + 1),
            exited: Fifo::new(),
            running: IDLE,
            expire: 0,
            thread_count: 1,
            next_id: 1,
        });
    }
    let park = Arc::new(ParkToken::new());
    let sleep_sem = Arc::new(Semaphore::new(0));
    let slot = with_cpu(|cpu| {
        let mut t = Tcb::new(0, park, sleep_sem);
        t.status = Status::Running;
        t.priority = MAX_PRIORITY;
        cpu.threads.insert(t)
    });
    debug_assert_eq!(slot, IDLE);
    interrupts::restore(level);

    let handle = std::thread::Builder::new()
        .name("idle".into())
        .stack_size(stack_size)
        .spawn(|| {
            set_current(IDLE);
            loop {
                crate::machine::cpu_relax();
            }
        })
        .expect("failed to spawn idle thread");

    let level = interrupts::disable();
    with_cpu(|cpu| {
        let t = cpu.threads.get_mut(IDLE);
        t.pthread = std::os::unix::thread::JoinHandleExt::as_pthread_t(&handle);
        t.join = Some(handle);
    });
    interrupts::restore(level);
}

/// Pick the next thread to run, per the weighted multilevel policy:
/// the weight r = ticks mod 160 selects the starting level, the dequeue
/// wraps upward from there, and the quantum is that of the starting level.
fn pick_next(cpu: &mut Cpu) -> Tid {
    let now = clock::ticks();
    let r = now % 160;
    let start = if r < 80 {
        0
    } else if r < 120 {
        1
    } else if r < 144 {
        2
    } else {
        3
    };
    match cpu.ready.dequeue_from(&mut cpu.threads, start) {
        Some((t, _)) => {
            cpu.expire = now + QUANTA[start];
            t
        }
        None => {
            cpu.expire = now + 1;
            IDLE
        }
    }
}

/// Mark `t` ready and append it to its priority's queue. Gate held.
pub(crate) fn make_ready_locked(t: Tid) {
    with_cpu(|cpu| {
        let prio;
        {
            let tcb = cpu.threads.get_mut(t);
            debug_assert!(tcb.status != Status::Running && tcb.status != Status::Exited);
            tcb.status = Status::Ready;
            prio = tcb.priority;
        }
        cpu.ready.enqueue(&mut cpu.threads, prio, t);
    });
}

/// Switch to the next thread and block until this thread is dispatched
/// again. Gate held on entry; held again (same depth) on return.
pub(crate) fn schedule_and_park() {
    let me = current();
    let (next, next_park) = with_cpu(|cpu| {
        let next = pick_next(cpu);
        cpu.running = next;
        let t = cpu.threads.get_mut(next);
        t.status = Status::Running;
        (next, t.park.clone())
    });
    if next == me {
        return;
    }
    let my_park = with_cpu(|cpu| cpu.threads.get(me).park.clone());
    let depth = interrupts::release_all();
    next_park.unpark();
    my_park.park();
    interrupts::reacquire(depth);
}

/// Final switch of an exiting thread: dispatch the next thread and return
/// without parking, so the host thread can unwind. Gate consumed.
pub(crate) fn schedule_exit(level: interrupts::Level) {
    let next_park = with_cpu(|cpu| {
        let next = pick_next(cpu);
        debug_assert!(next != current());
        cpu.running = next;
        let t = cpu.threads.get_mut(next);
        t.status = Status::Running;
        t.park.clone()
    });
    let _ = interrupts::release_all();
    let _ = level;
    next_park.unpark();
}

/// Re-queue the running thread and switch, demoting it when its quantum
/// has expired. Gate held.
pub(crate) fn yield_locked() {
    let me = current();
    with_cpu(|cpu| {
        let expired = clock::ticks() >= cpu.expire;
        let prio;
        {
            let t = cpu.threads.get_mut(me);
            t.status = Status::Ready;
            if expired && t.priority < MAX_PRIORITY {
                t.priority += 1;
            }
            prio = t.priority;
        }
        if me != IDLE {
            cpu.ready.enqueue(&mut cpu.threads, prio, me);
        }
    });
    schedule_and_park();
}

/// Clock-thread side of preemption: if the running thread's quantum has
/// expired, signal its host thread.
pub(crate) fn quantum_tick() {
    let target = interrupts::with_disabled(|| {
        with_cpu_opt(|cpu| {
            if clock::ticks() >= cpu.expire {
                let t = cpu.threads.get(cpu.running);
                if t.pthread != 0 {
                    return Some(t.pthread);
                }
            }
            None
        })
        .flatten()
    });
    // Signalled outside the gate so the handler's non-blocking acquire
    // does not race this thread's release; the handler revalidates that
    // the quantum is still expired for the still-running thread.
    if let Some(p) = target {
        unsafe {
            libc::pthread_kill(p, crate::machine::PREEMPT_SIGNAL);
        }
    }
}

/// Signal-handler side of preemption. Runs on the interrupted thread.
/// Backs off when interrupts are disabled or the thread is inside a
/// test-and-set critical section; the clock retries next tick.
pub(crate) fn preempt_from_signal() {
    if !is_minithread() || crate::machine::tas::spinning_region() {
        return;
    }
    let Some(level) = interrupts::try_disable_from_signal() else {
        return;
    };
    let me = CURRENT.with(|c| c.get());
    let due = with_cpu_opt(|cpu| cpu.running == me && clock::ticks() >= cpu.expire)
        .unwrap_or(false);
    if due {
        yield_locked();
    }
    interrupts::restore(level);
}
