//! Thread, scheduler, semaphore, sleep, and alarm scenarios.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use minios_kernel::machine::clock;
use minios_kernel::sync::{Mutex, Semaphore};
use minios_kernel::{alarm, task, Config};

fn scenario<R, F>(f: F) -> R
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    common::run_scenario(Config::default(), f)
}

#[test]
fn three_threads_interleave_with_yields() {
    let output = scenario(|| {
        let log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Semaphore::new(0));
        for name in ["Thread 1", "Thread 2", "Thread 3"] {
            let log = log.clone();
            let done = done.clone();
            task::fork(move || {
                log.lock().push(name);
                task::yield_now();
                done.v();
            })
            .unwrap();
        }
        for _ in 0..3 {
            done.p();
        }
        let out = log.lock().clone();
        out
    });
    assert_eq!(output.len(), 3);
    for name in ["Thread 1", "Thread 2", "Thread 3"] {
        assert_eq!(output.iter().filter(|s| **s == name).count(), 1, "{name}");
    }
}

#[test]
fn busy_threads_are_preempted() {
    // Three spinners that never enter the kernel each make progress.
    scenario(|| {
        let stop = Arc::new(AtomicBool::new(false));
        let counters: Vec<Arc<AtomicU64>> =
            (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();
        for counter in &counters {
            let counter = counter.clone();
            let stop = stop.clone();
            task::fork(move || {
                while !stop.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
        }
        task::sleep_ms(500);
        stop.store(true, Ordering::Relaxed);
        for (i, counter) in counters.iter().enumerate() {
            assert!(
                counter.load(Ordering::Relaxed) >= 3,
                "spinner {i} starved without cooperating"
            );
        }
    });
}

#[test]
fn semaphore_ping_pong_counts_exactly() {
    let total = scenario(|| {
        let count = Arc::new(AtomicU64::new(0));
        let ping = Arc::new(Semaphore::new(1));
        let pong = Arc::new(Semaphore::new(0));
        let done = Arc::new(Semaphore::new(0));
        const LIMIT: u64 = 10_000;

        let side = |take: Arc<Semaphore>, give: Arc<Semaphore>| {
            let count = count.clone();
            let done = done.clone();
            move || {
                loop {
                    take.p();
                    let seen = count.load(Ordering::Relaxed);
                    if seen >= LIMIT {
                        give.v();
                        break;
                    }
                    // Strict alternation: the value may only have moved by
                    // our partner since we last held the ball.
                    count.store(seen + 1, Ordering::Relaxed);
                    give.v();
                }
                done.v();
            }
        };
        task::fork(side(ping.clone(), pong.clone())).unwrap();
        task::fork(side(pong, ping)).unwrap();
        done.p();
        done.p();
        count.load(Ordering::Relaxed)
    });
    assert_eq!(total, 10_000);
}

#[test]
fn bounded_buffer_preserves_order() {
    const ITEMS: u64 = 1_000;
    const CAP: i64 = 16;
    let received = scenario(|| {
        let buffer = Arc::new(Mutex::new(std::collections::VecDeque::new()));
        let empty = Arc::new(Semaphore::new(CAP));
        let full = Arc::new(Semaphore::new(0));
        let done = Arc::new(Semaphore::new(0));

        {
            let buffer = buffer.clone();
            let empty = empty.clone();
            let full = full.clone();
            task::fork(move || {
                for i in 1..=ITEMS {
                    empty.p();
                    buffer.lock().push_back(i);
                    full.v();
                }
            })
            .unwrap();
        }
        let out = Arc::new(Mutex::new(Vec::new()));
        {
            let buffer = buffer.clone();
            let out = out.clone();
            let done = done.clone();
            task::fork(move || {
                for _ in 0..ITEMS {
                    full.p();
                    let item = buffer.lock().pop_front().unwrap();
                    empty.v();
                    out.lock().push(item);
                }
                done.v();
            })
            .unwrap();
        }
        done.p();
        let v = out.lock().clone();
        v
    });
    assert_eq!(received, (1..=ITEMS).collect::<Vec<_>>());
}

#[test]
fn sleepers_wake_in_delay_order_and_not_early() {
    let wakes = scenario(|| {
        let start = clock::ticks();
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Semaphore::new(0));
        for delay in [0u64, 2_000, 1_000] {
            let order = order.clone();
            let done = done.clone();
            task::fork(move || {
                task::sleep_ms(delay);
                order.lock().push((delay, clock::ticks()));
                done.v();
            })
            .unwrap();
        }
        for _ in 0..3 {
            done.p();
        }
        let v = order.lock().clone();
        (start, v)
    });
    let (start, order) = wakes;
    let delays: Vec<u64> = order.iter().map(|(d, _)| *d).collect();
    assert_eq!(delays, vec![0, 1_000, 2_000]);
    for (delay, woke_at) in order {
        // Within one quantum of tolerance.
        assert!(
            woke_at + 1 >= start + clock::ticks_for_ms(delay),
            "slept {delay}ms but woke after {} ticks",
            woke_at - start
        );
    }
}

#[test]
fn alarms_fire_in_delay_order() {
    let order = scenario(|| {
        let fired = Arc::new(Mutex::new(Vec::new()));
        for delay in [500u64, 2_000, 100] {
            let fired = fired.clone();
            alarm::register(delay, move || fired.lock().push(delay));
        }
        task::sleep_ms(2_500);
        let v = fired.lock().clone();
        v
    });
    assert_eq!(order, vec![100, 500, 2_000]);
}

#[test]
fn deregistered_alarm_never_fires() {
    let order = scenario(|| {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut middle = None;
        for delay in [500u64, 2_000, 100] {
            let fired = fired.clone();
            let id = alarm::register(delay, move || fired.lock().push(delay));
            if delay == 500 {
                middle = Some(id);
            }
        }
        alarm::deregister(middle.unwrap());
        alarm::deregister(middle.unwrap()); // idempotent
        task::sleep_ms(2_500);
        let v = fired.lock().clone();
        v
    });
    assert_eq!(order, vec![100, 2_000]);
}

#[test]
fn semaphore_wakes_waiters_in_fifo_order() {
    let (entered, woken) = scenario(|| {
        let target = Arc::new(Semaphore::new(0));
        let entered = Arc::new(Mutex::new(Vec::new()));
        let woken = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Semaphore::new(0));
        for i in 0..5 {
            let target = target.clone();
            let entered = entered.clone();
            let woken = woken.clone();
            let done = done.clone();
            task::fork(move || {
                entered.lock().push(i);
                target.p();
                woken.lock().push(i);
                done.v();
            })
            .unwrap();
            // Let each waiter block before the next is created, so the
            // wait-queue order is known.
            task::sleep_ms(30);
        }
        for _ in 0..5 {
            target.v();
        }
        for _ in 0..5 {
            done.p();
        }
        let e = entered.lock().clone();
        let w = woken.lock().clone();
        (e, w)
    });
    assert_eq!(entered, vec![0, 1, 2, 3, 4]);
    assert_eq!(woken, entered, "waiters must be released in enqueue order");
}

#[test]
fn thread_ids_are_unique_and_monotonic() {
    let ids = scenario(|| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Semaphore::new(0));
        for _ in 0..5 {
            let seen = seen.clone();
            let done = done.clone();
            task::fork(move || {
                seen.lock().push(task::current_id());
                done.v();
            })
            .unwrap();
        }
        for _ in 0..5 {
            done.p();
        }
        let v = seen.lock().clone();
        v
    });
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 5, "duplicate thread ids: {ids:?}");
}
