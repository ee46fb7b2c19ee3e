//! Tick-keyed alarms.
//!
//! Alarms are ordered by absolute fire tick; the clock drains every due
//! alarm on each tick. Callbacks run in clock context and must not block;
//! the canonical callback is `Semaphore::v`. Deregistering an alarm that
//! has already fired is a no-op.

use std::collections::BTreeMap;

use crate::machine::clock;
use crate::machine::tas::TasLock;

pub type AlarmId = u64;

type Callback = Box<dyn FnOnce() + Send>;

struct AlarmQueue {
    /// Pending alarms keyed by (fire tick, id): iteration order is fire
    /// order, with registration order breaking ties.
    due: BTreeMap<(u64, AlarmId), Callback>,
    /// id -> fire tick, for deregistration.
    ids: BTreeMap<AlarmId, u64>,
    next_id: AlarmId,
}

impl AlarmQueue {
    const fn new() -> Self {
        AlarmQueue { due: BTreeMap::new(), ids: BTreeMap::new(), next_id: 0 }
    }

    /// Queue `f` to fire at `fire` (always strictly in the future).
    fn insert(&mut self, fire: u64, f: Callback) -> AlarmId {
        let id = self.next_id;
        self.next_id += 1;
        self.due.insert((fire, id), f);
        self.ids.insert(id, fire);
        id
    }

    fn remove(&mut self, id: AlarmId) {
        if let Some(fire) = self.ids.remove(&id) {
            self.due.remove(&(fire, id));
        }
    }

    /// Detach every alarm due at or before `now`, in fire order.
    fn drain_due(&mut self, now: u64) -> Vec<Callback> {
        let mut ready = Vec::new();
        while let Some((&(fire, id), _)) = self.due.first_key_value() {
            if fire > now {
                break;
            }
            let cb = self.due.pop_first().expect("alarm vanished").1;
            self.ids.remove(&id);
            ready.push(cb);
        }
        ready
    }
}

static ALARMS: TasLock<AlarmQueue> = TasLock::new(AlarmQueue::new());

/// Register `f` to run `delay_ms` milliseconds from now (rounded up to
/// ticks, never the current tick). Returns the alarm id.
pub fn register(delay_ms: u64, f: impl FnOnce() + Send + 'static) -> AlarmId {
    let fire = clock::ticks() + clock::ticks_for_ms(delay_ms);
    ALARMS.lock().insert(fire, Box::new(f))
}

/// Remove a pending alarm. Unknown or already-fired ids are ignored.
pub fn deregister(id: AlarmId) {
    ALARMS.lock().remove(id);
}

/// Fire every alarm due at or before the current tick. Called by the
/// clock with interrupts enabled; callbacks run after the queue lock is
/// released.
pub(crate) fn fire_due() {
    let ready = ALARMS.lock().drain_due(clock::ticks());
    for cb in ready {
        cb();
    }
}
