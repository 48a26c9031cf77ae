// src/net/timer.rs - Shared timer handles and the loop's timer table
//
// A timer is shared between the loop (one reference held by the table while
// scheduled) and any number of external holders. External mutation
// (cancel/again) is routed through the loop's task queue, so every table
// mutation is serialized on the loop thread; `next_ms == 0` is equivalent to
// "absent from the table" from the loop thread's point of view.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::net::event_loop::Shared;

/// Ordered multimap of scheduled timers. Equal fire times are disambiguated
/// by the per-timer id, preserving insertion order among them.
pub(crate) type TimerTable = BTreeMap<(u64, u64), Arc<TimerInner>>;

pub(crate) struct TimerInner {
    pub id: u64,
    /// Absolute fire time in the loop clock; 0 when unscheduled.
    pub next_ms: AtomicU64,
    /// 0 for one-shot timers.
    pub repeat_ms: AtomicU64,
    pub callback: Mutex<Box<dyn FnMut(u64) + Send>>,
    pub owner: Weak<Shared>,
}

/// Handle to a timer created by an event loop.
///
/// Cloning the handle shares the same underlying timer. Dropping every
/// handle while the timer is still scheduled leaves the table's reference in
/// charge; the callback state is released when the last reference goes away.
#[derive(Clone)]
pub struct Timer {
    pub(crate) inner: Arc<TimerInner>,
}

impl Timer {
    /// Stop firing: remove from the table and clear the repeat interval.
    /// Takes effect when the loop executes the scheduled task, not
    /// instantaneously.
    pub fn cancel(&self) {
        let Some(shared) = self.inner.owner.upgrade() else {
            return;
        };
        let inner = self.inner.clone();
        Shared::dispatch(&shared, move |_| {
            let Some(shared) = inner.owner.upgrade() else {
                return;
            };
            let mut table = shared.timers.lock().unwrap();
            inner.repeat_ms.store(0, Ordering::Release);
            unschedule(&mut table, &inner);
        });
    }

    /// Drop the current schedule and re-arm `delay` from now. The repeat
    /// interval, if any, is kept.
    pub fn again(&self, delay: Duration) {
        let Some(shared) = self.inner.owner.upgrade() else {
            return;
        };
        let at = Shared::cached_now(&shared) + delay.as_millis() as u64;
        let inner = self.inner.clone();
        Shared::dispatch(&shared, move |_| {
            let Some(shared) = inner.owner.upgrade() else {
                return;
            };
            let mut table = shared.timers.lock().unwrap();
            unschedule(&mut table, &inner);
            schedule(&mut table, &inner, at);
        });
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.next_ms.load(Ordering::Acquire) != 0
    }

    pub fn repeat(&self) -> Duration {
        Duration::from_millis(self.inner.repeat_ms.load(Ordering::Acquire))
    }
}

/// Remove `inner` from the table if scheduled and zero its fire time.
pub(crate) fn unschedule(table: &mut TimerTable, inner: &Arc<TimerInner>) {
    let next = inner.next_ms.swap(0, Ordering::AcqRel);
    if next != 0 {
        table.remove(&(next, inner.id));
    }
}

/// Insert `inner` at the absolute fire time `at_ms`.
pub(crate) fn schedule(table: &mut TimerTable, inner: &Arc<TimerInner>, at_ms: u64) {
    // 0 is the unscheduled sentinel; an at-epoch fire time never occurs in
    // practice but must not corrupt the table invariant
    let at_ms = at_ms.max(1);
    inner.next_ms.store(at_ms, Ordering::Release);
    table.insert((at_ms, inner.id), inner.clone());
}

/// Detach and return every timer due at `now_ms`, earliest first.
pub(crate) fn pop_due(table: &mut TimerTable, now_ms: u64) -> Vec<Arc<TimerInner>> {
    let mut due = Vec::new();
    while let Some(entry) = table.first_entry() {
        if entry.key().0 > now_ms {
            break;
        }
        due.push(entry.remove());
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(id: u64) -> Arc<TimerInner> {
        Arc::new(TimerInner {
            id,
            next_ms: AtomicU64::new(0),
            repeat_ms: AtomicU64::new(0),
            callback: Mutex::new(Box::new(|_| {})),
            owner: Weak::new(),
        })
    }

    #[test]
    fn test_schedule_and_pop_order() {
        let mut table = TimerTable::new();
        let a = inner(1);
        let b = inner(2);
        let c = inner(3);
        schedule(&mut table, &a, 300);
        schedule(&mut table, &b, 100);
        schedule(&mut table, &c, 200);

        let due = pop_due(&mut table, 250);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, 2);
        assert_eq!(due[1].id, 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_equal_fire_times_coexist() {
        let mut table = TimerTable::new();
        let a = inner(1);
        let b = inner(2);
        schedule(&mut table, &a, 100);
        schedule(&mut table, &b, 100);
        assert_eq!(table.len(), 2);

        let due = pop_due(&mut table, 100);
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn test_unschedule_clears_next() {
        let mut table = TimerTable::new();
        let a = inner(7);
        schedule(&mut table, &a, 500);
        assert_eq!(a.next_ms.load(Ordering::Acquire), 500);

        unschedule(&mut table, &a);
        assert_eq!(a.next_ms.load(Ordering::Acquire), 0);
        assert!(table.is_empty());

        // Unscheduling an unscheduled timer is a no-op
        unschedule(&mut table, &a);
        assert!(table.is_empty());
    }

    #[test]
    fn test_pop_due_ignores_future() {
        let mut table = TimerTable::new();
        let a = inner(1);
        schedule(&mut table, &a, 1000);
        assert!(pop_due(&mut table, 999).is_empty());
        assert_eq!(table.len(), 1);
    }
}
