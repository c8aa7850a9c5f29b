//! Timer wheel: a min-heap of callbacks keyed by absolute expiration.
//!
//! Grounded on `TimerManager`'s `std::map<TimerId, Timer>` (iteration order
//! sorted by insertion key there; here sorted by expiration via a binary
//! heap) and its `resetTimerfd`/`handleRead` expire-and-reschedule cycle —
//! reimplemented around the reactor's own poll timeout rather than a
//! `timerfd`, per the Reactor abstraction called for in the design notes.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Opaque handle returned by `add_timer`/`add_periodic`, usable with `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub type TimerCallback = Box<dyn FnMut() + Send>;

struct Entry {
    id: TimerId,
    expires_at: Instant,
    /// `Some(interval)` for periodic timers, re-armed after firing.
    interval: Option<Duration>,
    callback: TimerCallback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest expiration sorts first.
        other.expires_at.cmp(&self.expires_at)
    }
}

#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    cancelled: std::collections::HashSet<TimerId>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> TimerId {
        self.next_id += 1;
        TimerId(self.next_id)
    }

    pub fn add_timer(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.alloc_id();
        self.heap.push(Entry {
            id,
            expires_at: Instant::now() + delay,
            interval: None,
            callback,
        });
        id
    }

    pub fn add_periodic(&mut self, delay: Duration, interval: Duration, callback: TimerCallback) -> TimerId {
        let id = self.alloc_id();
        self.heap.push(Entry {
            id,
            expires_at: Instant::now() + delay,
            interval: Some(interval),
            callback,
        });
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// How long until the next live timer fires, if any. Used as the
    /// reactor's poll timeout — mirrors `resetTimerfd`'s
    /// `max(1ms, nextExpire - now)` computation.
    pub fn next_timeout(&mut self) -> Option<Duration> {
        self.drop_cancelled_heads();
        self.heap.peek().map(|e| {
            e.expires_at
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1))
        })
    }

    fn drop_cancelled_heads(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.contains(&top.id) {
                let entry = self.heap.pop().unwrap();
                self.cancelled.remove(&entry.id);
            } else {
                break;
            }
        }
    }

    /// Fire every timer whose expiration has passed, re-arming periodic
    /// ones. Returns the number of callbacks fired.
    pub fn fire_expired(&mut self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        let mut to_rearm = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.expires_at > now {
                break;
            }
            let mut entry = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            (entry.callback)();
            fired += 1;
            if let Some(interval) = entry.interval {
                entry.expires_at = now + interval;
                to_rearm.push(entry);
            }
        }
        for entry in to_rearm {
            self.heap.push(entry);
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[test]
    fn fires_in_expiration_order() {
        let mut wheel = TimerWheel::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        wheel.add_timer(Duration::from_millis(20), Box::new(move || o1.lock().unwrap().push(2)));
        let o2 = order.clone();
        wheel.add_timer(Duration::from_millis(1), Box::new(move || o2.lock().unwrap().push(1)));

        std::thread::sleep(Duration::from_millis(30));
        wheel.fire_expired();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn periodic_rearms() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        wheel.add_periodic(Duration::from_millis(1), Duration::from_millis(1), Box::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        }));

        std::thread::sleep(Duration::from_millis(5));
        wheel.fire_expired();
        let first = count.load(AtomicOrdering::SeqCst);
        assert_eq!(first, 1);

        std::thread::sleep(Duration::from_millis(5));
        wheel.fire_expired();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = wheel.add_timer(Duration::from_millis(1), Box::new(move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        wheel.cancel(id);
        std::thread::sleep(Duration::from_millis(5));
        wheel.fire_expired();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }
}
