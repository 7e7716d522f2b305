//! Timer wheel (component K).
//!
//! A monotonic-time-keyed priority queue of scheduled callbacks. Granularity
//! is milliseconds. Firing is at-least-once-per-deadline: `fire_due` may fire
//! a deadline after its target time if `Agent::loop_once` is called late, but
//! never before it, and never more than once per handle.
//!
//! This is the only place retransmit timers, registration refresh, ICE
//! keepalive, and RTCP interval callbacks are driven from — consistent with
//! spec §5's single call-site cooperative model. There is no teacher module
//! to generalize here: the teacher drives all of this through
//! `tokio::time::sleep`/`interval`, which the sync redesign cannot use.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Opaque handle returned by [`TimerWheel::schedule`], usable with
/// [`TimerWheel::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry {
    deadline_ms: u64,
    handle: TimerHandle,
    /// Monotonically increasing insertion sequence, used only to break ties
    /// deterministically (earliest-scheduled-first for identical deadlines).
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A callback scheduled to fire at or after a deadline.
pub struct TimerWheel<F> {
    heap: BinaryHeap<Entry>,
    callbacks: std::collections::HashMap<u64, F>,
    cancelled: std::collections::HashSet<u64>,
    next_id: u64,
    next_seq: u64,
}

impl<F> Default for TimerWheel<F> {
    fn default() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            callbacks: std::collections::HashMap::new(),
            cancelled: std::collections::HashSet::new(),
            next_id: 1,
            next_seq: 0,
        }
    }
}

impl<F> TimerWheel<F>
where
    F: FnMut(),
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` to run at `now_ms + delay_ms` or later.
    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64, callback: F) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.callbacks.insert(id, callback);
        self.heap.push(Entry {
            deadline_ms: now_ms.saturating_add(delay_ms),
            handle: TimerHandle(id),
            seq,
        });
        TimerHandle(id)
    }

    /// Cancel a previously scheduled timer. A no-op if it already fired or
    /// was already cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.cancelled.insert(handle.0);
        self.callbacks.remove(&handle.0);
    }

    /// Fire every timer whose deadline is `<= now_ms`, in deadline order.
    /// Returns the number of callbacks invoked.
    pub fn fire_due(&mut self, now_ms: u64) -> usize {
        let mut fired = 0;
        while let Some(top) = self.heap.peek() {
            if top.deadline_ms > now_ms {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry exists");
            if self.cancelled.remove(&entry.handle.0) {
                continue;
            }
            if let Some(mut cb) = self.callbacks.remove(&entry.handle.0) {
                cb();
                fired += 1;
            }
        }
        fired
    }

    /// True if no timer is currently scheduled.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Cancel every outstanding timer without firing it. Used by
    /// `Agent::stop`.
    pub fn cancel_all(&mut self) {
        self.heap.clear();
        self.callbacks.clear();
        self.cancelled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel: TimerWheel<Box<dyn FnMut()>> = TimerWheel::new();
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));

        let o1 = order.clone();
        wheel.schedule(0, 200, Box::new(move || o1.borrow_mut().push("late")));
        let o2 = order.clone();
        wheel.schedule(0, 50, Box::new(move || o2.borrow_mut().push("early")));

        assert_eq!(wheel.fire_due(60), 1);
        assert_eq!(*order.borrow(), vec!["early"]);
        assert_eq!(wheel.fire_due(200), 1);
        assert_eq!(*order.borrow(), vec!["early", "late"]);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut wheel: TimerWheel<Box<dyn FnMut()>> = TimerWheel::new();
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let f = fired.clone();
        let handle = wheel.schedule(0, 10, Box::new(move || f.set(true)));
        wheel.cancel(handle);
        wheel.fire_due(1000);
        assert!(!fired.get());
    }

    #[test]
    fn late_loop_call_still_fires_before_going_idle() {
        let mut wheel: TimerWheel<Box<dyn FnMut()>> = TimerWheel::new();
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let f = fired.clone();
        wheel.schedule(0, 10, Box::new(move || f.set(true)));
        // Simulate a late `loop` call arriving well past the deadline.
        wheel.fire_due(10_000);
        assert!(fired.get());
        assert!(wheel.is_empty());
    }
}
