//! Per-worker timer queue.
//!
//! A binary min-heap keyed by absolute deadline. Cancellation removes the
//! entry from the live set and leaves its heap slot behind as a tombstone;
//! tombstones are reclaimed lazily once they surface at the top of the heap.

use std::cmp::{Ordering, Reverse};
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::{PoolError, Result};
use crate::job::Liveness;
use crate::worker::WorkerContext;

/// Callback run on the owning worker when a timer fires.
pub type TimerCallback = Box<dyn FnMut(&mut WorkerContext) + Send>;

/// Identifies a scheduled timer. Unique for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// A scheduled callback, owned by the worker that created it.
pub struct TimerEntry {
    handle: TimerHandle,
    deadline: Instant,
    repeat: Option<Duration>,
    owner: Option<Liveness>,
    callback: TimerCallback,
}

impl TimerEntry {
    pub fn handle(&self) -> TimerHandle {
        self.handle
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat.is_some()
    }

    /// False once the owning session (if any) has gone away.
    pub fn is_live(&self) -> bool {
        self.owner.as_ref().is_none_or(Liveness::is_alive)
    }

    pub(crate) fn fire(&mut self, cx: &mut WorkerContext) {
        (self.callback)(cx);
    }
}

impl std::fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("handle", &self.handle)
            .field("deadline", &self.deadline)
            .field("repeat", &self.repeat)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    deadline: Instant,
    seq: u64,
    handle: TimerHandle,
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered set of timers for one worker. Not thread-safe; cross-thread
/// requests reach it as queued work items.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Slot>>,
    live: HashMap<TimerHandle, TimerEntry>,
    // Repeating timers popped for firing and not yet re-armed.
    firing: HashSet<TimerHandle>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` at `deadline`, then every `repeat` if given.
    ///
    /// A zero repeat interval is rejected. Deadlines in the past fire on the
    /// next loop tick. Scheduling an existing handle replaces it.
    pub fn schedule(
        &mut self,
        handle: TimerHandle,
        deadline: Instant,
        repeat: Option<Duration>,
        owner: Option<Liveness>,
        callback: TimerCallback,
    ) -> Result<TimerHandle> {
        if repeat.is_some_and(|interval| interval.is_zero()) {
            return Err(PoolError::InvalidInterval);
        }
        self.insert(TimerEntry {
            handle,
            deadline,
            repeat,
            owner,
            callback,
        });
        Ok(handle)
    }

    fn insert(&mut self, entry: TimerEntry) {
        self.seq += 1;
        self.heap.push(Reverse(Slot {
            deadline: entry.deadline,
            seq: self.seq,
            handle: entry.handle,
        }));
        self.live.insert(entry.handle, entry);
    }

    /// Cancel a timer. Returns `true` if it was pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle).is_some() || self.firing.remove(&handle)
    }

    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.live.contains_key(&handle) || self.firing.contains(&handle)
    }

    /// Number of pending timers, tombstones excluded.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Deadline of the earliest pending timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.reclaim_tombstones();
        self.heap.peek().map(|Reverse(slot)| slot.deadline)
    }

    /// Remove and return the earliest timer due at `now`.
    ///
    /// Timers are handed out one at a time so a callback can still cancel
    /// another timer due in the same tick. Repeating timers must be handed
    /// back through [`TimerQueue::rearm`] after firing.
    pub fn pop_next_due(&mut self, now: Instant) -> Option<TimerEntry> {
        loop {
            self.reclaim_tombstones();
            match self.heap.peek() {
                Some(Reverse(slot)) if slot.deadline <= now => {}
                _ => return None,
            }
            let Reverse(slot) = self.heap.pop()?;
            if let Some(entry) = self.live.remove(&slot.handle) {
                if entry.is_repeating() {
                    self.firing.insert(entry.handle);
                }
                return Some(entry);
            }
        }
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        std::iter::from_fn(|| self.pop_next_due(now)).collect()
    }

    /// Put a fired repeating timer back, unless it was cancelled while it
    /// was out of the queue or its owner died.
    pub fn rearm(&mut self, mut entry: TimerEntry, now: Instant) {
        if !self.firing.remove(&entry.handle) || !entry.is_live() {
            return;
        }
        let Some(interval) = entry.repeat else {
            return;
        };
        let next = entry.deadline + interval;
        entry.deadline = if next > now { next } else { now + interval };
        if let Entry::Vacant(_) = self.live.entry(entry.handle) {
            self.insert(entry);
        }
    }

    fn reclaim_tombstones(&mut self) {
        while let Some(Reverse(slot)) = self.heap.peek() {
            match self.live.get(&slot.handle) {
                Some(entry) if entry.deadline == slot.deadline => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.live.len())
            .field("slots", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::LivenessGuard;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    fn handles(entries: &[TimerEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.handle().as_raw()).collect()
    }

    #[test]
    fn pops_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        for (raw, ms) in [(1, 30), (2, 10), (3, 20)] {
            timers
                .schedule(
                    TimerHandle::from_raw(raw),
                    now + Duration::from_millis(ms),
                    None,
                    None,
                    noop(),
                )
                .unwrap();
        }

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        let due = timers.pop_due(now + Duration::from_millis(25));
        assert_eq!(handles(&due), vec![2, 3]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let at = Instant::now();
        let mut timers = TimerQueue::new();
        for raw in [5, 3, 9] {
            timers
                .schedule(TimerHandle::from_raw(raw), at, None, None, noop())
                .unwrap();
        }
        assert_eq!(handles(&timers.pop_due(at)), vec![5, 3, 9]);
    }

    #[test]
    fn never_pops_early() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers
            .schedule(
                TimerHandle::from_raw(1),
                now + Duration::from_millis(5),
                None,
                None,
                noop(),
            )
            .unwrap();
        assert!(timers.pop_due(now).is_empty());
        assert_eq!(timers.pop_due(now + Duration::from_millis(5)).len(), 1);
    }

    #[test]
    fn past_deadline_is_due_immediately() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers
            .schedule(TimerHandle::from_raw(1), now, None, None, noop())
            .unwrap();
        assert_eq!(timers.pop_due(now + Duration::from_millis(1)).len(), 1);
    }

    #[test]
    fn cancel_leaves_tombstone_until_top() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        for raw in 1..=3 {
            timers
                .schedule(
                    TimerHandle::from_raw(raw),
                    now + Duration::from_millis(raw * 10),
                    None,
                    None,
                    noop(),
                )
                .unwrap();
        }

        assert!(timers.cancel(TimerHandle::from_raw(2)));
        assert!(!timers.cancel(TimerHandle::from_raw(2)));
        assert_eq!(timers.len(), 2);
        assert_eq!(timers.heap_len(), 3);

        let due = timers.pop_due(now + Duration::from_millis(100));
        assert_eq!(handles(&due), vec![1, 3]);
        assert_eq!(timers.heap_len(), 0);
    }

    #[test]
    fn cancelled_head_is_reclaimed_by_next_deadline() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers
            .schedule(TimerHandle::from_raw(1), now, None, None, noop())
            .unwrap();
        timers
            .schedule(
                TimerHandle::from_raw(2),
                now + Duration::from_secs(1),
                None,
                None,
                noop(),
            )
            .unwrap();
        timers.cancel(TimerHandle::from_raw(1));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(timers.heap_len(), 1);
    }

    #[test]
    fn cancel_between_pops_wins() {
        let at = Instant::now();
        let mut timers = TimerQueue::new();
        for raw in [1, 2] {
            timers
                .schedule(TimerHandle::from_raw(raw), at, None, None, noop())
                .unwrap();
        }
        let first = timers.pop_next_due(at).unwrap();
        assert_eq!(first.handle().as_raw(), 1);
        assert!(timers.cancel(TimerHandle::from_raw(2)));
        assert!(timers.pop_next_due(at).is_none());
    }

    #[test]
    fn zero_repeat_is_rejected() {
        let mut timers = TimerQueue::new();
        let err = timers
            .schedule(
                TimerHandle::from_raw(1),
                Instant::now(),
                Some(Duration::ZERO),
                None,
                noop(),
            )
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidInterval));
        assert!(timers.is_empty());
    }

    #[test]
    fn repeating_timer_rearms_from_previous_deadline() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut timers = TimerQueue::new();
        timers
            .schedule(TimerHandle::from_raw(7), start, Some(interval), None, noop())
            .unwrap();

        let mut due = timers.pop_due(start);
        assert_eq!(due.len(), 1);
        timers.rearm(due.remove(0), start + Duration::from_millis(1));
        assert_eq!(timers.next_deadline(), Some(start + interval));
    }

    #[test]
    fn late_repeating_timer_skips_missed_periods() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut timers = TimerQueue::new();
        timers
            .schedule(TimerHandle::from_raw(7), start, Some(interval), None, noop())
            .unwrap();

        let late = start + Duration::from_millis(45);
        let mut due = timers.pop_due(late);
        timers.rearm(due.remove(0), late);
        assert_eq!(timers.next_deadline(), Some(late + interval));
    }

    #[test]
    fn cancel_while_firing_prevents_rearm() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        let handle = TimerHandle::from_raw(3);
        timers
            .schedule(handle, start, Some(Duration::from_millis(5)), None, noop())
            .unwrap();

        let mut due = timers.pop_due(start);
        assert!(timers.contains(handle));
        assert!(timers.cancel(handle));
        timers.rearm(due.remove(0), start);
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn dead_owner_is_not_rearmed() {
        let start = Instant::now();
        let guard = LivenessGuard::new();
        let mut timers = TimerQueue::new();
        timers
            .schedule(
                TimerHandle::from_raw(1),
                start,
                Some(Duration::from_millis(5)),
                Some(guard.token()),
                noop(),
            )
            .unwrap();

        let mut due = timers.pop_due(start);
        guard.revoke();
        assert!(!due[0].is_live());
        timers.rearm(due.remove(0), start);
        assert!(timers.is_empty());
    }
}
