//! Timer bookkeeping for one execution context.
//!
//! The service never runs callbacks itself. The context loop asks it for the
//! earliest deadline, collects due handles with [`TimerService::take_due`] and
//! appends one firing per handle to its FIFO queue. When a firing reaches the
//! front of the queue the loop borrows the callback through
//! [`TimerService::begin_fire`], runs it, and hands it back with
//! [`TimerService::finish_fire`]. A timer cleared between those two points is
//! skipped.
//!
//! Only live timers are kept. A one-shot is forgotten once it starts firing
//! and any timer is forgotten once cleared, so a handle that is no longer
//! known is either finished or was never issued.

use crate::runtime::error::ContextError;
use crate::runtime::runner::ContextCore;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Shortest period a repeating timer may use.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Longest delay or period a timer may use; longer values are clamped.
pub const MAX_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// Opaque identifier of a scheduled timer.
///
/// Handles are unique across the process and carry no reference to engine
/// state, so they may be passed between threads freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// State of a live timer. Fired one-shots and cleared timers have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Pending,
    Repeating,
}

/// Callback run on the owning context thread each time a timer fires.
pub type TimerCallback = Box<dyn FnMut(&mut ContextCore, TimerHandle) -> Result<(), ContextError>>;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledFiring {
    deadline: Instant,
    seq: u64,
    handle: TimerHandle,
}

struct TimerEntry {
    period: Option<Duration>,
    callback: Option<TimerCallback>,
}

impl TimerEntry {
    fn state(&self) -> TimerState {
        match self.period {
            Some(_) => TimerState::Repeating,
            None => TimerState::Pending,
        }
    }
}

/// Stale heap slots tolerated before the queue is rebuilt.
const COMPACT_SLACK: usize = 64;

/// Registry of the timers owned by one context.
pub struct TimerService {
    seq: u64,
    queue: BinaryHeap<Reverse<ScheduledFiring>>,
    entries: HashMap<TimerHandle, TimerEntry>,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            seq: 0,
            queue: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    /// Schedule a single firing no earlier than `delay` after `now`.
    pub fn set_timeout(
        &mut self,
        now: Instant,
        delay: Duration,
        callback: TimerCallback,
    ) -> TimerHandle {
        self.insert(now + delay.min(MAX_DELAY), None, callback)
    }

    /// Schedule fixed-rate firings: the first at `now`, then every `period`.
    pub fn set_interval(
        &mut self,
        now: Instant,
        period: Duration,
        callback: TimerCallback,
    ) -> TimerHandle {
        self.insert(now, Some(period.clamp(MIN_INTERVAL, MAX_DELAY)), callback)
    }

    fn insert(
        &mut self,
        deadline: Instant,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let handle = TimerHandle::next();
        self.entries.insert(
            handle,
            TimerEntry {
                period,
                callback: Some(callback),
            },
        );
        self.push(deadline, handle);
        handle
    }

    fn push(&mut self, deadline: Instant, handle: TimerHandle) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(ScheduledFiring {
            deadline,
            seq,
            handle,
        }));
    }

    /// Cancel all future firings of a live timer.
    ///
    /// A firing that already started is not interrupted. Clearing a handle
    /// that already fired, was cleared or was never issued here fails.
    pub fn clear(&mut self, handle: TimerHandle) -> Result<(), ContextError> {
        if self.entries.remove(&handle).is_none() {
            return Err(ContextError::validation(format!(
                "unknown timer handle {} (already fired, cleared or never scheduled)",
                handle
            )));
        }
        self.compact();
        Ok(())
    }

    /// State of a live timer, `None` once it fired or was cleared.
    pub fn state(&self, handle: TimerHandle) -> Option<TimerState> {
        self.entries.get(&handle).map(TimerEntry::state)
    }

    /// Number of timers that may still fire.
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Drop heap slots of forgotten timers once they outnumber live ones.
    fn compact(&mut self) {
        if self.queue.len() <= self.entries.len() * 2 + COMPACT_SLACK {
            return;
        }
        let entries = &self.entries;
        self.queue
            .retain(|Reverse(firing)| entries.contains_key(&firing.handle));
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(head)) = self.queue.peek() {
            if self.is_live(head.handle) {
                return Some(head.deadline);
            }
            self.queue.pop();
        }
        None
    }

    fn is_live(&self, handle: TimerHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Remove every firing due at `now`, in deadline then scheduling order.
    ///
    /// Repeating timers are rescheduled one period after the deadline that
    /// just came due. Each timer appears at most once per call.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerHandle> {
        let mut due = Vec::new();
        let mut rescheduled = Vec::new();

        while let Some(Reverse(head)) = self.queue.peek() {
            if head.deadline > now {
                break;
            }
            let Some(Reverse(firing)) = self.queue.pop() else {
                break;
            };
            let Some(entry) = self.entries.get(&firing.handle) else {
                continue;
            };
            due.push(firing.handle);
            if let Some(period) = entry.period {
                rescheduled.push((firing.deadline + period, firing.handle));
            }
        }

        for (deadline, handle) in rescheduled {
            self.push(deadline, handle);
        }
        due
    }

    /// Borrow the callback of a timer that is about to fire.
    ///
    /// Returns `None` when the timer was cleared after its firing was queued.
    /// One-shot timers are forgotten here.
    pub(crate) fn begin_fire(&mut self, handle: TimerHandle) -> Option<TimerCallback> {
        let entry = self.entries.get_mut(&handle)?;
        if entry.period.is_some() {
            return entry.callback.take();
        }
        self.entries.remove(&handle)?.callback
    }

    /// Return a callback borrowed by [`begin_fire`](Self::begin_fire).
    ///
    /// The callback is dropped if the timer was cleared while it ran.
    pub(crate) fn finish_fire(&mut self, handle: TimerHandle, callback: TimerCallback) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.callback = Some(callback);
        }
    }

    /// Cancel every live timer. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.entries.len();
        self.entries.clear();
        self.queue.clear();
        cancelled
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_, _| Ok(()))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_timeout_not_due_before_delay() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_timeout(start, ms(10), noop());

        assert!(timers.take_due(start + ms(9)).is_empty());
        assert_eq!(timers.next_deadline(), Some(start + ms(10)));
        assert_eq!(timers.take_due(start + ms(10)), vec![handle]);
        assert!(timers.take_due(start + ms(100)).is_empty());
    }

    #[test]
    fn test_timeout_fires_once() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_timeout(start, ms(0), noop());

        assert_eq!(timers.take_due(start), vec![handle]);
        assert_eq!(timers.state(handle), Some(TimerState::Pending));
        assert!(timers.begin_fire(handle).is_some());
        assert_eq!(timers.state(handle), None);
        assert!(timers.begin_fire(handle).is_none());
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn test_ordering_by_deadline_then_schedule_order() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let late = timers.set_timeout(start, ms(20), noop());
        let first_tie = timers.set_timeout(start, ms(5), noop());
        let second_tie = timers.set_timeout(start, ms(5), noop());
        let early = timers.set_timeout(start, ms(1), noop());

        let due = timers.take_due(start + ms(50));
        assert_eq!(due, vec![early, first_tie, second_tie, late]);
    }

    #[test]
    fn test_cleared_timeout_never_fires() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_timeout(start, ms(1000), noop());

        timers.clear(handle).unwrap();
        assert_eq!(timers.state(handle), None);
        assert!(timers.take_due(start + ms(1500)).is_empty());
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.begin_fire(handle).is_none());
    }

    #[test]
    fn test_clear_after_queueing_skips_firing() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_timeout(start, ms(1), noop());

        assert_eq!(timers.take_due(start + ms(1)), vec![handle]);
        timers.clear(handle).unwrap();
        assert!(timers.begin_fire(handle).is_none());
    }

    #[test]
    fn test_clear_unknown_or_terminal_handle_is_error() {
        let mut timers = TimerService::new();
        let start = Instant::now();

        let unknown = TimerHandle::from_raw(u64::MAX);
        assert_eq!(timers.clear(unknown).unwrap_err().kind(), "validation");

        let fired = timers.set_timeout(start, ms(0), noop());
        timers.take_due(start);
        let callback = timers.begin_fire(fired).unwrap();
        timers.finish_fire(fired, callback);
        assert!(timers.clear(fired).is_err());

        let cancelled = timers.set_timeout(start, ms(10), noop());
        timers.clear(cancelled).unwrap();
        assert!(timers.clear(cancelled).is_err());
    }

    #[test]
    fn test_interval_fixed_rate() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_interval(start, ms(100), noop());

        // First firing is immediate.
        assert_eq!(timers.take_due(start), vec![handle]);
        assert_eq!(timers.next_deadline(), Some(start + ms(100)));
        assert!(timers.take_due(start + ms(99)).is_empty());
        assert_eq!(timers.take_due(start + ms(100)), vec![handle]);
        assert_eq!(timers.next_deadline(), Some(start + ms(200)));
    }

    #[test]
    fn test_interval_cleared_after_k_firings() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_interval(start, ms(100), noop());
        let mut fired = 0;

        for tick in 0..3 {
            for due in timers.take_due(start + ms(100 * tick)) {
                let callback = timers.begin_fire(due).unwrap();
                fired += 1;
                timers.finish_fire(due, callback);
            }
        }
        timers.clear(handle).unwrap();

        for tick in 3..10 {
            for due in timers.take_due(start + ms(100 * tick)) {
                if timers.begin_fire(due).is_some() {
                    fired += 1;
                }
            }
        }
        assert_eq!(fired, 3);
    }

    #[test]
    fn test_interval_cleared_inside_its_own_callback() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_interval(start, ms(10), noop());

        timers.take_due(start);
        let callback = timers.begin_fire(handle).unwrap();
        timers.clear(handle).unwrap();
        timers.finish_fire(handle, callback);

        assert_eq!(timers.state(handle), None);
        assert!(timers.take_due(start + ms(1000)).is_empty());
    }

    #[test]
    fn test_zero_period_interval_is_clamped() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let handle = timers.set_interval(start, Duration::ZERO, noop());

        assert_eq!(timers.take_due(start), vec![handle]);
        assert_eq!(timers.next_deadline(), Some(start + MIN_INTERVAL));
    }

    #[test]
    fn test_huge_delay_is_clamped() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        timers.set_timeout(start, Duration::from_secs(u64::MAX / 4), noop());
        assert_eq!(timers.next_deadline(), Some(start + MAX_DELAY));
    }

    #[test]
    fn test_cancel_all() {
        let mut timers = TimerService::new();
        let start = Instant::now();
        let a = timers.set_timeout(start, ms(10), noop());
        let b = timers.set_interval(start, ms(10), noop());

        assert_eq!(timers.state(b), Some(TimerState::Repeating));
        assert_eq!(timers.cancel_all(), 2);
        assert_eq!(timers.state(a), None);
        assert_eq!(timers.state(b), None);
        assert_eq!(timers.next_deadline(), None);
        assert_eq!(timers.active_count(), 0);
        assert!(timers.clear(a).is_err());
    }

    #[test]
    fn test_fired_timeouts_are_forgotten() {
        let mut timers = TimerService::new();
        let start = Instant::now();

        for _ in 0..10_000 {
            timers.set_timeout(start, ms(0), noop());
        }
        for due in timers.take_due(start) {
            let callback = timers.begin_fire(due).unwrap();
            timers.finish_fire(due, callback);
        }

        assert!(timers.entries.is_empty());
        assert!(timers.queue.is_empty());
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn test_cleared_timers_do_not_pile_up() {
        let mut timers = TimerService::new();
        let start = Instant::now();

        for _ in 0..10_000 {
            let handle = timers.set_timeout(start, Duration::from_secs(3600), noop());
            timers.clear(handle).unwrap();
        }

        assert!(timers.entries.is_empty());
        assert!(timers.queue.len() <= COMPACT_SLACK + 1);
        assert_eq!(timers.next_deadline(), None);
    }
}
