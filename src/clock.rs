//! Time Sources and Deferred Tasks
//!
//! All time in the stack flows through the [`TimeSource`] trait: `now`,
//! `call_later` and `cancel` are the layer-facing surface, `next_due` is
//! used only by the owning event loop to drain tasks that have come due.
//! Two implementations share the same ordered task queue:
//!
//! - [`TimeMachine`]: a virtual clock for tests. Time passes only when the
//!   loop drains due tasks toward a horizon, executing them in strict
//!   (time, insertion) order.
//! - [`MonotonicClock`]: wraps [`std::time::Instant`] for production use;
//!   layer code cannot tell the two apart.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Handle returned by `call_later`, usable to cancel the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Abstract clock with deferred-task scheduling.
pub trait TimeSource<T> {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    /// Schedule `task` to run `delay` from now.
    fn call_later(&mut self, delay: Duration, task: T) -> TaskHandle;

    /// Cancel a scheduled task. Returns false if it already ran or was
    /// already cancelled; that case is benign and swallowed by callers.
    fn cancel(&mut self, handle: TaskHandle) -> bool;

    /// Remove and return the earliest task due at or before `horizon`,
    /// advancing a virtual clock to the task's due time.
    fn next_due(&mut self, horizon: Duration) -> Option<(Duration, T)>;

    /// Move a virtual clock forward to `to`; no-op on a real clock.
    fn advance(&mut self, to: Duration);

    /// Number of live (non-cancelled) scheduled tasks.
    fn pending(&self) -> usize;
}

struct Scheduled<T> {
    due: Duration,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    // Reversed so the BinaryHeap pops the earliest (due, insertion) first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

/// Ordered task queue shared by both clock implementations.
struct TaskQueue<T> {
    heap: BinaryHeap<Scheduled<T>>,
    cancelled: HashSet<u64>,
    next_seq: u64,
    live: usize,
}

impl<T> TaskQueue<T> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 1,
            live: 0,
        }
    }

    fn schedule(&mut self, due: Duration, task: T) -> TaskHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { due, seq, task });
        self.live += 1;
        TaskHandle(seq)
    }

    fn cancel(&mut self, handle: TaskHandle) -> bool {
        if handle.0 == 0 || handle.0 >= self.next_seq {
            return false;
        }
        // Lazy removal: mark now, discard when popped.
        if self.heap.iter().any(|s| s.seq == handle.0) && self.cancelled.insert(handle.0) {
            self.live -= 1;
            return true;
        }
        false
    }

    fn pop_due(&mut self, limit: Duration) -> Option<(Duration, T)> {
        loop {
            let (due, seq) = match self.heap.peek() {
                Some(scheduled) => (scheduled.due, scheduled.seq),
                None => return None,
            };
            if self.cancelled.contains(&seq) {
                self.heap.pop();
                self.cancelled.remove(&seq);
                continue;
            }
            if due > limit {
                return None;
            }
            let scheduled = self.heap.pop().expect("peeked entry is present");
            self.live -= 1;
            return Some((scheduled.due, scheduled.task));
        }
    }

    fn len(&self) -> usize {
        self.live
    }
}

/// Virtual clock: time passes only through `next_due` and `advance`.
pub struct TimeMachine<T> {
    now: Duration,
    queue: TaskQueue<T>,
}

impl<T> TimeMachine<T> {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            queue: TaskQueue::new(),
        }
    }
}

impl<T> Default for TimeMachine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeSource<T> for TimeMachine<T> {
    fn now(&self) -> Duration {
        self.now
    }

    fn call_later(&mut self, delay: Duration, task: T) -> TaskHandle {
        self.queue.schedule(self.now + delay, task)
    }

    fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.queue.cancel(handle)
    }

    fn next_due(&mut self, horizon: Duration) -> Option<(Duration, T)> {
        let (due, task) = self.queue.pop_due(horizon)?;
        if due > self.now {
            self.now = due;
        }
        Some((due, task))
    }

    fn advance(&mut self, to: Duration) {
        if to > self.now {
            self.now = to;
        }
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Real clock over [`Instant`] with the same scheduling surface.
pub struct MonotonicClock<T> {
    origin: Instant,
    queue: TaskQueue<T>,
}

impl<T> MonotonicClock<T> {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            queue: TaskQueue::new(),
        }
    }

    /// Delay until the earliest live task, for callers that sleep between
    /// polls.
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = self.origin.elapsed();
        self.queue
            .heap
            .iter()
            .filter(|s| !self.queue.cancelled.contains(&s.seq))
            .map(|s| s.due)
            .min()
            .map(|due| due.saturating_sub(now))
    }
}

impl<T> Default for MonotonicClock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeSource<T> for MonotonicClock<T> {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn call_later(&mut self, delay: Duration, task: T) -> TaskHandle {
        let due = self.origin.elapsed() + delay;
        self.queue.schedule(due, task)
    }

    fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.queue.cancel(handle)
    }

    fn next_due(&mut self, horizon: Duration) -> Option<(Duration, T)> {
        // Real time advances on its own; only hand out tasks already due.
        let limit = horizon.min(self.origin.elapsed());
        self.queue.pop_due(limit)
    }

    fn advance(&mut self, _to: Duration) {}

    fn pending(&self) -> usize {
        self.queue.len()
    }
}
