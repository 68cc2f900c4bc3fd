//! Timer heap for the endpoint event loop.
//!
//! A bounded binary heap of one-shot entries. Scheduling returns a token
//! that cancels the entry; a cancelled entry is guaranteed not to fire
//! once `cancel` has returned on the thread that polls the heap. Due
//! callbacks are detached under the lock and executed after it is
//! released, so a callback may freely reschedule or cancel other entries.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Callback invoked when a timer entry fires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct Entry {
    deadline: Instant,
    id: u64,
    cb: TimerCallback,
}

// Order entries so the earliest deadline is the heap maximum; ties break
// by schedule order.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
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
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct State {
    heap: BinaryHeap<Entry>,
    /// Ids scheduled and not yet fired.
    pending: HashSet<u64>,
    /// Ids cancelled while still in the heap.
    cancelled: HashSet<u64>,
    next_id: u64,
}

/// Bounded timer heap.
pub struct TimerHeap {
    state: Mutex<State>,
    max_entries: usize,
    max_per_poll: usize,
}

impl TimerHeap {
    /// Create a heap holding at most `max_entries` pending entries and
    /// running at most `max_per_poll` callbacks per poll.
    pub fn new(max_entries: usize, max_per_poll: usize) -> Self {
        TimerHeap {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                pending: HashSet::new(),
                cancelled: HashSet::new(),
                next_id: 0,
            }),
            max_entries,
            max_per_poll,
        }
    }

    /// Schedule a one-shot entry `delay` from now.
    pub fn schedule(
        &self,
        delay: Duration,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<TimerToken> {
        let mut state = self.state.lock().unwrap();
        if state.pending.len() >= self.max_entries {
            return Err(Error::TooMany("timer heap"));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(id);
        state.heap.push(Entry {
            deadline: Instant::now() + delay,
            id,
            cb: Box::new(cb),
        });
        tracing::trace!(id, ?delay, "timer scheduled");
        Ok(TimerToken(id))
    }

    /// Cancel a pending entry. Returns `true` if the entry had not yet
    /// fired.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.pending.remove(&token.0) {
            state.cancelled.insert(token.0);
            tracing::trace!(id = token.0, "timer cancelled");
            true
        } else {
            false
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run callbacks for entries due at `now`, bounded by the per-poll
    /// limit. Returns the number of callbacks executed and the delay
    /// until the next pending entry (zero if due entries remain).
    pub fn poll(&self, now: Instant) -> (usize, Option<Duration>) {
        let mut due: Vec<TimerCallback> = Vec::new();
        let next = {
            let mut state = self.state.lock().unwrap();

            while due.len() < self.max_per_poll {
                let is_due = state
                    .heap
                    .peek()
                    .is_some_and(|top| top.deadline <= now);
                if !is_due {
                    break;
                }
                let entry = state.heap.pop().unwrap();
                if state.cancelled.remove(&entry.id) {
                    continue;
                }
                state.pending.remove(&entry.id);
                due.push(entry.cb);
            }

            // Drop cancelled entries off the top so the reported delay
            // reflects a real pending entry.
            loop {
                let top = match state.heap.peek() {
                    Some(top) => {
                        if state.cancelled.contains(&top.id) {
                            None
                        } else {
                            Some(top.deadline.saturating_duration_since(now))
                        }
                    }
                    None => break None,
                };
                match top {
                    Some(delay) => break Some(delay),
                    None => {
                        let id = state.heap.pop().unwrap().id;
                        state.cancelled.remove(&id);
                    }
                }
            }
        };

        let count = due.len();
        for cb in due {
            cb();
        }
        (count, next)
    }
}
