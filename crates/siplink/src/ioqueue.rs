//! I/O readiness multiplexer contract.
//!
//! The endpoint drives transports through a readiness-based queue: one
//! blocking poll with a timeout per `handle_events` call, then zero-
//! timeout re-polls to drain immediate events. Concrete socket-backed
//! queues are external; the in-memory [`EventQueue`] provided here backs
//! loopback transports and tests, and defers resolver completions so all
//! asynchronous work funnels through the same poll.

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A deferred readiness callback.
pub type IoEvent = Box<dyn FnOnce() + Send>;

/// Readiness-based I/O multiplexer.
///
/// `poll` blocks up to `timeout` (`None` blocks indefinitely), runs the
/// callbacks for ready events, and returns how many were handled. An
/// `Err` means the OS-level poll itself failed, not that an event
/// callback failed.
pub trait IoQueue: Send + Sync {
    fn poll(&self, timeout: Option<Duration>) -> io::Result<usize>;
}

/// In-memory event queue.
///
/// Transports (and the static resolver) push readiness callbacks; the
/// endpoint pops and runs them from its poll loop. At most `batch`
/// events are handled per poll so a busy queue still reports progress in
/// bounded slices.
pub struct EventQueue {
    events: Mutex<VecDeque<IoEvent>>,
    cond: Condvar,
    batch: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_batch(8)
    }

    /// Create a queue handling at most `batch` events per poll.
    pub fn with_batch(batch: usize) -> Self {
        EventQueue {
            events: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            batch: batch.max(1),
        }
    }

    /// Enqueue a readiness callback and wake one poller.
    pub fn push(&self, ev: impl FnOnce() + Send + 'static) {
        self.events.lock().unwrap().push_back(Box::new(ev));
        self.cond.notify_one();
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IoQueue for EventQueue {
    fn poll(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut queue = self.events.lock().unwrap();

        if queue.is_empty() {
            match timeout {
                Some(t) => {
                    let deadline = Instant::now() + t;
                    while queue.is_empty() {
                        let left = deadline.saturating_duration_since(Instant::now());
                        if left.is_zero() {
                            break;
                        }
                        let (q, res) = self
                            .cond
                            .wait_timeout(queue, left)
                            .map_err(|_| io::Error::other("event queue poisoned"))?;
                        queue = q;
                        if res.timed_out() {
                            break;
                        }
                    }
                }
                None => {
                    while queue.is_empty() {
                        queue = self
                            .cond
                            .wait(queue)
                            .map_err(|_| io::Error::other("event queue poisoned"))?;
                    }
                }
            }
        }

        let take = queue.len().min(self.batch);
        let ready: Vec<IoEvent> = queue.drain(..take).collect();
        drop(queue);

        let count = ready.len();
        for ev in ready {
            ev();
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_poll_runs_queued_events() {
        let q = EventQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            q.push(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        let n = q.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(n, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_empty_poll_times_out() {
        let q = EventQueue::new();
        let start = Instant::now();
        let n = q.poll(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_batch_limits_events_per_poll() {
        let q = EventQueue::with_batch(2);
        for _ in 0..5 {
            q.push(|| {});
        }
        assert_eq!(q.poll(Some(Duration::ZERO)).unwrap(), 2);
        assert_eq!(q.poll(Some(Duration::ZERO)).unwrap(), 2);
        assert_eq!(q.poll(Some(Duration::ZERO)).unwrap(), 1);
        assert_eq!(q.poll(Some(Duration::ZERO)).unwrap(), 0);
    }

    #[test]
    fn test_push_wakes_blocked_poller() {
        let q = Arc::new(EventQueue::new());
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.poll(Some(Duration::from_secs(5))).unwrap());
        std::thread::sleep(Duration::from_millis(10));
        q.push(|| {});
        assert_eq!(handle.join().unwrap(), 1);
    }
}
