//! Timed event queue: a priority-time min-heap keyed by
//! absolute due-time, FIFO among equal due-times, with in-place
//! cancellation via a "superseded" mark instead of queue removal. The
//! event vocabulary itself (respawn, aging destroy, log
//! rotate, OOM, wait timeout) is grounded on `original_source/epoll.cpp`'s
//! timer-queue consumers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a due event asks the worker pool to do.
#[derive(Clone, Debug)]
pub enum EventKind {
    Respawn { container: String },
    AgingDestroy { container: String },
    LogRotate { container: String },
    OomCheck { container: String },
    WaitTimeout { waiter_id: u64 },
}

/// A shared cancellation flag. Cloning an `EventHandle` and marking it
/// superseded lets a caller cancel a scheduled event without touching the
/// heap: the popping worker observes the mark and drops the event
/// without handling it.
#[derive(Clone, Debug)]
pub struct EventHandle {
    superseded: Arc<AtomicBool>,
}

impl EventHandle {
    fn new() -> Self {
        Self {
            superseded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn supersede(&self) {
        self.superseded.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(AtomicOrdering::Relaxed)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    kind: EventKind,
    handle: EventHandle,
}

impl Eq for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest due time (and,
        // among ties, the lowest sequence number) pops first.
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Due-time-ordered event queue, safe to share across the timer worker
/// pool: a worker sleeps on a condvar with a bounded wait equal to
/// (next-due − now).
pub struct EventQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    next_seq: AtomicU64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Schedules `kind` at `delay` from now, returning a handle the caller
    /// can use to cancel it later (e.g. a fresh `Get` resetting an aging
    /// timer).
    pub fn schedule(&self, delay: Duration, kind: EventKind) -> EventHandle {
        self.schedule_at(Instant::now() + delay, kind)
    }

    pub fn schedule_at(&self, due: Instant, kind: EventKind) -> EventHandle {
        let handle = EventHandle::new();
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().unwrap().push(Entry {
            due,
            seq,
            kind,
            handle: handle.clone(),
        });
        handle
    }

    /// Pops the next due (non-superseded) event if its due time has
    /// already passed; returns `None` (with no side effect) if the heap is
    /// empty or the earliest entry isn't due yet. Superseded entries are
    /// discarded silently rather than returned to the caller.
    pub fn pop_due(&self) -> Option<EventKind> {
        let mut heap = self.heap.lock().unwrap();
        loop {
            let is_due = matches!(heap.peek(), Some(entry) if entry.due <= Instant::now());
            if !is_due {
                return None;
            }
            let entry = heap.pop().unwrap();
            if !entry.handle.is_superseded() {
                return Some(entry.kind);
            }
        }
    }

    /// Duration until the next due event, or `None` if the queue is empty
    /// — the timer worker's condvar `wait_for` bound.
    pub fn next_wait(&self) -> Option<Duration> {
        let heap = self.heap.lock().unwrap();
        heap.peek().map(|entry| entry.due.saturating_duration_since(Instant::now()))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_due_order() {
        let queue = EventQueue::new();
        queue.schedule(Duration::from_millis(50), EventKind::LogRotate { container: "b".into() });
        queue.schedule(Duration::from_millis(0), EventKind::LogRotate { container: "a".into() });
        std::thread::sleep(Duration::from_millis(5));
        match queue.pop_due() {
            Some(EventKind::LogRotate { container }) => assert_eq!(container, "a"),
            other => panic!("expected due event a, got {other:?}"),
        }
        assert!(queue.pop_due().is_none(), "second event not due yet");
    }

    #[test]
    fn superseded_event_is_skipped() {
        let queue = EventQueue::new();
        let handle = queue.schedule(Duration::from_millis(0), EventKind::Respawn { container: "x".into() });
        handle.supersede();
        std::thread::sleep(Duration::from_millis(5));
        assert!(queue.pop_due().is_none());
    }
}
