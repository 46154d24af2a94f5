use std::time::Duration;

use ctnrd::event::{EventKind, EventQueue};

/// Events due at the same time drain FIFO; an earlier due time always
/// drains before a later one regardless of insertion order.
#[test]
fn due_time_then_fifo_ordering() {
    let queue = EventQueue::new();
    queue.schedule(Duration::from_millis(20), EventKind::LogRotate { container: "late".into() });
    queue.schedule(Duration::ZERO, EventKind::LogRotate { container: "first".into() });
    queue.schedule(Duration::ZERO, EventKind::LogRotate { container: "second".into() });

    std::thread::sleep(Duration::from_millis(25));

    let names: Vec<String> = std::iter::from_fn(|| queue.pop_due())
        .map(|kind| match kind {
            EventKind::LogRotate { container } => container,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(names, vec!["first", "second", "late"]);
}

/// A cancelled (superseded) event never reaches a handler, even once its
/// due time has passed.
#[test]
fn cancelling_before_due_drops_the_event() {
    let queue = EventQueue::new();
    let handle = queue.schedule(Duration::ZERO, EventKind::AgingDestroy { container: "c".into() });
    let kept = queue.schedule(Duration::ZERO, EventKind::AgingDestroy { container: "keep".into() });
    handle.supersede();

    std::thread::sleep(Duration::from_millis(5));
    match queue.pop_due() {
        Some(EventKind::AgingDestroy { container }) => assert_eq!(container, "keep"),
        other => panic!("expected the non-superseded event, got {other:?}"),
    }
    let _ = kept;
    assert!(queue.pop_due().is_none());
}

#[test]
fn next_wait_reflects_the_earliest_due_entry() {
    let queue = EventQueue::new();
    assert!(queue.next_wait().is_none());
    queue.schedule(Duration::from_millis(200), EventKind::OomCheck { container: "x".into() });
    let wait = queue.next_wait().unwrap();
    assert!(wait <= Duration::from_millis(200));
}
