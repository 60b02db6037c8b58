//! Retry queue for failed event dispatches.
//!
//! When an action raises during dispatch, the event is queued here against
//! its source endpoint and re-dispatched on later engine iterations. Only
//! events whose dispatch actually failed are queued; events that matched no
//! rule are dropped, not retried.
//!
//! The queue is FIFO and capped: an event that keeps failing past
//! [`MAX_EVENT_FAILURES`] attempts is dropped with an error log, so a
//! sustained target outage cannot grow the queue without bound.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::event::EventRecord;

/// Dispatch attempts (including the first) before an event is dropped.
pub const MAX_EVENT_FAILURES: u32 = 10;

/// An event whose action dispatch failed.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event: EventRecord,

    /// Number of failed dispatch attempts so far
    pub failures: u32,

    /// When the first failure happened
    pub first_failed_at: DateTime<Utc>,
}

/// Per-endpoint FIFO queue of failed events.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<FailedEvent>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an event after its first failed dispatch.
    pub fn push(&mut self, event: EventRecord) {
        debug!(event_type = %event.event_type, "Queueing event for retry");
        self.entries.push_back(FailedEvent {
            event,
            failures: 1,
            first_failed_at: Utc::now(),
        });
    }

    /// Take every entry currently queued, leaving the queue empty.
    ///
    /// The drain is a snapshot: entries re-queued while the caller works
    /// through the returned batch wait for the next drain.
    pub fn drain_pending(&mut self) -> Vec<FailedEvent> {
        self.entries.drain(..).collect()
    }

    /// Put an entry back after a renewed failure.
    ///
    /// Increments the failure count and re-queues at the back, or drops the
    /// event once it has exhausted its attempts. Returns whether the entry
    /// was kept.
    pub fn requeue(&mut self, mut entry: FailedEvent) -> bool {
        entry.failures += 1;
        if entry.failures > MAX_EVENT_FAILURES {
            error!(
                event_type = %entry.event.event_type,
                project = %entry.event.project,
                failures = entry.failures,
                first_failed_at = %entry.first_failed_at,
                "Dropping event after repeated dispatch failures"
            );
            return false;
        }
        self.entries.push_back(entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str) -> EventRecord {
        EventRecord::new(name, json!({}))
    }

    #[test]
    fn push_records_first_failure() {
        let mut queue = RetryQueue::new();
        queue.push(event("comment-added"));

        assert_eq!(queue.len(), 1);
        let drained = queue.drain_pending();
        assert_eq!(drained[0].failures, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let mut queue = RetryQueue::new();
        queue.push(event("first"));
        queue.push(event("second"));
        queue.push(event("third"));

        let types: Vec<String> = queue
            .drain_pending()
            .into_iter()
            .map(|e| e.event.event_type)
            .collect();
        assert_eq!(types, vec!["first", "second", "third"]);
    }

    #[test]
    fn requeue_goes_to_the_back_with_incremented_count() {
        let mut queue = RetryQueue::new();
        queue.push(event("old"));
        let entry = queue.drain_pending().into_iter().next().unwrap();

        queue.push(event("new"));
        assert!(queue.requeue(entry));

        let drained = queue.drain_pending();
        assert_eq!(drained[0].event.event_type, "new");
        assert_eq!(drained[1].event.event_type, "old");
        assert_eq!(drained[1].failures, 2);
    }

    #[test]
    fn exhausted_entries_are_dropped() {
        let mut queue = RetryQueue::new();
        let entry = FailedEvent {
            event: event("doomed"),
            failures: MAX_EVENT_FAILURES,
            first_failed_at: Utc::now(),
        };

        assert!(!queue.requeue(entry));
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_on_empty_queue_is_empty() {
        let mut queue = RetryQueue::new();
        assert!(queue.drain_pending().is_empty());
    }
}
