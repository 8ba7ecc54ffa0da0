//! FIFO playout queue with intent tracking.
//!
//! The queue stores `(intent_id, AudioEvent)` pairs so atomic intent
//! execution can be verified: events dequeue in insertion order, all events
//! of one DO share one id, and the head is observable without popping.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::event::{AudioEvent, IntentId};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("refusing to enqueue {kind} without an intent_id: {path}")]
    MissingIntentId { kind: &'static str, path: String },
}

#[derive(Default)]
pub struct PlayoutQueue {
    inner: Mutex<VecDeque<(IntentId, AudioEvent)>>,
}

impl PlayoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events atomically, preserving order.
    ///
    /// Every event must already carry its intent_id; validation happens
    /// before anything is pushed so a bad batch leaves the queue untouched.
    pub fn enqueue_all(&self, events: Vec<AudioEvent>) -> Result<(), QueueError> {
        for event in &events {
            if event.intent_id.is_none() {
                return Err(QueueError::MissingIntentId {
                    kind: event.kind.as_str(),
                    path: event.path.display().to_string(),
                });
            }
        }
        let mut queue = self.inner.lock().unwrap();
        for event in events {
            let id = event.intent_id.expect("validated above");
            tracing::debug!(
                intent_id = %id,
                kind = event.kind.as_str(),
                path = %event.path.display(),
                "enqueued"
            );
            queue.push_back((id, event));
        }
        Ok(())
    }

    pub fn dequeue(&self) -> Option<AudioEvent> {
        let mut queue = self.inner.lock().unwrap();
        let (id, event) = queue.pop_front()?;
        tracing::debug!(intent_id = %id, kind = event.kind.as_str(), "dequeued");
        Some(event)
    }

    /// Intent id at the head of the queue, without dequeuing.
    pub fn peek_intent_id(&self) -> Option<IntentId> {
        self.inner.lock().unwrap().front().map(|(id, _)| *id)
    }

    /// All queued intent ids in order, for leakage diagnostics.
    pub fn all_intent_ids(&self) -> Vec<IntentId> {
        self.inner.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    /// The last `n` events without popping, oldest first.
    pub fn get_tail(&self, n: usize) -> Vec<AudioEvent> {
        let queue = self.inner.lock().unwrap();
        let skip = queue.len().saturating_sub(n);
        queue.iter().skip(skip).map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AudioEventKind, DjIntent};

    fn intent_events(song: &str) -> Vec<AudioEvent> {
        DjIntent::new_break(
            AudioEvent::new(song, AudioEventKind::Song),
            None,
            vec![AudioEvent::new("/dj/id.mp3", AudioEventKind::Id)],
            None,
            false,
        )
        .expand()
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = PlayoutQueue::new();
        queue.enqueue_all(intent_events("/music/a.mp3")).unwrap();
        queue.enqueue_all(intent_events("/music/b.mp3")).unwrap();
        assert_eq!(queue.len(), 4);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.kind, AudioEventKind::Id);
        let second = queue.dequeue().unwrap();
        assert_eq!(second.path.to_str(), Some("/music/a.mp3"));
    }

    #[test]
    fn rejects_untagged_events_atomically() {
        let queue = PlayoutQueue::new();
        let mut events = intent_events("/music/a.mp3");
        events.push(AudioEvent::new("/music/rogue.mp3", AudioEventKind::Song));
        assert!(queue.enqueue_all(events).is_err());
        // Validation failed before anything was pushed.
        assert!(queue.is_empty());
    }

    #[test]
    fn head_intent_observable_without_pop() {
        let queue = PlayoutQueue::new();
        let events = intent_events("/music/a.mp3");
        let id = events[0].intent_id.unwrap();
        queue.enqueue_all(events).unwrap();
        assert_eq!(queue.peek_intent_id(), Some(id));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn one_enqueue_shares_one_intent_id() {
        let queue = PlayoutQueue::new();
        queue.enqueue_all(intent_events("/music/a.mp3")).unwrap();
        let ids = queue.all_intent_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|&id| id == ids[0]));
    }

    #[test]
    fn tail_returns_newest_events_in_order() {
        let queue = PlayoutQueue::new();
        queue.enqueue_all(intent_events("/music/a.mp3")).unwrap();
        queue.enqueue_all(intent_events("/music/b.mp3")).unwrap();
        let tail = queue.get_tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].kind, AudioEventKind::Id);
        assert_eq!(tail[1].path.to_str(), Some("/music/b.mp3"));
        // Asking for more than exists returns everything.
        assert_eq!(queue.get_tail(100).len(), 4);
    }
}
