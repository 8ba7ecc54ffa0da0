//! Bounded ring buffer, drop-newest on overflow.
//!
//! One type serves both rings in the pipeline: whole PCM frames in the input
//! router and variable-size MP3 chunks between the encoder drain and the
//! fan-out. Push never blocks; a full buffer drops the item being pushed and
//! counts it.

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    dropped: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be > 0");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Push an item; on overflow the newest item (this one) is dropped.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() < self.capacity {
            inner.items.push_back(item);
        } else {
            inner.dropped += 1;
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().items.clear();
    }
}

impl RingBuffer<Vec<u8>> {
    /// Accumulate queued chunks up to `size` bytes. Returns fewer bytes when
    /// the buffer runs short, None when it is empty; a partially consumed
    /// chunk's remainder goes back to the front.
    pub fn read_bytes(&self, size: usize) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.is_empty() {
            return None;
        }
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let Some(chunk) = inner.items.pop_front() else {
                break;
            };
            let need = size - out.len();
            if chunk.len() <= need {
                out.extend_from_slice(&chunk);
            } else {
                out.extend_from_slice(&chunk[..need]);
                inner.items.push_front(chunk[need..].to_vec());
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_capacity() {
        let ring = RingBuffer::new(3);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let ring = RingBuffer::new(2);
        ring.push("a");
        ring.push("b");
        ring.push("c");
        ring.push("d");
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.dropped(), 2);
        // The survivors are the oldest items.
        assert_eq!(ring.pop(), Some("a"));
        assert_eq!(ring.pop(), Some("b"));
    }

    #[test]
    fn clear_keeps_drop_counter() {
        let ring = RingBuffer::new(1);
        ring.push(1);
        ring.push(2);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.dropped(), 1);
    }

    #[test]
    fn read_bytes_accumulates_chunks() {
        let ring = RingBuffer::new(8);
        ring.push(vec![1, 2, 3]);
        ring.push(vec![4, 5, 6]);
        assert_eq!(ring.read_bytes(4), Some(vec![1, 2, 3, 4]));
        // Remainder of the split chunk stays at the front.
        assert_eq!(ring.read_bytes(10), Some(vec![5, 6]));
        assert_eq!(ring.read_bytes(1), None);
    }
}
