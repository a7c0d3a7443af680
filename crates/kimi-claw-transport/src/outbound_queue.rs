use std::collections::VecDeque;

pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
/// Fixed-capacity FIFO of serialized frames waiting for a ready connection.
pub struct OutboundQueue {
    frames: VecDeque<String>,
    capacity: usize,
    dropped_total: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped_total: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Queues a frame, evicting and returning the oldest one when full.
    pub fn push(&mut self, frame: String) -> Option<String> {
        let evicted = if self.frames.len() >= self.capacity {
            self.dropped_total = self.dropped_total.saturating_add(1);
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    /// Puts a frame back at the head after a failed flush.
    pub fn requeue_front(&mut self, frame: String) {
        if self.frames.len() >= self.capacity {
            self.dropped_total = self.dropped_total.saturating_add(1);
            self.frames.pop_back();
        }
        self.frames.push_front(frame);
    }
}
