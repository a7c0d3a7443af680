//! Append-only replay buffer for the assistant stream of the current run.
//!
//! A reader polls from an offset; reads past the tail suspend until either a
//! new item is pushed or the queue is closed. Items pushed before `close` are
//! still handed out, then the reader sees `None`.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
/// One buffered `session/update` with its gateway timestamp.
pub struct StreamItem {
    pub update: Value,
    pub ts: Option<i64>,
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<StreamItem>,
    closed: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
/// Replay buffer for the live assistant stream; clones share one buffer.
pub struct AssistantStreamQueue {
    inner: Arc<QueueInner>,
}

impl AssistantStreamQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignored once the queue is closed.
    pub fn push(&self, item: StreamItem) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.items.push(item);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn close(&self) {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items from `offset` onward, waiting for more when caught up; `None` once closed and drained.
    pub async fn read(&self, offset: usize) -> Option<Vec<StreamItem>> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                if offset < state.items.len() {
                    return Some(state.items[offset..].to_vec());
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{AssistantStreamQueue, StreamItem};

    fn item(text: &str) -> StreamItem {
        StreamItem {
            update: json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": text}}),
            ts: None,
        }
    }

    #[tokio::test]
    async fn functional_reader_catches_up_then_sees_close() {
        let queue = AssistantStreamQueue::new();
        queue.push(item("a"));
        queue.push(item("b"));
        let first = queue.read(0).await.expect("items");
        assert_eq!(first.len(), 2);

        let reader = queue.clone();
        let waiter = tokio::spawn(async move { reader.read(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(item("c"));
        let next = waiter.await.expect("join").expect("items");
        assert_eq!(next, vec![item("c")]);

        let reader = queue.clone();
        let waiter = tokio::spawn(async move { reader.read(3).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(waiter.await.expect("join").is_none());
    }

    #[tokio::test]
    async fn regression_items_pushed_before_close_are_still_drained() {
        let queue = AssistantStreamQueue::new();
        queue.push(item("a"));
        queue.close();
        queue.push(item("ignored"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.read(0).await.expect("items").len(), 1);
        assert!(queue.read(1).await.is_none());
    }
}
