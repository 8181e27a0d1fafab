//! Ordered message queue between the receive loop and the processor.
//!
//! Single producer (receive loop), single consumer (processor). The
//! consumer peeks the front, applies the effect, then removes it, so a
//! crash mid-apply leaves the element observable. Unbounded: the server
//! paces production.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::contract::Message;

#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, msg: Message) {
        self.inner.lock().push_back(msg);
    }

    /// Non-destructive peek at the oldest element.
    pub fn front(&self) -> Option<Message> {
        self.inner.lock().front().cloned()
    }

    pub fn remove_front(&self) -> Option<Message> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(s: &str) -> Message {
        Message::new(s.as_bytes().to_vec())
    }

    #[test]
    fn fifo_order() {
        let q = MessageQueue::new();
        q.push_back(msg("a"));
        q.push_back(msg("b"));
        q.push_back(msg("c"));
        assert_eq!(q.len(), 3);
        assert_eq!(q.remove_front().unwrap().data, b"a");
        assert_eq!(q.remove_front().unwrap().data, b"b");
        assert_eq!(q.remove_front().unwrap().data, b"c");
        assert!(q.remove_front().is_none());
    }

    #[test]
    fn peek_does_not_consume() {
        let q = MessageQueue::new();
        q.push_back(msg("x"));
        assert_eq!(q.front().unwrap().data, b"x");
        assert_eq!(q.front().unwrap().data, b"x");
        assert_eq!(q.len(), 1);
        q.remove_front();
        assert!(q.is_empty());
        assert!(q.front().is_none());
    }
}
