use crate::pattern::TaskKey;

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

/// FIFO of set keys ready for processing, bridging the scanner to the
/// monitor loop. Duplicate keys are refused while still queued; the
/// consumer blocks only until the first full scan finishes.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    queue: VecDeque<TaskKey>,
    queued: HashSet<TaskKey>,
    producer_done: bool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                producer_done: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Enqueue a key unless it is already waiting. Returns whether the key
    /// was accepted.
    pub fn push(&self, key: TaskKey) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queued.insert(key) {
            return false;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.cv.notify_one();
        true
    }

    /// Dequeue the next key in enqueue order. Blocks while the queue is
    /// empty until the producer finishes its initial scan; afterwards an
    /// empty queue returns `None` immediately and callers poll.
    pub fn pop(&self) -> Option<TaskKey> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(key) = inner.queue.pop_front() {
                inner.queued.remove(&key);
                return Some(key);
            }
            if inner.producer_done {
                return None;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Called once when the initial full scan has enqueued everything it
    /// found; wakes every blocked consumer.
    pub fn finish_producer(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.producer_done = true;
        drop(inner);
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn preserves_enqueue_order() {
        let q = TaskQueue::new();
        q.push(TaskKey::new(1, 1));
        q.push(TaskKey::new(1, 101));
        q.push(TaskKey::new(2, 1));
        q.finish_producer();

        assert_eq!(q.pop(), Some(TaskKey::new(1, 1)));
        assert_eq!(q.pop(), Some(TaskKey::new(1, 101)));
        assert_eq!(q.pop(), Some(TaskKey::new(2, 1)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn refuses_duplicates_while_queued() {
        let q = TaskQueue::new();
        assert!(q.push(TaskKey::new(1, 1)));
        assert!(!q.push(TaskKey::new(1, 1)));
        assert_eq!(q.len(), 1);
        q.finish_producer();

        // Once popped, the key may be enqueued again (e.g. after a failed
        // worker reverts the set).
        assert_eq!(q.pop(), Some(TaskKey::new(1, 1)));
        assert!(q.push(TaskKey::new(1, 1)));
    }

    #[test]
    fn pop_blocks_until_producer_finishes() {
        let q = Arc::new(TaskQueue::new());

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        q.push(TaskKey::new(4, 201));
        assert_eq!(consumer.join().unwrap(), Some(TaskKey::new(4, 201)));

        let q2 = Arc::clone(&q);
        let blocked = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.finish_producer();
        assert_eq!(blocked.join().unwrap(), None);
    }
}
