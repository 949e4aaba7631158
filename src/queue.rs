//! Thread-safe work queue
//!
//! Both directions of caller/engine communication go through a `WorkQueue`:
//! requests flow caller→engine, rendered tokens flow engine→caller. Neither
//! side ever blocks on the other.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Unbounded FIFO queue shared between one consumer and any number of
/// producers.
///
/// `push` is non-blocking and safe to call from any thread at any time.
/// `process_one` holds the lock only for the pop itself; the handler runs
/// outside the lock so producers are never stalled behind arbitrary-duration
/// work. Items are handled exactly once, in strict FIFO order.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends an item to the tail of the queue.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push_back(item);
    }

    /// Pops and handles at most one item.
    ///
    /// Returns `true` if an item was handled. The handler is invoked after
    /// the lock is released.
    pub fn process_one<F: FnOnce(T)>(&self, handler: F) -> bool {
        let item = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            items.pop_front()
        };
        match item {
            Some(item) => {
                handler(item);
                true
            }
            None => false,
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new();
        for i in 0..10 {
            queue.push(i);
        }

        let mut seen = Vec::new();
        while queue.process_one(|i| seen.push(i)) {}

        assert_eq!(seen, (0..10).collect::<Vec<i32>>());
    }

    #[test]
    fn test_process_one_empty() {
        let queue: WorkQueue<i32> = WorkQueue::new();
        assert!(!queue.process_one(|_| panic!("handler must not run")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_exactly_once() {
        let queue = WorkQueue::new();
        queue.push(42);

        let mut count = 0;
        while queue.process_one(|_| count += 1) {}

        assert_eq!(count, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(WorkQueue::new());
        let mut handles = Vec::new();

        for p in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    queue.push((p, i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen: Vec<(i32, i32)> = Vec::new();
        while queue.process_one(|item| seen.push(item)) {}

        assert_eq!(seen.len(), 400);
        // Per-producer order is preserved even when producers interleave.
        for p in 0..4 {
            let from_p: Vec<i32> = seen.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(from_p, (0..100).collect::<Vec<i32>>());
        }
    }
}
