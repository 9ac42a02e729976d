use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Blocking deque shared by a container and its worker threads. One
/// wait/signal implementation for every container instead of each one
/// hand-rolling the condvar dance.
pub struct BlockingDeque<T> {
    inner: Mutex<Inner<T>>,
    nonempty: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BlockingDeque<T> {
    pub fn new() -> Self {
        BlockingDeque {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            nonempty: Condvar::new(),
        }
    }

    /// Returns false if the queue is closed; the item is dropped in that case.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.items.push_back(item);
        self.nonempty.notify_one();
        true
    }

    /// Blocks until an item is available. Once closed, remaining items are
    /// still drained; `None` means closed and empty.
    pub fn pop_blocking(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.nonempty.wait(inner).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Visit queued items front to back until `f` returns true. Returns
    /// whether any item accepted the visit.
    pub fn scan_mut<F: FnMut(&mut T) -> bool>(&self, mut f: F) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for item in inner.items.iter_mut() {
            if f(item) {
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: pushes are refused, poppers drain what is left and
    /// then observe `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.nonempty.notify_all();
    }
}

impl<T> Default for BlockingDeque<T> {
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
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(BlockingDeque::new());
        let q = queue.clone();
        let popper = thread::spawn(move || q.pop_blocking());
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(queue.push(42));
        assert_eq!(popper.join().unwrap(), Some(42));
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = BlockingDeque::new();
        queue.push(1);
        queue.push(2);
        queue.close();
        assert!(!queue.push(3));
        assert_eq!(queue.pop_blocking(), Some(1));
        assert_eq!(queue.pop_blocking(), Some(2));
        assert_eq!(queue.pop_blocking(), None);
    }

    #[test]
    fn test_close_wakes_blocked_poppers() {
        let queue: Arc<BlockingDeque<i32>> = Arc::new(BlockingDeque::new());
        let q = queue.clone();
        let popper = thread::spawn(move || q.pop_blocking());
        thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert_eq!(popper.join().unwrap(), None);
    }

    #[test]
    fn test_scan_mut_stops_at_acceptor() {
        let queue = BlockingDeque::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        let merged = queue.scan_mut(|group| {
            if group[0] == 2 {
                group.push(99);
                true
            } else {
                false
            }
        });
        assert!(merged);
        assert_eq!(queue.pop_blocking(), Some(vec![1]));
        assert_eq!(queue.pop_blocking(), Some(vec![2, 99]));
    }
}
