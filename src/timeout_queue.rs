//! Bounded-wait rendezvous queue
//!
//! A FIFO whose consuming side can wait with a deadline. The correlator
//! parks each in-flight query on one of these instead of wrapping a plain
//! queue pop in an external timer: the deadline lives inside the wait, so a
//! wakeup can never tear the queue state, and every wakeup re-checks the
//! queue and recomputes the time remaining.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// FIFO with a timed blocking pop
#[derive(Debug, Default)]
pub struct TimeoutQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> TimeoutQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append an element and wake one waiter
    pub fn push(&self, item: T) {
        self.items
            .lock()
            .expect("timeout queue lock poisoned")
            .push_back(item);
        self.notify.notify_one();
    }

    /// Non-blocking pop; `None` when the queue is empty
    pub fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .expect("timeout queue lock poisoned")
            .pop_front()
    }

    /// Blocking pop
    ///
    /// With `timeout = None` waits until an element arrives; otherwise waits
    /// up to the given duration and returns `None` on expiry. Elements pushed
    /// concurrently are never lost: the queue is re-checked after every
    /// wakeup, spurious or not.
    pub async fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before the emptiness check so a push between
            // the check and the await still wakes this waiter.
            let notified = self.notify.notified();
            tokio::pin!(notified);

            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop();
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .expect("timeout queue lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_try_pop_empty() {
        let queue: TimeoutQueue<u32> = TimeoutQueue::new();
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_push_then_pop_preserves_order() {
        let queue = TimeoutQueue::new();
        queue.push(1);
        queue.push(2);

        assert_eq!(queue.pop(None).await, Some(1));
        assert_eq!(queue.pop(None).await, Some(2));
    }

    #[tokio::test]
    async fn test_pop_times_out_on_empty_queue() {
        let queue: TimeoutQueue<u32> = TimeoutQueue::new();

        let started = Instant::now();
        let popped = queue.pop(Some(Duration::from_millis(50))).await;
        assert_eq!(popped, None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_concurrent_push() {
        let queue = Arc::new(TimeoutQueue::new());

        let pusher = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.push(42);
            })
        };

        let popped = queue.pop(Some(Duration::from_secs(5))).await;
        assert_eq!(popped, Some(42));
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_element_pushed_right_at_deadline_is_not_lost() {
        let queue: Arc<TimeoutQueue<u32>> = Arc::new(TimeoutQueue::new());

        // Expired waiter leaves the element behind for the next pop.
        assert_eq!(queue.pop(Some(Duration::from_millis(10))).await, None);
        queue.push(7);
        assert_eq!(queue.try_pop(), Some(7));
    }

    #[tokio::test]
    async fn test_two_waiters_two_pushes() {
        let queue = Arc::new(TimeoutQueue::new());

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.pop(Some(Duration::from_secs(5))).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(1);
        queue.push(2);

        let mut got: Vec<u32> = Vec::new();
        for waiter in waiters {
            got.push(waiter.await.unwrap().expect("waiter should receive an element"));
        }
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);
    }
}
