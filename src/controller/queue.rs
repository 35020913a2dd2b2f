//! Deduplicating, bounded work queue feeding the reconciler
//!
//! A key is pending from `submit` until a consumer receives it from `take`.
//! While pending, further submissions of the same key are dropped, so a burst
//! of watch events collapses into one reconcile. Once delivered, the key may
//! be submitted again; changes observed during processing are never lost.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

struct QueueState<K> {
    order: VecDeque<K>,
    pending: HashSet<K>,
    closed: bool,
}

type DepthObserver = Box<dyn Fn(usize) + Send + Sync>;

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    items: Notify,
    space: Notify,
    capacity: usize,
    on_depth: Option<DepthObserver>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    /// Create a queue holding at most `capacity` distinct pending keys
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                pending: HashSet::new(),
                closed: false,
            }),
            items: Notify::new(),
            space: Notify::new(),
            capacity: capacity.max(1),
            on_depth: None,
        }
    }

    /// Call `observer` with the pending count after every change
    pub fn with_depth_observer(mut self, observer: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_depth = Some(Box::new(observer));
        self
    }

    fn report_depth(&self, depth: usize) {
        if let Some(observer) = &self.on_depth {
            observer(depth);
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing work.
    ///
    /// No-op when the key is already pending or the queue is closed. Waits for
    /// a `take` when `capacity` distinct keys are already pending.
    pub async fn submit(&self, key: K) {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed || state.pending.contains(&key) {
                    return;
                }
                if state.order.len() < self.capacity {
                    state.pending.insert(key.clone());
                    state.order.push_back(key);
                    let depth = state.order.len();
                    drop(state);
                    self.report_depth(depth);
                    self.items.notify_one();
                    return;
                }
            }

            space.await;
        }
    }

    /// Wait for the next pending key.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn take(&self) -> Option<K> {
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.order.pop_front() {
                    state.pending.remove(&key);
                    let depth = state.order.len();
                    drop(state);
                    self.report_depth(depth);
                    self.space.notify_waiters();
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }

            items.await;
        }
    }

    /// Stop accepting keys. Pending keys are still delivered.
    pub fn close(&self) {
        self.lock().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pending keys
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, block_on, task};

    #[test]
    fn test_duplicate_submissions_are_delivered_once() {
        let queue = WorkQueue::new(8);
        block_on(async {
            queue.submit("a").await;
            queue.submit("a").await;
            queue.submit("b").await;
            queue.submit("a").await;

            assert_eq!(queue.len(), 2);
            assert_eq!(queue.take().await, Some("a"));
            assert_eq!(queue.take().await, Some("b"));
        });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submit_blocks_at_capacity_until_take() {
        let queue = WorkQueue::new(2);
        block_on(async {
            queue.submit("a").await;
            queue.submit("b").await;
        });

        let mut blocked = task::spawn(queue.submit("c"));
        assert_pending!(blocked.poll());

        // already pending: never blocks and never grows the queue
        let mut duplicate = task::spawn(queue.submit("a"));
        assert_ready!(duplicate.poll());
        assert_eq!(queue.len(), 2);

        let mut take = task::spawn(queue.take());
        assert_eq!(assert_ready!(take.poll()), Some("a"));

        assert!(blocked.is_woken());
        assert_ready!(blocked.poll());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_key_in_flight_can_be_resubmitted() {
        let queue = WorkQueue::new(4);
        block_on(async {
            queue.submit("app").await;
            assert_eq!(queue.take().await, Some("app"));

            queue.submit("app").await;
            assert_eq!(queue.len(), 1);
            assert_eq!(queue.take().await, Some("app"));
        });
    }

    #[test]
    fn test_take_waits_for_submit() {
        let queue = WorkQueue::new(4);
        let mut take = task::spawn(queue.take());
        assert_pending!(take.poll());

        block_on(queue.submit("a"));

        assert!(take.is_woken());
        assert_eq!(assert_ready!(take.poll()), Some("a"));
    }

    #[test]
    fn test_depth_observer_sees_submit_and_take() {
        let depths = Arc::new(Mutex::new(Vec::new()));
        let seen = depths.clone();
        let queue = WorkQueue::new(4).with_depth_observer(move |depth| {
            seen.lock().unwrap().push(depth);
        });

        block_on(async {
            queue.submit("a").await;
            queue.submit("b").await;
            queue.submit("a").await;
            queue.take().await;
        });

        assert_eq!(*depths.lock().unwrap(), vec![1, 2, 1]);
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = WorkQueue::new(4);
        block_on(async {
            queue.submit("a").await;
            queue.submit("b").await;
            queue.close();
            queue.submit("c").await;

            assert_eq!(queue.take().await, Some("a"));
            assert_eq!(queue.take().await, Some("b"));
            assert_eq!(queue.take().await, None);
        });
        assert!(queue.is_closed());
    }

    #[test]
    fn test_close_wakes_waiting_consumer() {
        let queue: WorkQueue<&str> = WorkQueue::new(4);
        let mut take = task::spawn(queue.take());
        assert_pending!(take.poll());

        queue.close();

        assert!(take.is_woken());
        assert_eq!(assert_ready!(take.poll()), None);
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let queue = WorkQueue::new(1);
        block_on(queue.submit("a"));

        let mut blocked = task::spawn(queue.submit("b"));
        assert_pending!(blocked.poll());

        queue.close();

        assert!(blocked.is_woken());
        assert_ready!(blocked.poll());
        assert_eq!(queue.len(), 1);
    }
}
