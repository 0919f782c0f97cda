use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// Bounded FIFO queue that drops the oldest entry on overflow rather than
/// blocking the producer. A full `asyncio.Queue.put` would stall the
/// producing channel adapter; dropping the oldest keeps the system live at
/// the cost of losing backlog under sustained overload.
pub struct BoundedDropQueue<T> {
    label: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    dropped: AtomicUsize,
}

impl<T> BoundedDropQueue<T> {
    pub fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Push `item`, dropping the oldest entry first if the queue is already
    /// at capacity. Logs on the 1st and every 100th drop.
    pub async fn push(&self, item: T) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            items.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                warn!(queue = self.label, dropped, "bus queue overflow; dropped oldest entry");
            }
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
    }

    /// Blocks until an item is available, polling every second so a caller
    /// racing a stop signal via `tokio::select!` notices it promptly.
    pub async fn pop(&self) -> T {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    return item;
                }
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), self.notify.notified()).await;
        }
    }

    /// Non-blocking pop used by tests and by the outbound/reaction dispatch
    /// loops' 1-second poll cycle.
    pub async fn try_pop(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_beyond_capacity_drops_oldest() {
        let queue = BoundedDropQueue::new("test", 2);
        queue.push(1).await;
        queue.push(2).await;
        queue.push(3).await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.try_pop().await, Some(2));
        assert_eq!(queue.try_pop().await, Some(3));
    }

    #[tokio::test]
    async fn length_never_exceeds_capacity() {
        let queue = BoundedDropQueue::new("test", 4);
        for i in 0..100 {
            queue.push(i).await;
            assert!(queue.len().await <= 4);
        }
        assert_eq!(queue.dropped_count(), 96);
    }

    #[tokio::test]
    async fn pop_waits_for_an_item() {
        let queue = std::sync::Arc::new(BoundedDropQueue::new("test", 4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42).await;
        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer task should finish")
            .expect("consumer task should not panic");
        assert_eq!(value, 42);
    }
}
