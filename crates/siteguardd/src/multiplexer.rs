//! Single-producer, multi-viewer fan-out of encoded frames.
//!
//! Every viewer owns a bounded queue. Publishing never blocks: when a
//! viewer falls behind, its oldest queued frame is dropped.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;

struct ViewerQueue {
    frames: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
    dropped: AtomicU64,
    notify: Notify,
}

impl ViewerQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.frames.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

pub struct StreamMultiplexer {
    capacity: usize,
    next_id: AtomicU64,
    viewers: Mutex<HashMap<u64, Arc<ViewerQueue>>>,
}

impl StreamMultiplexer {
    /// `capacity` is the per-viewer queue depth (at least 1).
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            viewers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new viewer. Frames published from now on are delivered
    /// to the returned handle until it is dropped or the stream is closed.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ViewerQueue::new(self.capacity));
        let viewers = {
            let mut viewers = self.lock();
            viewers.insert(id, queue.clone());
            viewers.len()
        };
        tracing::debug!(viewer = id, viewers, "viewer subscribed");
        Subscription {
            id,
            queue,
            mux: Arc::downgrade(self),
        }
    }

    /// Stop delivery to viewer `id`. Its handle yields the end marker once
    /// already-queued frames are consumed. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let removed = self.lock().remove(&id);
        if let Some(queue) = removed {
            queue.close();
            tracing::debug!(
                viewer = id,
                dropped = queue.dropped.load(Ordering::Relaxed),
                "viewer unsubscribed"
            );
        }
    }

    /// Offer `frame` to every viewer without waiting on any of them.
    pub fn publish(&self, frame: Bytes) {
        let viewers: Vec<(u64, Arc<ViewerQueue>)> = self
            .lock()
            .iter()
            .map(|(id, q)| (*id, q.clone()))
            .collect();

        for (id, queue) in viewers {
            {
                let mut frames = queue.lock();
                if frames.len() >= self.capacity {
                    frames.pop_front();
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(viewer = id, "viewer lagging; dropped oldest frame");
                }
                frames.push_back(frame.clone());
            }
            queue.notify.notify_one();
        }
    }

    /// End every current subscription.
    pub fn close_all(&self) {
        let drained: Vec<Arc<ViewerQueue>> = self.lock().drain().map(|(_, q)| q).collect();
        if !drained.is_empty() {
            tracing::info!(viewers = drained.len(), "closing viewer streams");
        }
        for queue in drained {
            queue.close();
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<ViewerQueue>>> {
        self.viewers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One viewer's handle. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<ViewerQueue>,
    mux: Weak<StreamMultiplexer>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next frame, or `None` once the subscription has ended and its
    /// queue is drained.
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.try_next() {
                return Some(frame);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                // Frames may have landed between the pop and the flag check.
                return self.try_next();
            }
            self.queue.notify.notified().await;
        }
    }

    /// Queued frame, if any, without waiting.
    pub fn try_next(&mut self) -> Option<Bytes> {
        self.queue.lock().pop_front()
    }

    /// Frames discarded because this viewer fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    async fn drain(sub: &mut Subscription) -> Vec<u8> {
        let mut seen = Vec::new();
        while let Some(f) = sub.next().await {
            seen.push(f[0]);
        }
        seen
    }

    #[tokio::test]
    async fn test_two_viewers_one_disconnects_after_two_frames() {
        let mux = StreamMultiplexer::new(8);
        let mut a = mux.subscribe();
        let mut b = mux.subscribe();

        mux.publish(frame(1));
        mux.publish(frame(2));
        assert_eq!(a.next().await, Some(frame(1)));
        assert_eq!(a.next().await, Some(frame(2)));
        mux.unsubscribe(a.id());

        for n in 3..=5 {
            mux.publish(frame(n));
        }
        mux.close_all();

        assert_eq!(a.next().await, None);
        assert_eq!(drain(&mut b).await, vec![1, 2, 3, 4, 5]);
        assert_eq!(mux.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_viewer_does_not_affect_fast_viewer() {
        let mux = StreamMultiplexer::new(2);
        let mut fast = mux.subscribe();
        let mut slow = mux.subscribe();

        let mut fast_seen = Vec::new();
        for n in 0..10 {
            mux.publish(frame(n));
            fast_seen.push(fast.next().await.map(|f| f[0]));
        }
        mux.close_all();

        assert_eq!(fast_seen.len(), 10);
        assert!(fast_seen.iter().all(Option::is_some));
        assert_eq!(fast.dropped(), 0);
        // Slow viewer keeps only the newest frames.
        assert_eq!(drain(&mut slow).await, vec![8, 9]);
        assert_eq!(slow.dropped(), 8);
    }

    #[tokio::test]
    async fn test_viewer_never_sees_more_than_published() {
        let mux = StreamMultiplexer::new(4);
        let mut subs: Vec<Subscription> = (0..3).map(|_| mux.subscribe()).collect();
        for n in 0..3 {
            mux.publish(frame(n));
        }
        mux.close_all();
        for sub in &mut subs {
            assert!(drain(sub).await.len() <= 3);
        }
    }

    #[tokio::test]
    async fn test_waiting_viewer_wakes_on_publish() {
        let mux = StreamMultiplexer::new(4);
        let mut sub = mux.subscribe();
        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::task::yield_now().await;
        mux.publish(frame(42));
        assert_eq!(waiter.await.unwrap(), Some(frame(42)));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_viewer() {
        let mux = StreamMultiplexer::new(4);
        let mut sub = mux.subscribe();
        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::task::yield_now().await;
        mux.close_all();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let mux = StreamMultiplexer::new(4);
        let sub = mux.subscribe();
        assert_eq!(mux.viewer_count(), 1);
        drop(sub);
        assert_eq!(mux.viewer_count(), 0);
        // Publishing with no viewers is a no-op.
        mux.publish(frame(1));
    }
}
