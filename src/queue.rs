/*!
Bounded multi-producer/multi-consumer queue for protocol messages and
output events.

Unlike the ISR sample ring, both sides of this queue run in task context, so
a consumer may block with a bounded timeout (`pop_timeout`). The overflow
policy is chosen per queue:

- `DropNewest`: a push against a full queue discards the *incoming* item.
  Used where the oldest data is the most valuable (e.g. diagnostic frames
  that must go out in order).
- `DropOldest`: a push against a full queue evicts the head to make room.
  Used where only the freshest value matters (e.g. cyclic signal snapshots).

Either way the push itself never fails and never blocks; `dropped` counts
every discarded item.

Timeout convention (shared with the PAL): `timeout_us == 0` polls,
`timeout_us == u32::MAX` waits forever.
*/

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropNewest,
    DropOldest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub high_watermark: usize,
}

struct QueueInner<T, const N: usize> {
    slots: [Option<T>; N],
    head: usize,
    tail: usize,
    len: usize,
    stats: QueueStats,
}

pub struct BoundedQueue<T, const N: usize> {
    policy: OverflowPolicy,
    inner: Mutex<QueueInner<T, N>>,
    available: Condvar,
}

impl<T, const N: usize> BoundedQueue<T, N> {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(QueueInner {
                slots: [const { None }; N],
                head: 0,
                tail: 0,
                len: 0,
                stats: QueueStats::default(),
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue `item`, applying the overflow policy on a full queue.
    /// Returns true if the item was stored (DropNewest on full returns false).
    pub fn push(&self, item: T) -> bool {
        let mut q = self.inner.lock().unwrap();
        if q.len == N {
            match self.policy {
                OverflowPolicy::DropNewest => {
                    q.stats.dropped += 1;
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    let head = q.head;
                    q.slots[head] = None;
                    q.head = (head + 1) % N;
                    q.len -= 1;
                    q.stats.dropped += 1;
                }
            }
        }
        let tail = q.tail;
        q.slots[tail] = Some(item);
        q.tail = (tail + 1) % N;
        q.len += 1;
        q.stats.pushed += 1;
        if q.len > q.stats.high_watermark {
            q.stats.high_watermark = q.len;
        }
        drop(q);
        self.available.notify_one();
        true
    }

    /// Non-blocking dequeue.
    pub fn pop(&self) -> Option<T> {
        let mut q = self.inner.lock().unwrap();
        Self::pop_locked(&mut q)
    }

    /// Dequeue with a bounded wait. `timeout_us == 0` behaves like `pop`;
    /// `u32::MAX` waits until an item arrives.
    pub fn pop_timeout(&self, timeout_us: u32) -> Option<T> {
        let mut q = self.inner.lock().unwrap();
        if let Some(item) = Self::pop_locked(&mut q) {
            return Some(item);
        }
        if timeout_us == 0 {
            return None;
        }
        if timeout_us == u32::MAX {
            loop {
                q = self.available.wait(q).unwrap();
                if let Some(item) = Self::pop_locked(&mut q) {
                    return Some(item);
                }
            }
        }
        // Bounded wait; spurious wakeups re-enter with the remaining time.
        let deadline = std::time::Instant::now() + Duration::from_micros(u64::from(timeout_us));
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Self::pop_locked(&mut q);
            }
            q = self.available.wait_timeout(q, deadline - now).unwrap().0;
            if let Some(item) = Self::pop_locked(&mut q) {
                return Some(item);
            }
        }
    }

    fn pop_locked(q: &mut QueueInner<T, N>) -> Option<T> {
        if q.len == 0 {
            return None;
        }
        let head = q.head;
        let item = q.slots[head].take();
        q.head = (head + 1) % N;
        q.len -= 1;
        q.stats.popped += 1;
        item
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_newest_discards_incoming() {
        let q: BoundedQueue<u32, 2> = BoundedQueue::new(OverflowPolicy::DropNewest);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));

        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
        assert_eq!(q.stats().dropped, 1);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let q: BoundedQueue<u32, 2> = BoundedQueue::new(OverflowPolicy::DropOldest);
        q.push(1);
        q.push(2);
        assert!(q.push(3));

        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.stats().dropped, 1);
    }

    #[test]
    fn pop_timeout_zero_is_poll() {
        let q: BoundedQueue<u32, 4> = BoundedQueue::new(OverflowPolicy::DropNewest);
        assert_eq!(q.pop_timeout(0), None);
        q.push(7);
        assert_eq!(q.pop_timeout(0), Some(7));
    }

    #[test]
    fn pop_timeout_expires_empty_handed() {
        let q: BoundedQueue<u32, 4> = BoundedQueue::new(OverflowPolicy::DropNewest);
        let start = std::time::Instant::now();
        assert_eq!(q.pop_timeout(20_000), None);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn blocked_consumer_wakes_on_push() {
        use std::sync::Arc;

        let q: Arc<BoundedQueue<u32, 4>> = Arc::new(BoundedQueue::new(OverflowPolicy::DropNewest));
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.pop_timeout(u32::MAX))
        };
        std::thread::sleep(Duration::from_millis(10));
        q.push(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn watermark_tracks_peak_depth() {
        let q: BoundedQueue<u32, 8> = BoundedQueue::new(OverflowPolicy::DropNewest);
        for i in 0..5 {
            q.push(i);
        }
        for _ in 0..5 {
            q.pop();
        }
        assert_eq!(q.stats().high_watermark, 5);
    }
}
