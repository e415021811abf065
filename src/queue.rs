//! Priority work queues
//!
//! Every pipeline stage (data loading, decoding, processing, disk I/O,
//! encoding) runs its work on a [`WorkQueue`]: a bounded-concurrency queue
//! that always dispatches the highest-priority pending item first. Items
//! keep a handle through which the owning job re-ranks them when subscriber
//! priorities change, or cancels them before they start.
//!
//! Work that is already running is never interrupted by the queue itself;
//! running operations observe cancellation cooperatively through their
//! cancellation tokens.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::request::Priority;

struct WorkItem {
    seq: u64,
    priority: Mutex<Priority>,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
}

struct QueueState {
    max_concurrency: usize,
    running: usize,
    suspended: bool,
    pending: Vec<Arc<WorkItem>>,
    next_seq: u64,
}

struct QueueShared {
    name: &'static str,
    state: Mutex<QueueState>,
}

/// Bounded-concurrency queue dispatching by priority, FIFO within a
/// priority level.
///
/// Cloning yields another handle to the same queue; the pipeline
/// configuration holds one handle per stage and shares them with every
/// pipeline instance built from it.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<QueueShared>,
}

impl WorkQueue {
    #[must_use]
    pub fn new(name: &'static str, max_concurrency: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name,
                state: Mutex::new(QueueState {
                    max_concurrency: max_concurrency.max(1),
                    running: 0,
                    suspended: false,
                    pending: Vec::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Enqueue `future` at `priority`; it runs when a slot frees up and no
    /// higher-priority work is pending.
    pub(crate) fn enqueue(
        &self,
        priority: Priority,
        future: BoxFuture<'static, ()>,
    ) -> WorkItemHandle {
        let item = {
            let mut state = self.shared.state.lock();
            let item = Arc::new(WorkItem {
                seq: state.next_seq,
                priority: Mutex::new(priority),
                future: Mutex::new(Some(future)),
            });
            state.next_seq += 1;
            state.pending.push(Arc::clone(&item));
            item
        };
        Self::dispatch(&self.shared);
        WorkItemHandle {
            shared: Arc::downgrade(&self.shared),
            item,
        }
    }

    /// Adjust the concurrency limit; takes effect immediately.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.shared.state.lock().max_concurrency = max_concurrency.max(1);
        Self::dispatch(&self.shared);
    }

    /// Stop dispatching new work. Running work is unaffected.
    pub fn suspend(&self) {
        self.shared.state.lock().suspended = true;
    }

    /// Resume dispatching.
    pub fn resume(&self) {
        self.shared.state.lock().suspended = false;
        Self::dispatch(&self.shared);
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared.state.lock().running
    }

    fn dispatch(shared: &Arc<QueueShared>) {
        loop {
            let future = {
                let mut state = shared.state.lock();
                if state.suspended || state.running >= state.max_concurrency {
                    return;
                }
                // Highest priority wins; FIFO among equals.
                let best = state
                    .pending
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, item)| (*item.priority.lock(), u64::MAX - item.seq))
                    .map(|(index, _)| index);
                let Some(index) = best else { return };
                let item = state.pending.swap_remove(index);
                let Some(future) = item.future.lock().take() else {
                    continue;
                };
                state.running += 1;
                trace!(queue = shared.name, seq = item.seq, "dispatching work item");
                future
            };
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                future.await;
                shared.state.lock().running -= 1;
                Self::dispatch(&shared);
            });
        }
    }
}

/// Handle to an enqueued work item.
///
/// Dropping the handle does not cancel the item; cancellation is explicit
/// so that coalesced jobs control the lifetime of their work.
pub(crate) struct WorkItemHandle {
    shared: std::sync::Weak<QueueShared>,
    item: Arc<WorkItem>,
}

impl WorkItemHandle {
    /// Re-rank the item while it waits for a slot.
    pub(crate) fn set_priority(&self, priority: Priority) {
        *self.item.priority.lock() = priority;
    }

    /// Remove the item from the queue if it has not started.
    pub(crate) fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            state.pending.retain(|pending| pending.seq != self.item.seq);
        }
        // Drop the future even if it already left the pending list but has
        // not been taken by the dispatcher.
        self.item.future.lock().take();
    }
}

/// Leaky-bucket limiter in front of the data-loading queue.
///
/// Bursts are admitted up to the bucket size; once the bucket is drained,
/// fetches are delayed (never dropped) until tokens refill.
pub(crate) struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Values of the reference implementation: 80 tasks/sec, bucket of 25.
    pub(crate) fn new() -> Self {
        Self::with_rate(80.0, 25.0)
    }

    pub(crate) fn with_rate(rate_per_second: f64, burst: f64) -> Self {
        Self {
            rate_per_second,
            burst,
            state: Mutex::new(BucketState {
                available: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available, then consume it.
    pub(crate) async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.available =
                    (state.available + elapsed * self.rate_per_second).min(self.burst);
                state.last_refill = now;
                if state.available >= 1.0 {
                    state.available -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.available) / self.rate_per_second,
                    ))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let queue = WorkQueue::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            queue.enqueue(
                Priority::Normal,
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                }
                .boxed(),
            );
        }
        for _ in 0..8 {
            done_rx.recv().await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn suspended_queue_dispatches_by_priority_on_resume() {
        let queue = WorkQueue::new("test", 1);
        queue.suspend();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for (label, priority) in [("normal", Priority::Normal), ("second", Priority::Normal)] {
            let tx = tx.clone();
            queue.enqueue(
                priority,
                async move {
                    let _ = tx.send(label);
                }
                .boxed(),
            );
        }
        assert_eq!(queue.pending_count(), 2);

        // Raise the second item's priority before anything runs.
        let tx2 = tx.clone();
        let handle = queue.enqueue(
            Priority::Normal,
            async move {
                let _ = tx2.send("high");
            }
            .boxed(),
        );
        handle.set_priority(Priority::High);

        queue.resume();
        assert_eq!(rx.recv().await, Some("high"));
        assert_eq!(rx.recv().await, Some("normal"));
        assert_eq!(rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn cancelled_pending_items_never_run() {
        let queue = WorkQueue::new("test", 1);
        queue.suspend();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let handle = queue.enqueue(
            Priority::Normal,
            async move {
                ran2.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );
        handle.cancel();
        queue.resume();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn rate_limiter_admits_bursts_immediately() {
        let limiter = RateLimiter::with_rate(1000.0, 5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
