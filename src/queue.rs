use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::oneshot;
use tracing::trace;

/// Bounded fifo gating how many requests are in the parse/handle/respond
/// phases at once. Requests past the concurrency limit wait in arrival order;
/// skip-uri requests jump the line via [Queue::acquire_front].
///
/// A granted [QueueSlot] must be released exactly once. Release is idempotent
/// and also runs on drop, so a slot can not leak on early-return paths.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    concurrency: AtomicUsize,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    running: usize,
    pending: VecDeque<oneshot::Sender<()>>,
}

impl Queue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                concurrency: AtomicUsize::new(concurrency.max(1)),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        self.inner.concurrency.store(concurrency.max(1), Ordering::Relaxed);
        // a raised limit may unblock waiters immediately.
        self.inner.dispatch();
    }

    /// pending waiter count.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// requests currently holding a slot.
    pub fn running(&self) -> usize {
        self.inner.state.lock().unwrap().running
    }

    pub async fn acquire(&self) -> QueueSlot {
        self._acquire(false).await
    }

    /// jump the pending line. used for skip-uri requests.
    pub async fn acquire_front(&self) -> QueueSlot {
        self._acquire(true).await
    }

    async fn _acquire(&self, front: bool) -> QueueSlot {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            if state.running < self.inner.concurrency.load(Ordering::Relaxed) && state.pending.is_empty() {
                state.running += 1;
                return self.slot();
            }
            let (tx, rx) = oneshot::channel();
            if front {
                state.pending.push_front(tx);
            } else {
                state.pending.push_back(tx);
            }
            rx
        };

        // sender dropped only if queue itself is gone; treat as granted.
        let _ = rx.await;
        self.slot()
    }

    fn slot(&self) -> QueueSlot {
        QueueSlot {
            inner: Some(self.inner.clone()),
        }
    }
}

impl Inner {
    // hand freed capacity to the next live waiter.
    fn dispatch(&self) {
        let mut state = self.state.lock().unwrap();
        while state.running < self.concurrency.load(Ordering::Relaxed) {
            match state.pending.pop_front() {
                // waiter may have aborted while queued; skip dead ones.
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        state.running += 1;
                    } else {
                        trace!(target: "queue", "skipping aborted queue waiter");
                    }
                }
                None => break,
            }
        }
    }
}

/// Slot handle releasing queue capacity exactly once.
pub struct QueueSlot {
    inner: Option<Arc<Inner>>,
}

impl QueueSlot {
    pub fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            {
                let mut state = inner.state.lock().unwrap();
                state.running = state.running.saturating_sub(1);
            }
            inner.dispatch();
        }
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn caps_running() {
        let queue = Queue::new(2);
        let s1 = queue.acquire().await;
        let _s2 = queue.acquire().await;
        assert_eq!(queue.running(), 2);

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 1);

        drop(s1);
        let _s3 = waiter.await.unwrap();
        assert_eq!(queue.running(), 2);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn front_insert_wins() {
        let queue = Queue::new(1);
        let slot = queue.acquire().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let q1 = queue.clone();
        let o1 = order.clone();
        let normal = tokio::spawn(async move {
            let _s = q1.acquire().await;
            o1.lock().unwrap().push("normal");
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let q2 = queue.clone();
        let o2 = order.clone();
        let skipper = tokio::spawn(async move {
            let _s = q2.acquire_front().await;
            o2.lock().unwrap().push("skip");
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 2);

        drop(slot);
        normal.await.unwrap();
        skipper.await.unwrap();
        // the front inserted waiter ran first despite arriving second.
        assert_eq!(*order.lock().unwrap(), vec!["skip", "normal"]);
    }

    #[tokio::test]
    async fn double_release_is_guarded() {
        let queue = Queue::new(1);
        let mut slot = queue.acquire().await;
        slot.release();
        slot.release();
        drop(slot);
        assert_eq!(queue.running(), 0);
        // capacity intact after redundant releases.
        let _s = queue.acquire().await;
        assert_eq!(queue.running(), 1);
    }

    #[tokio::test]
    async fn aborted_waiter_skipped() {
        let queue = Queue::new(1);
        let slot = queue.acquire().await;

        let q = queue.clone();
        let dead = tokio::spawn(async move {
            let _s = q.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        dead.abort();
        let _ = dead.await;

        let q = queue.clone();
        let live = tokio::spawn(async move {
            let _s = q.acquire().await;
            7u8
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(slot);
        assert_eq!(live.await.unwrap(), 7);
    }
}
