//! Bounded concurrent execution with a bounded FIFO queue.
//!
//! `run` admits a task when a slot is free, parks it in FIFO order when the
//! queue has room, and rejects it immediately otherwise. A finishing task
//! hands its slot directly to the oldest waiter, so admission order is
//! strict FIFO and the in-flight count never exceeds the limit even
//! transiently.
//!
//! Cancellation is asymmetric: dropping a *queued* `run` removes its queue
//! position, but once admitted the factory runs on its own task — aborting
//! the caller neither cancels the work nor frees the slot early. The slot
//! releases when the factory settles.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;
use palaverproto::{Request, WireError};
use std::sync::Arc;

struct PoolState {
    in_flight: usize,
    queued: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct PoolInner {
    max_concurrent: usize,
    max_queued: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Hand the caller's slot to the oldest live waiter, or release it.
    fn release_slot(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.in_flight -= 1;
    }
}

/// Concurrency limiter with bounded queue and `QueueFull` rejection.
pub struct ConcurrencyPool {
    inner: Arc<PoolInner>,
}

impl ConcurrencyPool {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_concurrent,
                max_queued,
                state: Mutex::new(PoolState {
                    in_flight: 0,
                    queued: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Run `factory`'s future under the concurrency limit.
    ///
    /// Fails with `QueueFull` before the factory is invoked when neither a
    /// slot nor a queue position is available. Queued callers are released
    /// strictly in enqueue order. An admitted factory settles normally even
    /// if the caller is cancelled; its panic, if any, resumes in the caller.
    pub async fn run<F, Fut, T>(&self, factory: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.acquire().await?;
        // Admitted work detaches from the caller's cancellation: the slot
        // is owned by the spawned task and releases when the factory
        // settles, not when run()'s frame unwinds.
        let task = tokio::spawn(async move {
            let result = factory().await;
            drop(slot);
            result
        });
        match task.await {
            Ok(value) => Ok(value),
            Err(e) => match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(_) => unreachable!("pool task is never aborted"),
            },
        }
    }

    /// Current `(in_flight, queued)` counts.
    pub fn usage(&self) -> (usize, usize) {
        let state = self.inner.state.lock().unwrap();
        (state.in_flight, state.queued)
    }

    async fn acquire(&self) -> Result<SlotGuard, PoolError> {
        loop {
            let rx = {
                let mut state = self.inner.state.lock().unwrap();
                if state.in_flight < self.inner.max_concurrent {
                    state.in_flight += 1;
                    return Ok(SlotGuard {
                        inner: self.inner.clone(),
                    });
                }
                if state.queued >= self.inner.max_queued {
                    return Err(PoolError::QueueFull);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                state.queued += 1;
                rx
            };

            let mut waiter = WaiterGuard {
                inner: &self.inner,
                rx: Some(rx),
            };
            if waiter.wait().await {
                // The finishing task handed us its slot; in_flight already
                // accounts for it.
                drop(waiter);
                return Ok(SlotGuard {
                    inner: self.inner.clone(),
                });
            }
            // Sender vanished without a hand-off; re-enter admission.
            drop(waiter);
        }
    }
}

/// Owned admission slot; releases the slot and wakes exactly one waiter
/// when the admitted factory settles.
struct SlotGuard {
    inner: Arc<PoolInner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release_slot();
    }
}

/// Queue position; dropping it (caller cancelled while queued) removes the
/// position and forwards any slot that was already handed over.
struct WaiterGuard<'a> {
    inner: &'a PoolInner,
    rx: Option<oneshot::Receiver<()>>,
}

impl WaiterGuard<'_> {
    async fn wait(&mut self) -> bool {
        // Poll by reference: on cancellation the guard still owns the
        // receiver, so a slot handed over mid-cancel is recovered in Drop.
        let granted = match self.rx.as_mut() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        };
        if granted {
            self.rx = None;
        }
        granted
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.queued -= 1;
        }
        if let Some(mut rx) = self.rx.take() {
            if rx.try_recv().is_ok() {
                // A slot arrived between cancellation and this drop; pass it
                // on so it is not lost.
                self.inner.release_slot();
            }
        }
    }
}

/// Middleware adapter funneling the rest of the chain through a shared pool.
pub struct PoolMiddleware {
    pool: Arc<ConcurrencyPool>,
}

impl PoolMiddleware {
    pub fn new(pool: Arc<ConcurrencyPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Middleware for PoolMiddleware {
    async fn handle(&self, request: Request, next: Next) -> Result<serde_json::Value, WireError> {
        match self.pool.run(|| next.run(request)).await {
            Ok(outcome) => outcome,
            Err(PoolError::QueueFull) => {
                Err(WireError::new("request queue is full").with_code(503))
            }
        }
    }
}
