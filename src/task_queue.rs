// Copyright (c) Chronik Cache Authors
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency work pool (spec §4.3): FIFO admission, per-task
//! promise resolution. Combines the oneshot-per-command pattern from
//! `core_thread.rs` with the `JoinSet`-of-futures pattern `commit_syncer.rs`
//! uses for its inflight fetches.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A bounded-concurrency FIFO task queue. At most `concurrency` tasks run
/// at once; admission beyond that limit waits in FIFO order.
pub struct TaskQueue {
    semaphore: Arc<Semaphore>,
    pending: Arc<Mutex<VecDeque<()>>>,
    queued_count: Arc<AtomicUsize>,
    dispatcher: Mutex<JoinSet<()>>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            queued_count: Arc::new(AtomicUsize::new(0)),
            dispatcher: Mutex::new(JoinSet::new()),
        }
    }

    /// Admits `task`, a no-arg async producer, returning a future that
    /// resolves with its result once it runs. FIFO order is provided by
    /// the underlying fair `tokio::sync::Semaphore`.
    pub fn enqueue<T, F, Fut>(&self, task: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queued_count.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back(());

        let semaphore = self.semaphore.clone();
        let pending = self.pending.clone();
        let queued_count = self.queued_count.clone();
        let fut: BoxedTask = Box::pin(async move {
            let permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            pending.lock().pop_front();
            queued_count.fetch_sub(1, Ordering::SeqCst);
            let result = task().await;
            drop(permit);
            let _ = tx.send(result);
        });
        self.dispatcher.lock().spawn(fut);
        rx
    }

    /// Count of admitted tasks not yet started (spec §4.3
    /// `getQueueLength()`).
    pub fn queue_length(&self) -> usize {
        self.queued_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_task_and_resolves_future() {
        let queue = TaskQueue::new(2);
        let rx = queue.enqueue(|| async { 42 });
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let queue = TaskQueue::new(1);
        let concurrent = Arc::new(AtomicI32::new(0));
        let max_seen = Arc::new(AtomicI32::new(0));

        let mut receivers = Vec::new();
        for _ in 0..4 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let rx = queue.enqueue(move || async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_length_reflects_not_yet_started_tasks() {
        let queue = TaskQueue::new(1);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));

        let _blocker = queue.enqueue(move || {
            let release_rx = release_rx.clone();
            async move {
                let rx = release_rx.lock().take().unwrap();
                let _ = rx.await;
            }
        });

        // Give the blocker a chance to acquire its permit.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let _second = queue.enqueue(|| async { 1 });
        assert_eq!(queue.queue_length(), 1);

        let _ = release_tx.send(());
    }
}
