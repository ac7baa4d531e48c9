//! Timer Queue
//!
//! Single-task queue of delayed, cancellable callbacks. Due callbacks are
//! started in deadline order, FIFO for equal deadlines, each on its own
//! task so a slow callback never holds back the ones after it. Callbacks
//! still running at shutdown are aborted.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct TimerEntry {
    deadline: Instant,
    callback: BoxFuture<'static, ()>,
    cancelled: CancellationToken,
}

/// Cancels a scheduled callback
///
/// Cancelling after the callback started has no effect on that run.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }
}

/// Cooperative timer queue
pub struct TimerQueue {
    tx: mpsc::UnboundedSender<TimerEntry>,
    shutdown: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    /// Spawn the scheduling task
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(rx, shutdown.clone()));

        Self {
            tx,
            shutdown,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Run `callback` after `delay`
    pub fn enqueue<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled = CancellationToken::new();
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            callback: callback.boxed(),
            cancelled: cancelled.clone(),
        };

        if self.tx.send(entry).is_err() {
            tracing::debug!("Timer queue stopped, dropping entry");
            cancelled.cancel();
        }
        TimerHandle { cancelled }
    }

    /// Stop the scheduling task, pending entries never fire
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Timer queue task failed: {}", e);
            }
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<TimerEntry>, shutdown: CancellationToken) {
    let mut pending: BTreeMap<(Instant, u64), TimerEntry> = BTreeMap::new();
    let mut running = JoinSet::new();
    let mut next_id: u64 = 0;

    loop {
        let next_deadline = pending.keys().next().map(|(deadline, _)| *deadline);

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            entry = rx.recv() => match entry {
                Some(entry) => {
                    pending.insert((entry.deadline, next_id), entry);
                    next_id += 1;
                }
                None => break,
            },

            _ = sleep_until(next_deadline), if next_deadline.is_some() => {
                let now = Instant::now();
                while pending.keys().next().is_some_and(|(deadline, _)| *deadline <= now) {
                    let Some((_, entry)) = pending.pop_first() else { break };
                    if entry.cancelled.is_cancelled() {
                        continue;
                    }
                    running.spawn(entry.callback);
                }
            }

            Some(finished) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = finished {
                    tracing::warn!("Timer callback failed: {}", e);
                }
            }
        }
    }

    running.shutdown().await;

    if !pending.is_empty() {
        tracing::debug!("Timer queue stopped with {} pending entries", pending.len());
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> BoxFuture<'static, ()>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let make = move |id: u32| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().unwrap().push(id) }.boxed()
        };
        (fired, make)
    }

    #[tokio::test]
    async fn test_fires_in_deadline_order() {
        let timers = TimerQueue::start();
        let (fired, make) = recorder();

        timers.enqueue(Duration::from_millis(60), make(3));
        timers.enqueue(Duration::from_millis(20), make(1));
        timers.enqueue(Duration::from_millis(40), make(2));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*fired.lock().unwrap(), vec![1, 2, 3]);
        timers.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_delay_is_fifo() {
        let timers = TimerQueue::start();
        let (fired, make) = recorder();

        for id in 0..5 {
            timers.enqueue(Duration::ZERO, make(id));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*fired.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        timers.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_delay_others() {
        let timers = TimerQueue::start();
        let (fired, make) = recorder();

        timers.enqueue(Duration::ZERO, std::future::pending::<()>());
        timers.enqueue(Duration::from_millis(10), make(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*fired.lock().unwrap(), vec![1]);
        timers.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_entry_never_fires() {
        let timers = TimerQueue::start();
        let (fired, make) = recorder();

        let handle = timers.enqueue(Duration::from_millis(30), make(1));
        timers.enqueue(Duration::from_millis(30), make(2));
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*fired.lock().unwrap(), vec![2]);
        timers.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending() {
        let timers = TimerQueue::start();
        let (fired, make) = recorder();

        timers.enqueue(Duration::from_millis(50), make(1));
        timers.shutdown().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.lock().unwrap().is_empty());

        let late = timers.enqueue(Duration::ZERO, make(2));
        assert!(late.is_cancelled());
    }
}
