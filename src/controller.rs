// Keyed workqueue and the reconciliation harness driving every controller

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{Record, SharedStore};

const BASE_RETRY_DELAY: Duration = Duration::from_millis(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);

/// What the harness should do after a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Lets the harness tell "not ready yet" apart from real failures.
pub trait ErrorClass {
    /// Preconditions unmet: re-enqueue quietly.
    fn is_forget(&self) -> bool;

    /// Explicit delay before the key is retried.
    fn requeue_after(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Error: std::error::Error + ErrorClass + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &str) -> Result<Action, Self::Error>;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// A de-duplicating queue of record keys. A key handed out by `get` is not
/// handed out again until `done` is called for it, so at most one worker
/// holds a key at a time.
#[derive(Clone, Default)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Re-queued by `done`.
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-adds the key after a per-key exponential delay.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = BASE_RETRY_DELAY
                .checked_mul(2u32.saturating_pow(*failures))
                .unwrap_or(MAX_RETRY_DELAY)
                .min(MAX_RETRY_DELAY);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears the failure history of the key.
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a shutdown in between is not missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Feeds the store's change events into the queue, mapping each record key
    /// to the key this queue reconciles (`None` skips the event).
    pub fn watch<R, F>(&self, store: &SharedStore<R>, map: F)
    where
        R: Record,
        F: Fn(&str) -> Option<String> + Send + 'static,
    {
        let mut events = store.watch();
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(key) = map(event.key()) {
                            queue.add(key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = R::KIND, skipped, "watch lagged; waiting for resync");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Periodically enqueues every record of the store.
    pub fn resync<R: Record>(&self, store: SharedStore<R>, every: Duration, shutdown: CancellationToken) {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.list(None).await {
                    Ok(records) => {
                        for record in records {
                            queue.add(record.key());
                        }
                    }
                    Err(e) => warn!(kind = R::KIND, "resync list failed: {}", e),
                }
            }
        });
    }
}

/// Runs a reconciler over a workqueue with a fixed number of workers.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: WorkQueue,
    workers: usize,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, queue: WorkQueue, workers: usize) -> Self {
        Self {
            reconciler,
            queue,
            workers: workers.max(1),
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(controller = self.reconciler.name(), workers = self.workers, "starting controller");
        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let reconciler = self.reconciler.clone();
            let queue = self.queue.clone();
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process(reconciler.as_ref(), &queue, &key).await;
                    queue.done(&key);
                }
            }));
        }

        shutdown.cancelled().await;
        self.queue.shutdown();
        futures::future::join_all(handles).await;
        info!(controller = self.reconciler.name(), "controller stopped");
    }
}

/// Reconciles one key and schedules its follow-up.
pub async fn process<R: Reconciler + ?Sized>(reconciler: &R, queue: &WorkQueue, key: &str) {
    let name = reconciler.name();
    match reconciler.reconcile(key).await {
        Ok(action) => {
            counter!("reconcile_total", "controller" => name, "result" => "ok").increment(1);
            queue.forget(key);
            if let Some(after) = action.requeue_after() {
                queue.add_after(key, after);
            }
        }
        Err(e) if e.is_forget() => {
            counter!("reconcile_total", "controller" => name, "result" => "forget").increment(1);
            debug!(controller = name, key, "{}", e);
            match e.requeue_after() {
                Some(after) => queue.add_after(key, after),
                None => queue.add_rate_limited(key),
            }
        }
        Err(e) => {
            counter!("reconcile_total", "controller" => name, "result" => "error").increment(1);
            error!(controller = name, key, "reconcile failed: {}", e);
            match e.requeue_after() {
                Some(after) => queue.add_after(key, after),
                None => queue.add_rate_limited(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("waiting")]
        Forget,
    }

    impl ErrorClass for TestError {
        fn is_forget(&self) -> bool {
            matches!(self, TestError::Forget)
        }
    }

    struct Waiting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Waiting {
        type Error = TestError;

        fn name(&self) -> &'static str {
            "waiting"
        }

        async fn reconcile(&self, _key: &str) -> Result<Action, TestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Forget)
        }
    }

    #[tokio::test]
    async fn key_is_held_by_one_worker() {
        let queue = WorkQueue::new();
        queue.add("c-1");
        queue.add("c-1");
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.unwrap();
        // Added while processing: parked until done.
        queue.add("c-1");
        assert!(queue.is_empty());
        queue.done(&key);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_errors_are_requeued() {
        let queue = WorkQueue::new();
        let reconciler = Waiting {
            calls: AtomicUsize::new(0),
        };
        queue.add("c-1");
        let key = queue.get().await.unwrap();
        process(&reconciler, &queue, &key).await;
        queue.done(&key);
        assert_eq!(queue.failures("c-1"), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.get().await.as_deref(), Some("c-1"));
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
