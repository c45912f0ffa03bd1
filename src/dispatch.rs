//! Listener task queue

use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{error, trace};

/// Runs listener notifications off the socket reader.
///
/// Every job runs on tokio's blocking pool, at most `concurrency` at a time.
/// Jobs beyond that wait for a permit in submission order. [`wait_idle`]
/// resolves once every job submitted so far has finished.
///
/// [`wait_idle`]: Dispatcher::wait_idle
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    idle_lock: Arc<Mutex<()>>,
}

impl Dispatcher {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            idle_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Queue a blocking job. `label` names the notification in logs.
    pub(crate) fn spawn<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tracker
            .spawn(async move {
                let Ok(_permit) = permits
                    .acquire_owned()
                    .await
                else {
                    return;
                };
                trace!("[DISPATCH] running {}", label);
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    error!("[DISPATCH] {} notification failed: {}", label, e);
                }
            });
    }

    /// Number of queued or running jobs.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.tracker
            .len()
    }

    /// Wait until no job is queued or running.
    pub(crate) async fn wait_idle(&self) {
        let _guard = self
            .idle_lock
            .lock()
            .await;
        self.tracker
            .close();
        self.tracker
            .wait()
            .await;
        self.tracker
            .reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_idle_waits_for_all_jobs() {
        let dispatcher = Dispatcher::new(4);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            dispatcher.spawn("test", move || {
                std::thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher
            .wait_idle()
            .await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let dispatcher = Dispatcher::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            dispatcher.spawn("test", move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        dispatcher
            .wait_idle()
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let dispatcher = Dispatcher::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        dispatcher.spawn("panics", || panic!("listener bug"));
        let counter = Arc::clone(&done);
        dispatcher.spawn("after", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher
            .wait_idle()
            .await;

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reusable_after_wait() {
        let dispatcher = Dispatcher::new(1);
        dispatcher
            .wait_idle()
            .await;

        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        dispatcher.spawn("again", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher
            .wait_idle()
            .await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
