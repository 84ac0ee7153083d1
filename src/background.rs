use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::{
    sync::{Notify, Semaphore},
    task::JoinHandle,
};

use crate::error::IngestError;

/// Bounded fire-and-forget runner for work the webhook response must not wait
/// on (media download, profile pictures, analysis triggers). Failures are
/// logged and dropped.
#[derive(Clone)]
pub struct Background {
    inner: Arc<Inner>,
}

struct Inner {
    permits: Semaphore,
    in_flight: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<Inner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Background {
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(concurrency.max(1)),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn spawn<F>(&self, label: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), IngestError>> + Send + 'static,
    {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(self.inner.clone());
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = _guard.0.permits.acquire().await else {
                return;
            };
            if let Err(err) = task.await {
                tracing::warn!(task = label, error = %err, "background task failed");
            }
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Resolves once every spawned task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
