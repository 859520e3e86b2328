//! Bounded, FIFO-fair admission control for the retrieval pipeline.
//!
//! At most `max_concurrent` requests hold a slot at once. Up to
//! `max_queue_depth` more may wait, each for at most `wait_timeout`; anything
//! beyond that is turned away immediately. Slots are released when the
//! [`SlotGuard`] is dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::AdmissionConfig;

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    /// Every slot was busy and the wait queue was full.
    QueueFull,

    /// The request waited `waited_secs` without getting a slot.
    Timeout { waited_secs: u64 },
}

impl Denial {
    /// Message shown to the caller.
    pub fn message(&self) -> String {
        match self {
            Denial::QueueFull => "服务器请求队列已满，请稍后再试".to_string(),
            Denial::Timeout { waited_secs } => {
                format!("等待处理超时（{waited_secs}秒），请稍后再试")
            }
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Outcome of an admission attempt.
#[derive(Debug)]
#[must_use]
pub enum Admission<T> {
    Granted(T),
    Denied(Denial),
}

impl<T> Admission<T> {
    /// Check if the request was admitted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }

    /// The granted value, if any.
    pub fn granted(self) -> Option<T> {
        match self {
            Admission::Granted(value) => Some(value),
            Admission::Denied(_) => None,
        }
    }

    /// The denial, if any.
    pub fn denial(&self) -> Option<Denial> {
        match self {
            Admission::Granted(_) => None,
            Admission::Denied(denial) => Some(*denial),
        }
    }

    /// Map the granted value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Admission<U> {
        match self {
            Admission::Granted(value) => Admission::Granted(f(value)),
            Admission::Denied(denial) => Admission::Denied(denial),
        }
    }
}

impl<T, E> Admission<Result<T, E>> {
    /// Move an inner error out so it can be propagated with `?`.
    pub fn transpose(self) -> Result<Admission<T>, E> {
        match self {
            Admission::Granted(Ok(value)) => Ok(Admission::Granted(value)),
            Admission::Granted(Err(e)) => Err(e),
            Admission::Denied(denial) => Ok(Admission::Denied(denial)),
        }
    }
}

/// Snapshot of controller occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub active: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
}

/// A held admission slot. Dropping it frees the slot for the oldest waiter.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    /// Release the slot now.
    pub fn release(self) {
        drop(self);
    }
}

/// Holds one wait-queue position; gives it back on drop, including when the
/// waiting future is cancelled.
struct WaitTicket<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gate in front of the embed/search/generate pipeline.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    max_concurrent: usize,
    max_queue_depth: usize,
    wait_timeout: Duration,
}

impl AdmissionController {
    /// Create a controller from its limits.
    ///
    /// `max_concurrent` is capped at [`Semaphore::MAX_PERMITS`].
    pub fn new(config: &AdmissionConfig) -> Self {
        let max_concurrent = config.max_concurrent.min(Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(max_concurrent)),
                waiting: AtomicUsize::new(0),
                max_concurrent,
                max_queue_depth: config.max_queue_depth,
                wait_timeout: config.wait_timeout(),
            }),
        }
    }

    /// Acquire a slot, waiting in arrival order if none is free.
    pub async fn acquire(&self) -> Admission<SlotGuard> {
        let inner = &self.inner;

        // The semaphore hands released permits to queued waiters first, so
        // this never jumps ahead of an earlier request.
        if let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() {
            return Admission::Granted(SlotGuard { _permit: permit });
        }

        let Some(_ticket) = self.reserve_wait() else {
            debug!(
                "Admission denied: all {} slots busy and {} waiters queued",
                inner.max_concurrent, inner.max_queue_depth
            );
            return Admission::Denied(Denial::QueueFull);
        };

        let waited_secs = inner.wait_timeout.as_secs();
        match tokio::time::timeout(inner.wait_timeout, Arc::clone(&inner.permits).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => Admission::Granted(SlotGuard { _permit: permit }),
            Ok(Err(_closed)) => {
                warn!("Admission semaphore closed while waiting");
                Admission::Denied(Denial::Timeout { waited_secs })
            }
            Err(_elapsed) => {
                debug!("Admission timed out after {waited_secs}s");
                Admission::Denied(Denial::Timeout { waited_secs })
            }
        }
    }

    /// Run `task` while holding a slot.
    pub async fn run<F, T>(&self, task: F) -> Admission<T>
    where
        F: Future<Output = T>,
    {
        match self.acquire().await {
            Admission::Granted(guard) => {
                let output = task.await;
                guard.release();
                Admission::Granted(output)
            }
            Admission::Denied(denial) => Admission::Denied(denial),
        }
    }

    /// Current occupancy.
    pub fn stats(&self) -> AdmissionStats {
        let inner = &self.inner;
        AdmissionStats {
            active: inner.max_concurrent - inner.permits.available_permits(),
            waiting: inner.waiting.load(Ordering::Acquire),
            max_concurrent: inner.max_concurrent,
            max_queue_depth: inner.max_queue_depth,
        }
    }

    fn reserve_wait(&self) -> Option<WaitTicket<'_>> {
        let inner = &self.inner;
        inner
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < inner.max_queue_depth).then_some(waiting + 1)
            })
            .ok()
            .map(|_| WaitTicket {
                waiting: &inner.waiting,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn controller(max_concurrent: usize, max_queue_depth: usize, wait_secs: u64) -> AdmissionController {
        AdmissionController::new(
            &AdmissionConfig::default()
                .with_max_concurrent(max_concurrent)
                .with_max_queue_depth(max_queue_depth)
                .with_wait_timeout_secs(wait_secs),
        )
    }

    async fn wait_for_waiters(controller: &AdmissionController, count: usize) {
        while controller.stats().waiting < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_grants_up_to_capacity() {
        let controller = controller(2, 0, 15);

        let first = controller.acquire().await.granted().unwrap();
        let _second = controller.acquire().await.granted().unwrap();
        assert_eq!(controller.stats().active, 2);

        assert_eq!(controller.acquire().await.denial(), Some(Denial::QueueFull));

        first.release();
        assert_eq!(controller.stats().active, 1);
        assert!(controller.acquire().await.is_granted());
    }

    #[tokio::test]
    async fn test_acquire_waits_when_full() {
        let controller = controller(1, 1, 15);
        let guard = controller.acquire().await.granted().unwrap();

        let mut waiting = tokio_test::task::spawn(controller.acquire());
        tokio_test::assert_pending!(waiting.poll());
        assert_eq!(controller.stats().waiting, 1);

        drop(guard);
        assert!(waiting.is_woken());
        let admission = tokio_test::assert_ready!(waiting.poll());
        assert!(admission.is_granted());
        assert_eq!(controller.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_denies_with_timeout() {
        let controller = controller(16, 64, 0);
        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(controller.acquire().await.granted().unwrap());
        }

        assert_eq!(
            controller.acquire().await.denial(),
            Some(Denial::Timeout { waited_secs: 0 })
        );
        assert_eq!(controller.stats().waiting, 0);
        assert_eq!(controller.stats().active, 16);
    }

    #[tokio::test]
    async fn test_queue_full_does_not_consume_wait_slot() {
        let controller = controller(1, 1, 15);
        let guard = controller.acquire().await.granted().unwrap();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire().await.is_granted() })
        };
        wait_for_waiters(&controller, 1).await;

        assert_eq!(controller.acquire().await.denial(), Some(Denial::QueueFull));
        assert_eq!(controller.stats().waiting, 1);

        drop(guard);
        assert!(waiter.await.unwrap());
        assert_eq!(controller.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let controller = controller(1, 8, 15);
        let guard = controller.acquire().await.granted().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        for id in 0..4 {
            let task_controller = controller.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let guard = task_controller.acquire().await.granted().unwrap();
                tx.send(id).unwrap();
                guard.release();
            }));
            wait_for_waiters(&controller, id + 1).await;
        }

        guard.release();
        for task in tasks {
            task.await.unwrap();
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(id) = rx.recv().await {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_restores_waiting_count() {
        let controller = controller(1, 4, 15);
        let _guard = controller.acquire().await.granted().unwrap();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire().await.is_granted() })
        };
        wait_for_waiters(&controller, 1).await;

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(controller.stats().waiting, 0);
        assert_eq!(controller.stats().active, 1);
    }

    #[tokio::test]
    async fn test_run_releases_slot_after_task() {
        let controller = controller(1, 0, 15);

        let output = controller.run(async { 7 }).await;
        assert_eq!(output.granted(), Some(7));
        assert_eq!(controller.stats().active, 0);
    }

    #[tokio::test]
    async fn test_oversized_capacity_is_capped() {
        let controller = controller(usize::MAX, 0, 15);
        assert_eq!(controller.stats().max_concurrent, Semaphore::MAX_PERMITS);
        assert!(controller.acquire().await.is_granted());
    }

    #[test]
    fn test_denial_messages() {
        assert_eq!(Denial::QueueFull.message(), "服务器请求队列已满，请稍后再试");
        assert_eq!(
            Denial::Timeout { waited_secs: 15 }.to_string(),
            "等待处理超时（15秒），请稍后再试"
        );
    }
}
