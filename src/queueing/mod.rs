//! Admission control for slow endpoints.
//!
//! A fixed-capacity semaphore with a bounded waiting room: requests beyond
//! capacity wait for a slot until `queue_timeout`; requests beyond the
//! waiting room are rejected outright.
//!
//! # Design Decisions
//! - Waiter accounting is an atomic counter checked before enqueueing, so
//!   a rejected request costs O(1) and never touches the semaphore
//! - Dropping the returned permit releases the slot, which also covers
//!   client disconnects (the handler future is dropped, the permit with it)

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::observability::metrics;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    QueueFull,
    #[error("timed out waiting for a slot")]
    QueueTimeout,
}

/// An in-flight admission token. Held for the duration of one request.
#[derive(Debug)]
pub struct QueueSlot {
    _permit: OwnedSemaphorePermit,
    name: &'static str,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        metrics::queue_busy(self.name, -1);
    }
}

/// Bounded admission queue.
pub struct Queue {
    name: &'static str,
    sem: Arc<Semaphore>,
    queue_limit: u32,
    queue_timeout: Duration,
    waiting: AtomicU32,
}

impl Queue {
    pub fn new(name: &'static str, capacity: u32, queue_limit: u32, queue_timeout: Duration) -> Self {
        Self {
            name,
            sem: Arc::new(Semaphore::new(capacity as usize)),
            queue_limit,
            queue_timeout,
            waiting: AtomicU32::new(0),
        }
    }

    /// Acquire an admission slot, waiting in the bounded queue if needed.
    pub async fn acquire(&self) -> Result<QueueSlot, QueueError> {
        if let Ok(permit) = self.sem.clone().try_acquire_owned() {
            metrics::queue_busy(self.name, 1);
            return Ok(QueueSlot {
                _permit: permit,
                name: self.name,
            });
        }

        if self.waiting.fetch_add(1, Ordering::AcqRel) >= self.queue_limit {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            metrics::record_queue_error(self.name, "too_many_requests");
            return Err(QueueError::QueueFull);
        }

        // The guard keeps the waiter accounting correct even when the
        // request future is dropped mid-wait (client disconnect).
        metrics::queue_waiting(self.name, 1);
        let _waiting = WaitingGuard { queue: self };

        let acquired =
            tokio::time::timeout(self.queue_timeout, self.sem.clone().acquire_owned()).await;

        match acquired {
            Ok(Ok(permit)) => {
                metrics::queue_busy(self.name, 1);
                Ok(QueueSlot {
                    _permit: permit,
                    name: self.name,
                })
            }
            Ok(Err(_)) => {
                // Semaphore closed; treated as capacity exhausted.
                metrics::record_queue_error(self.name, "closed");
                Err(QueueError::QueueFull)
            }
            Err(_) => {
                metrics::record_queue_error(self.name, "queueing_timedout");
                Err(QueueError::QueueTimeout)
            }
        }
    }

    /// Current number of requests waiting for a slot.
    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Acquire)
    }
}

/// Wrap a handler with admission control: rejected requests get 503
/// without ever reaching the inner handler.
pub fn queue_requests(queue: std::sync::Arc<Queue>, inner: crate::routing::Handler) -> crate::routing::Handler {
    std::sync::Arc::new(move |req| {
        let queue = queue.clone();
        let inner = inner.clone();
        Box::pin(async move {
            match queue.acquire().await {
                Ok(slot) => {
                    let response = inner(req).await;
                    drop(slot);
                    response
                }
                Err(_) => crate::helper::plain_response(
                    axum::http::StatusCode::SERVICE_UNAVAILABLE,
                    "Service Unavailable",
                ),
            }
        })
    })
}

struct WaitingGuard<'a> {
    queue: &'a Queue,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.queue.waiting.fetch_sub(1, Ordering::AcqRel);
        metrics::queue_waiting(self.queue.name, -1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: u32, queue_limit: u32, timeout_ms: u64) -> Queue {
        Queue::new("test", capacity, queue_limit, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn proceeds_within_capacity() {
        let q = queue(2, 0, 50);
        let a = q.acquire().await.unwrap();
        let _b = q.acquire().await.unwrap();
        drop(a);
        let _c = q.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_when_waiting_room_full() {
        let q = Arc::new(queue(1, 1, 5_000));
        let held = q.acquire().await.unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.acquire().await });
        // Give the waiter time to enqueue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.waiting(), 1);

        assert_eq!(q.acquire().await.unwrap_err(), QueueError::QueueFull);

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn times_out_in_the_waiting_room() {
        let q = queue(1, 1, 30);
        let _held = q.acquire().await.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(q.acquire().await.unwrap_err(), QueueError::QueueTimeout);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn dropped_future_releases_waiting_count() {
        let q = Arc::new(queue(1, 3, 5_000));
        let _held = q.acquire().await.unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            let _ = q2.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;
        // Aborting mid-wait must not leak the waiting count forever; the
        // next acquire still gets a fair answer.
        assert_eq!(q.waiting(), 0);
    }
}
