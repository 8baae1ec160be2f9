//! Pending-frame accounting for a connection's normal queue.
//!
//! A slot is reserved before a frame enters the queue and released by the
//! writer once the frame has hit the socket. The router uses
//! [`BackpressureController::try_reserve`] and drops on refusal; clients
//! streaming chunks use [`BackpressureController::reserve`], which parks
//! until the writer frees a slot or the timeout passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{RelaywireError, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default wait for a free slot.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicUsize,
    /// Signalled whenever slots are released.
    space: Notify,
}

/// Lock-free slot counter, cloned into every sender and the writer task.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    shared: Arc<Shared>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Controller allowing `max_pending` outstanding frames.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            shared: Arc::default(),
            max_pending,
            timeout,
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Take a slot if one is free, without waiting.
    pub fn try_reserve(&self) -> Result<()> {
        self.shared
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pending).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| RelaywireError::BackpressureTimeout)
    }

    /// Take a slot, waiting up to the timeout for the writer to free one.
    pub async fn reserve(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            // Register interest before checking so a release in between is not missed.
            let released = self.shared.space.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_reserve().is_ok() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(RelaywireError::BackpressureTimeout);
            }
        }
    }

    /// Give back one slot.
    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Give back the slots of a written batch.
    pub fn release_many(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.shared.pending.fetch_sub(count, Ordering::AcqRel);
        self.shared.space.notify_waiters();
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT)
    }
}

/// Returns a reserved slot on drop unless the frame made it into the queue.
pub struct BackpressureGuard<'a> {
    controller: &'a BackpressureController,
    armed: bool,
}

impl<'a> BackpressureGuard<'a> {
    pub fn new(controller: &'a BackpressureController) -> Self {
        Self {
            controller,
            armed: true,
        }
    }

    /// The slot now belongs to the writer, which releases it.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BackpressureGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_past_limit() {
        let ctrl = BackpressureController::with_timeout(3, DEFAULT_TIMEOUT);
        assert!(!ctrl.is_active());

        for _ in 0..3 {
            ctrl.try_reserve().unwrap();
        }
        assert!(ctrl.is_active());
        assert!(matches!(ctrl.try_reserve(), Err(RelaywireError::BackpressureTimeout)));
        assert_eq!(ctrl.pending_count(), 3);
    }

    #[test]
    fn test_racing_threads_respect_limit() {
        let ctrl = BackpressureController::with_timeout(64, DEFAULT_TIMEOUT);
        let granted: usize = (0..4)
            .map(|_| {
                let ctrl = ctrl.clone();
                std::thread::spawn(move || (0..40).filter(|_| ctrl.try_reserve().is_ok()).count())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();

        assert_eq!(granted, 64);
        assert_eq!(ctrl.pending_count(), 64);
    }

    #[test]
    fn test_batch_release() {
        let ctrl = BackpressureController::default();
        for _ in 0..10 {
            ctrl.try_reserve().unwrap();
        }

        ctrl.release_many(0);
        assert_eq!(ctrl.pending_count(), 10);
        ctrl.release_many(7);
        ctrl.release();
        assert_eq!(ctrl.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_reserve_gives_up_after_timeout() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_millis(20));
        ctrl.try_reserve().unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(ctrl.reserve().await, Err(RelaywireError::BackpressureTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_release() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(5));
        ctrl.try_reserve().unwrap();

        let writer = ctrl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.release();
        });

        let started = std::time::Instant::now();
        ctrl.reserve().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ctrl.pending_count(), 1);
    }

    #[test]
    fn test_guard_returns_slot_unless_disarmed() {
        let ctrl = BackpressureController::default();

        ctrl.try_reserve().unwrap();
        drop(BackpressureGuard::new(&ctrl));
        assert_eq!(ctrl.pending_count(), 0);

        ctrl.try_reserve().unwrap();
        BackpressureGuard::new(&ctrl).disarm();
        assert_eq!(ctrl.pending_count(), 1);
    }
}
