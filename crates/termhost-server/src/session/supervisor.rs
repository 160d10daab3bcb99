//! Sliding-window inactivity deadline for one session.
//!
//! Each reset cancels the pending deadline and schedules a new one. Resets
//! also advance an epoch; the expiry callback receives the epoch it was
//! scheduled under and must check [`InactivitySupervisor::is_current`] while
//! holding the same lock that guards `reset`, because a deadline that has
//! already woken up cannot be aborted any more.

use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;

#[derive(Debug)]
pub struct InactivitySupervisor {
    timeout: Duration,
    epoch: u64,
    pending: Option<AbortHandle>,
}

impl InactivitySupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            epoch: 0,
            pending: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cancel any pending deadline and schedule a fresh one.
    ///
    /// `on_expire` is called immediately with the new epoch to build the
    /// future that runs when the deadline passes. Must be called from within
    /// a tokio runtime.
    pub fn reset<F, Fut>(&mut self, on_expire: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.epoch += 1;

        let expiry = on_expire(self.epoch);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expiry.await;
        });
        self.pending = Some(handle.abort_handle());
    }

    /// Cancel the pending deadline, if any. Invalidates the current epoch.
    pub fn disarm(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
            self.epoch += 1;
        }
    }

    /// Called by the expiry itself once it has claimed the deadline.
    ///
    /// Forgets the pending handle without aborting it: the caller is that
    /// task, and a later `disarm` must not cancel its teardown half-way.
    pub fn mark_fired(&mut self) {
        if self.pending.take().is_some() {
            self.epoch += 1;
        }
    }

    /// Whether `epoch` belongs to the deadline that is still scheduled.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.pending.is_some() && self.epoch == epoch
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for InactivitySupervisor {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let mut sup = InactivitySupervisor::new(Duration::from_millis(100));
        sup.reset(move |_| async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_postpones_deadline() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_a = fired.clone();
        let fired_b = fired.clone();
        let mut sup = InactivitySupervisor::new(Duration::from_millis(100));

        sup.reset(move |_| async move {
            fired_a.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        sup.reset(move |_| async move {
            fired_b.fetch_add(1, Ordering::SeqCst);
        });

        // Past the original deadline: nothing fired.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let mut sup = InactivitySupervisor::new(Duration::from_millis(10));
        sup.reset(move |_| async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sup.is_armed());
        sup.disarm();
        assert!(!sup.is_armed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn epochs_distinguish_resets() {
        let mut sup = InactivitySupervisor::new(Duration::from_secs(1));
        let mut first = 0;
        sup.reset(|epoch| {
            first = epoch;
            std::future::ready(())
        });
        assert!(sup.is_current(first));

        let mut second = 0;
        sup.reset(|epoch| {
            second = epoch;
            std::future::ready(())
        });
        assert_ne!(first, second);
        assert!(!sup.is_current(first));
        assert!(sup.is_current(second));

        sup.disarm();
        assert!(!sup.is_current(second));
    }

    #[tokio::test(start_paused = true)]
    async fn mark_fired_invalidates_without_abort() {
        let mut sup = InactivitySupervisor::new(Duration::from_secs(1));
        let mut epoch = 0;
        sup.reset(|e| {
            epoch = e;
            std::future::ready(())
        });
        sup.mark_fired();
        assert!(!sup.is_armed());
        assert!(!sup.is_current(epoch));
        // Nothing left to cancel.
        sup.disarm();
        assert!(!sup.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        {
            let mut sup = InactivitySupervisor::new(Duration::from_millis(10));
            sup.reset(move |_| async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
