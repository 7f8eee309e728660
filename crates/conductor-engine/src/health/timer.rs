//! Cancellable fixed-interval background loop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Runs a callback every `interval` until cancelled.
///
/// The first run happens one interval after [`start`](Self::start).
#[derive(Debug)]
pub struct PeriodicTimer {
    interval: Duration,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            shutdown: None,
            handle: None,
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the loop. Returns `false` if it is already running.
    pub fn start<F, Fut>(&mut self, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            warn!("Periodic timer already running");
            return false;
        }

        let (tx, mut rx) = watch::channel(false);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => tick().await,
                    _ = rx.changed() => {
                        debug!("Periodic timer cancelled");
                        return;
                    }
                }
            }
        });
        self.shutdown = Some(tx);
        self.handle = Some(handle);
        true
    }

    /// Stop the loop and wait for an in-progress tick to finish.
    pub async fn cancel(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Periodic timer task ended abnormally");
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_interval_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = PeriodicTimer::new(Duration::from_secs(30));
        assert!(timer.start(counting(&count)));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        timer.cancel().await;
        assert!(!timer.is_running());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_and_restart_after_cancel_works() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = PeriodicTimer::new(Duration::from_secs(1));
        assert!(timer.start(counting(&count)));
        assert!(!timer.start(counting(&count)));

        timer.cancel().await;
        assert!(timer.start(counting(&count)));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        timer.cancel().await;
    }

    #[tokio::test]
    async fn cancel_without_start_is_noop() {
        let mut timer = PeriodicTimer::new(Duration::from_secs(1));
        timer.cancel().await;
        assert!(!timer.is_running());
    }
}
