use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle used to report activity and push back an inactivity timeout.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    resetter: mpsc::Sender<()>,
}

impl ActivityMonitor {
    /// Report activity. Never waits: if a reset is already pending, this one
    /// is folded into it.
    pub fn reset(&self) {
        let _ = self.resetter.try_send(());
    }
}

/// Run `on_inactive` once after `timeout` passes without a reset.
///
/// The timer is one-shot: after firing, the loop ends and further resets are
/// ignored. Cancelling `cancel` stops the loop without firing.
pub fn launch_inactive_timeout<F, Fut>(
    timeout: Duration,
    cancel: CancellationToken,
    on_inactive: F,
) -> ActivityMonitor
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (resetter, mut resets) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("inactivity timer cancelled");
                    return;
                }
                reset = resets.recv() => {
                    if reset.is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    debug!(?timeout, "inactivity timeout elapsed");
                    on_inactive().await;
                    return;
                }
            }
        }
    });

    ActivityMonitor { resetter }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn counting_timer(cancel: CancellationToken) -> (ActivityMonitor, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let monitor = launch_inactive_timeout(TIMEOUT, cancel, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (monitor, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_idle_gap() {
        let (_monitor, fired) = counting_timer(CancellationToken::new());

        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // One-shot: no second firing after another full gap.
        tokio::time::sleep(TIMEOUT * 3).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resets_within_timeout_prevent_firing() {
        let (monitor, fired) = counting_timer(CancellationToken::new());

        for _ in 0..20 {
            tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
            monitor.reset();
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_without_firing() {
        let cancel = CancellationToken::new();
        let (_monitor, fired) = counting_timer(cancel.clone());

        tokio::time::sleep(TIMEOUT / 2).await;
        cancel.cancel();
        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_burst_never_blocks() {
        let (monitor, fired) = counting_timer(CancellationToken::new());

        // The reset queue holds one pending signal; extra resets are dropped.
        for _ in 0..1000 {
            monitor.reset();
        }
        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
