use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

/// Handle to a periodic or delayed task.
///
/// The task stops when cancelled, when the handle is dropped, or when a
/// periodic closure returns [`ControlFlow::Break`].
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    cancel_tx: watch::Sender<bool>,
    // Checked under the closure call so a cancel that races a tick wins.
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `tick` every `period`, starting one period from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn every<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_rx.changed() => break,

                    _ = interval.tick() => {
                        if flag.load(Ordering::Acquire) {
                            break;
                        }
                        if tick().is_break() {
                            trace!(task = name, "Periodic task finished");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            cancel_tx,
            cancelled,
            handle,
        }
    }

    /// Run `fire` once after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn after<F>(name: &'static str, delay: Duration, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = cancel_rx.changed() => {}

                _ = time::sleep(delay) => {
                    if !flag.load(Ordering::Acquire) {
                        fire();
                    }
                }
            }
        });

        Self {
            name,
            cancel_tx,
            cancelled,
            handle,
        }
    }

    /// Stop the task. Safe to call any number of times.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            trace!(task = self.name, "Cancelling scheduled task");
            self.cancel_tx.send_replace(true);
        }
    }

    /// True once `cancel()` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once the task body has exited, for any reason.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Task name, for log lines.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        (count.clone(), count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_first_tick_after_one_period() {
        let (count, seen) = counter();
        let _task = ScheduledTask::every("pulse", Duration::from_secs(1), move || {
            count.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        time::sleep(Duration::from_millis(999)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks_and_is_idempotent() {
        let (count, seen) = counter();
        let task = ScheduledTask::every("pulse", Duration::from_secs(1), move || {
            count.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });

        time::sleep(Duration::from_millis(2500)).await;
        task.cancel();
        task.cancel();
        assert!(task.is_cancelled());

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_ends_periodic_task() {
        let (count, seen) = counter();
        let task = ScheduledTask::every("pulse", Duration::from_secs(1), move || {
            if count.fetch_add(1, Ordering::SeqCst) == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(task.is_finished());
        assert!(!task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let (count, seen) = counter();
        let _task = ScheduledTask::after("deadline", Duration::from_secs(40), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        time::sleep(Duration::from_secs(39)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (count, seen) = counter();
        let task = ScheduledTask::after("deadline", Duration::from_secs(1), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        drop(task);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
