//! Fixed-interval background tasks.
//!
//! Registry pruning, stats trimming and response flushing all run on a
//! `Ticker`: a spawned task that calls a closure once per period until it is
//! stopped. Stopping is idempotent and may happen from any thread; dropping
//! the ticker stops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Handle to a running periodic task.
#[derive(Debug)]
pub struct Ticker {
    name: &'static str,
    stopped: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    /// Spawn a task that calls `tick` every `period`, first after one full
    /// period has elapsed. Must be called from within a Tokio runtime.
    pub fn start<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                tick();
            }
            tracing::trace!(ticker = name, "Ticker exited");
        });

        tracing::debug!(ticker = name, period_ms = period.as_millis() as u64, "Ticker started");

        Self {
            name,
            stopped,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the ticker. No tick starts after this returns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = self.handle.lock().expect("ticker mutex poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }
        tracing::debug!(ticker = self.name, "Ticker stopped");
    }

    /// False once `stop` has been called or the ticker was dropped.
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    /// Label used in this ticker's log lines.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_ticker(period: Duration) -> (Ticker, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let ticker = Ticker::start("test", period, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (ticker, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let (ticker, count) = counting_ticker(Duration::from_secs(10));

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(ticker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (ticker, count) = counting_ticker(Duration::from_millis(10));

        time::sleep(Duration::from_millis(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        ticker.stop();
        ticker.stop();
        assert!(!ticker.is_running());

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops() {
        let (ticker, count) = counting_ticker(Duration::from_millis(10));
        drop(ticker);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
