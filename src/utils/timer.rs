//! Deadline timer utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use tokio::time::{self, Duration, Instant, Sleep};

/// Re-armable deadline timer. Unlike a plain `sleep()`, the inner future can
/// be awaited multiple times and reset to an earlier or later instant, which
/// is what a sorted-deadline sweeper needs when a sooner deadline shows up.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub(crate) struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Deadline currently armed, `None` if disarmed.
    deadline: Option<Instant>,
}

impl Timer {
    /// Creates a new disarmed timer.
    pub(crate) fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            deadline: None,
        }
    }

    /// Currently armed deadline, if any.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arms the timer to fire at given instant, replacing any earlier arming.
    pub(crate) fn kickoff_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
        self.sleep.as_mut().reset(deadline);
    }

    /// Disarms the timer; `timeout()` then never resolves until re-armed.
    pub(crate) fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Waits for the armed deadline to pass. Pends forever if disarmed.
    /// Typically, this should be used as a branch of a `tokio::select!`.
    pub(crate) async fn timeout(&mut self) {
        if self.deadline.is_none() {
            futures::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.deadline = None;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let timer = Timer::new();
        assert!(timer.deadline().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_disarmed_pends() {
        let mut timer = Timer::new();
        let fired =
            time::timeout(Duration::from_millis(100), timer.timeout()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_rearm_earlier() {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.kickoff_at(start + Duration::from_secs(60));
        timer.kickoff_at(start + Duration::from_millis(150));
        timer.timeout().await;
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(5));
        assert!(timer.deadline().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel() {
        let mut timer = Timer::new();
        timer.kickoff_at(Instant::now() + Duration::from_millis(50));
        timer.cancel();
        let fired =
            time::timeout(Duration::from_millis(200), timer.timeout()).await;
        assert!(fired.is_err());
    }
}
