//! Launch/total deadline composition.
//!
//! A run has two clocks. The launch deadline bounds the time until the run is
//! marked started; the total deadline bounds the whole run and is enforced by
//! the execution strategy itself. This module folds the launch watchdog and
//! a caller-supplied token into one [`CancellationToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time budget for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    /// Bound on the whole run
    pub timeout: Duration,

    /// Bound on the time until the app shows activity
    pub launch_timeout: Duration,
}

impl RunBudget {
    pub fn new(timeout: Duration, launch_timeout: Duration) -> Self {
        Self {
            timeout,
            launch_timeout,
        }
    }

    /// The launch deadline never exceeds the total deadline
    pub fn effective_launch_timeout(&self) -> Duration {
        self.launch_timeout.min(self.timeout)
    }

    /// Budget with `elapsed` deducted from the launch part only
    pub fn after_setup(&self, elapsed: Duration) -> Self {
        Self {
            timeout: self.timeout,
            launch_timeout: self.launch_timeout.saturating_sub(elapsed),
        }
    }
}

/// Set once when the run starts; never reset
#[derive(Debug, Default)]
pub struct RunStartedFlag(AtomicBool);

impl RunStartedFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run started. Returns `true` on the first call only.
    pub fn mark_started(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation derived from a launch watchdog and an external token.
///
/// The derived token cancels when the external token cancels, or when the
/// launch deadline passes before [`mark_started`](Self::mark_started) was
/// called. It never cancels because of the total deadline. Dropping this
/// value stops the watchdog.
#[derive(Debug)]
pub struct ComposedCancellation {
    token: CancellationToken,
    started: Arc<RunStartedFlag>,
    watchdog_fired: Arc<AtomicBool>,
    watchdog: JoinHandle<()>,
}

impl ComposedCancellation {
    /// Arm the launch watchdog. Must be called inside a tokio runtime.
    pub fn compose(budget: RunBudget, external: &CancellationToken) -> Self {
        let token = external.child_token();
        let started = Arc::new(RunStartedFlag::new());
        let watchdog_fired = Arc::new(AtomicBool::new(false));
        let deadline = budget.effective_launch_timeout();

        let watchdog = tokio::spawn({
            let token = token.clone();
            let started = started.clone();
            let watchdog_fired = watchdog_fired.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        // The flag is read exactly once, here
                        if started.is_started() {
                            debug!(?deadline, "Launch deadline passed after run started");
                        } else {
                            warn!(?deadline, "Run did not start within the launch timeout, cancelling");
                            watchdog_fired.store(true, Ordering::SeqCst);
                            token.cancel();
                        }
                    }
                }
            }
        });

        Self {
            token,
            started,
            watchdog_fired,
            watchdog,
        }
    }

    /// The derived token to hand to the execution strategy
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Disarm the launch watchdog
    pub fn mark_started(&self) -> bool {
        self.started.mark_started()
    }

    /// Whether the cancellation came from the launch watchdog
    pub fn cancelled_by_watchdog(&self) -> bool {
        self.watchdog_fired.load(Ordering::SeqCst)
    }
}

impl Drop for ComposedCancellation {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_effective_launch_timeout() {
        let budget = RunBudget::new(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(budget.effective_launch_timeout(), Duration::from_secs(10));

        let budget = RunBudget::new(Duration::from_secs(5), Duration::from_secs(10));
        assert_eq!(budget.effective_launch_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_after_setup_saturates() {
        let budget = RunBudget::new(Duration::from_secs(60), Duration::from_secs(10));
        let adjusted = budget.after_setup(Duration::from_secs(3));
        assert_eq!(adjusted.launch_timeout, Duration::from_secs(7));
        assert_eq!(adjusted.timeout, Duration::from_secs(60));

        let adjusted = budget.after_setup(Duration::from_secs(30));
        assert_eq!(adjusted.launch_timeout, Duration::ZERO);
    }

    #[test]
    fn test_started_flag_set_once() {
        let flag = RunStartedFlag::new();
        assert!(!flag.is_started());
        assert!(flag.mark_started());
        assert!(!flag.mark_started());
        assert!(flag.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_launch_deadline_when_not_started() {
        let external = CancellationToken::new();
        let budget = RunBudget::new(Duration::from_secs(60), Duration::from_secs(5));
        let composed = ComposedCancellation::compose(budget, &external);

        let start = Instant::now();
        composed.token().cancelled().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(5) + Duration::from_millis(10));
        assert!(composed.cancelled_by_watchdog());
        assert!(!external.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_deadline_caps_launch_window() {
        let external = CancellationToken::new();
        let budget = RunBudget::new(Duration::from_secs(3), Duration::from_secs(20));
        let composed = ComposedCancellation::compose(budget, &external);

        let start = Instant::now();
        composed.token().cancelled().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(3) + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_just_before_deadline_never_fires() {
        let external = CancellationToken::new();
        let budget = RunBudget::new(Duration::from_secs(60), Duration::from_secs(5));
        let composed = ComposedCancellation::compose(budget, &external);

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        composed.mark_started();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!composed.token().is_cancelled());
        assert!(!composed.cancelled_by_watchdog());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation_propagates_immediately() {
        let external = CancellationToken::new();
        let budget = RunBudget::new(Duration::from_secs(60), Duration::from_secs(5));
        let composed = ComposedCancellation::compose(budget, &external);
        composed.mark_started();

        external.cancel();
        assert!(composed.token().is_cancelled());
        assert!(!composed.cancelled_by_watchdog());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_and_watchdog_cancel_once() {
        let external = CancellationToken::new();
        let budget = RunBudget::new(Duration::from_secs(60), Duration::from_secs(1));
        let composed = ComposedCancellation::compose(budget, &external);

        composed.token().cancelled().await;
        external.cancel();
        assert!(composed.token().is_cancelled());
    }
}
