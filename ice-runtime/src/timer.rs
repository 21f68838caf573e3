//! Shared timer for ACM scans, retry delays and invocation timeouts.

use std::sync::Arc;
use std::time::Duration;

use ice_core::{IceError, Result};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::runtime::{Runtime, RuntimeExt};

/// Handle to a scheduled task. Dropping the handle does not cancel the task.
#[derive(Debug, Clone)]
pub struct TimerTask {
    token: CancellationToken,
}

impl TimerTask {
    /// Cancels the task. Returns false if it was already canceled.
    pub fn cancel(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Returns true once the task has been canceled or the timer destroyed.
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A timer that runs one-shot and repeated tasks on the [`Runtime`].
///
/// Destroying the timer cancels every outstanding task.
#[derive(Debug, Clone)]
pub struct Timer {
    runtime: Arc<dyn Runtime>,
    shutdown: CancellationToken,
}

impl Timer {
    /// Creates a timer that spawns its tasks on `runtime`.
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            shutdown: CancellationToken::new(),
        }
    }

    fn task_token(&self) -> Result<CancellationToken> {
        if self.shutdown.is_cancelled() {
            return Err(IceError::CommunicatorDestroyed);
        }
        Ok(self.shutdown.child_token())
    }

    /// Runs `f` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Result<TimerTask>
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.task_token()?;
        let task = token.clone();
        let sleep = self.runtime.sleep(delay);
        self.runtime.spawn(async move {
            tokio::select! {
                _ = task.cancelled() => {}
                _ = sleep => {
                    if !task.is_cancelled() {
                        task.cancel();
                        f();
                    }
                }
            }
        });
        Ok(TimerTask { token })
    }

    /// Runs `f` every `period`, starting one period from now.
    pub fn schedule_repeated<F>(&self, period: Duration, mut f: F) -> Result<TimerTask>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(IceError::Configuration(
                "repeated timer period must not be zero".to_string(),
            ));
        }
        let token = self.task_token()?;
        let task = token.clone();
        self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task.cancelled() => break,
                    _ = ticker.tick() => f(),
                }
            }
        });
        Ok(TimerTask { token })
    }

    /// Returns the runtime the timer spawns its tasks on.
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Cancels every outstanding task and rejects new ones.
    pub fn destroy(&self) {
        self.shutdown.cancel();
    }

    /// Returns true once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let timer = Timer::new(TokioRuntime::shared());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        timer
            .schedule(Duration::from_millis(50), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let timer = Timer::new(TokioRuntime::shared());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = timer
            .schedule(Duration::from_millis(50), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(task.cancel());
        assert!(!task.cancel());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_until_canceled() {
        let timer = Timer::new(TokioRuntime::shared());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let task = timer
            .schedule_repeated(Duration::from_millis(10), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        task.cancel();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 4, "seen={seen}");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_destroy_rejects_new_tasks() {
        let timer = Timer::new(TokioRuntime::shared());
        let task = timer.schedule(Duration::from_secs(60), || {}).unwrap();
        timer.destroy();
        assert!(task.is_canceled());
        assert!(matches!(
            timer.schedule(Duration::from_millis(1), || {}),
            Err(IceError::CommunicatorDestroyed)
        ));
    }
}
