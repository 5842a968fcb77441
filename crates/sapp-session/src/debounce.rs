//! Cancellable delayed callbacks

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default delay before a user transcription replace is applied
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Runs at most one delayed callback at a time.
///
/// Scheduling a new callback cancels the one still waiting, so only the most
/// recently scheduled callback in a burst fires.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<CancellationToken>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `fire` after the delay unless cancelled or superseded first
    pub fn schedule<F>(&mut self, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();

        let token = CancellationToken::new();
        self.pending = Some(token.clone());
        let delay = self.delay;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        fire();
                        token.cancel();
                    }
                }
            }
        });
    }

    /// Cancel the pending callback, if any
    pub fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
